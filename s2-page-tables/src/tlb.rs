// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Instructions that switch and flush second-stage translation regimes. On hosted builds they do
//! nothing so the translation code can be exercised by unit tests.

#[cfg(any(
    all(target_arch = "aarch64", target_os = "none"),
    all(target_arch = "x86_64", target_os = "none")
))]
use core::arch::asm;

/// Loads `value` into VTTBR_EL2, making its VMID and root table current for stage 2.
pub fn write_vttbr(value: u64) {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    // Safety: the caller passes a VMID and a valid root table, and the write only affects guest
    // translation.
    unsafe {
        asm!("msr vttbr_el2, {}", "isb", in(reg) value, options(nostack));
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    let _ = value;
}

/// Invalidates all stage-1 and stage-2 translations of the current VMID on every processor in the
/// inner-shareable domain.
pub fn flush_current_vmid() {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    // Safety: TLBI's only side effect is to invalidate address translation caches.
    unsafe {
        asm!(
            "dsb ishst",
            "tlbi vmalls12e1is",
            "dsb ish",
            "isb",
            options(nostack)
        );
    }
}

// VMCS field encoding of the EPT pointer.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
const VMCS_EPTP: u64 = 0x201a;

/// Writes `value` to the EPT pointer field of the current VMCS.
pub fn write_eptp(value: u64) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // Safety: a VMCS is current on this processor and `value` references a valid root table.
    unsafe {
        asm!("vmwrite {}, {}", in(reg) VMCS_EPTP, in(reg) value, options(nostack));
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = value;
}

/// Executes a single-context INVEPT for the EPT pointer `value`.
pub fn invept_single(value: u64) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let descriptor: [u64; 2] = [value, 0];
        // Safety: INVEPT's only side effect is to invalidate address translation caches, and the
        // descriptor outlives the instruction.
        unsafe {
            asm!("invept {}, [{}]", in(reg) 1u64, in(reg) &descriptor, options(nostack));
        }
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = value;
}
