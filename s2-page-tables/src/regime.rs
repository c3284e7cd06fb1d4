// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use core::sync::atomic::{AtomicU64, Ordering};
use hyp_pages::PhysAddr;

use crate::cpu_set::{CpuId, MAX_CPUS};
use crate::ept::Ept;
use crate::npt::Npt;
use crate::page_table::PageTableFormat;
use crate::tlb;

/// Tag of a translation regime: the VMID of a stage-2 space or the domain identifier of a DMA
/// space. Cached translations are tagged with it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegimeId(u16);

impl RegimeId {
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    pub const fn bits(&self) -> u16 {
        self.0
    }
}

/// The regime value last loaded on each processor. Zero means nothing loaded.
///
/// Each slot is only accessed by its own processor.
pub struct LoadedRoots {
    slots: [AtomicU64; MAX_CPUS],
}

impl LoadedRoots {
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const EMPTY: AtomicU64 = AtomicU64::new(0);
        Self {
            slots: [EMPTY; MAX_CPUS],
        }
    }

    /// Returns the value loaded on `cpu`.
    pub fn current(&self, cpu: CpuId) -> u64 {
        self.slots[cpu.raw()].load(Ordering::Relaxed)
    }

    /// Records `value` as loaded on `cpu`. Returns true if it differs from what was loaded.
    pub fn replace(&self, cpu: CpuId, value: u64) -> bool {
        self.slots[cpu.raw()].swap(value, Ordering::Relaxed) != value
    }

    /// Forgets what is loaded on `cpu`, forcing the next switch to reload.
    pub fn reset(&self, cpu: CpuId) {
        self.slots[cpu.raw()].store(0, Ordering::Relaxed);
    }
}

impl Default for LoadedRoots {
    fn default() -> Self {
        Self::new()
    }
}

/// Processor control of one kind of translation regime.
pub trait RegimeControl: 'static {
    /// Table format walked by the regime's hardware.
    type Format: PageTableFormat;

    /// Combines a regime tag and a root table into the value loaded into hardware.
    fn compose(regime: RegimeId, root: PhysAddr) -> u64;

    /// Makes `value` the current regime of the calling processor.
    fn load(value: u64);

    /// Flushes the cached translations of the regime `value`. For regimes that flush by the
    /// current tag, `value` must already be loaded.
    fn flush(value: u64);

    /// Returns the per-processor record of loaded values.
    fn loaded_roots() -> &'static LoadedRoots;
}

static VTTBR_LOADED: LoadedRoots = LoadedRoots::new();
static EPTP_LOADED: LoadedRoots = LoadedRoots::new();

/// The aarch64 stage-2 regime: VTTBR_EL2 holding a VMID and an `Npt` root.
pub enum Vttbr {}

const VTTBR_VMID_SHIFT: u64 = 48;

impl RegimeControl for Vttbr {
    type Format = Npt;

    fn compose(regime: RegimeId, root: PhysAddr) -> u64 {
        (regime.bits() as u64) << VTTBR_VMID_SHIFT | root.bits()
    }

    fn load(value: u64) {
        tlb::write_vttbr(value);
    }

    fn flush(_value: u64) {
        tlb::flush_current_vmid();
    }

    fn loaded_roots() -> &'static LoadedRoots {
        &VTTBR_LOADED
    }
}

/// The x86 EPT regime: the VMCS EPT pointer to an `Ept` root.
pub enum Eptp {}

const EPTP_MEMTYPE_WB: u64 = 6;
const EPTP_WALK_SHIFT: u64 = 3;

impl RegimeControl for Eptp {
    type Format = Ept;

    // EPT translations are tagged by the pointer value itself.
    fn compose(_regime: RegimeId, root: PhysAddr) -> u64 {
        root.bits() | ((Ept::LEVELS as u64 - 1) << EPTP_WALK_SHIFT) | EPTP_MEMTYPE_WB
    }

    fn load(value: u64) {
        tlb::write_eptp(value);
    }

    fn flush(value: u64) {
        tlb::invept_single(value);
    }

    fn loaded_roots() -> &'static LoadedRoots {
        &EPTP_LOADED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vttbr_value() {
        let value = Vttbr::compose(RegimeId::new(0x2a), PhysAddr::new(0x8_1234_5000));
        assert_eq!(value, 0x002a_0008_1234_5000);
    }

    #[test]
    fn eptp_value() {
        let value = Eptp::compose(RegimeId::new(7), PhysAddr::new(0x1234_5000));
        assert_eq!(value, 0x1234_501e);
    }

    #[test]
    fn loaded_roots_track_changes() {
        let roots = LoadedRoots::new();
        let cpu = CpuId::new(5);
        assert!(roots.replace(cpu, 0x1000));
        assert!(!roots.replace(cpu, 0x1000));
        assert_eq!(roots.current(cpu), 0x1000);
        roots.reset(cpu);
        assert!(roots.replace(cpu, 0x1000));
    }
}
