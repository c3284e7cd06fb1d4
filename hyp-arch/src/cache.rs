// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

#[cfg(all(any(target_arch = "aarch64", target_arch = "x86_64"), target_os = "none"))]
use core::arch::asm;

use hyp_pages::{CacheMaintenance, PhysAddr};

/// Smallest data-cache line size across the supported processors.
const MIN_LINE_SIZE: usize = 32;

/// Cleans lines from the executing processor's data cache to the point of coherency.
///
/// Physical addresses are identity mapped in the hypervisor, so the address to clean is used
/// directly as a virtual address.
pub struct CpuDataCache {
    line_size: usize,
}

impl CpuDataCache {
    /// Creates a cleaner that steps through memory in units of `line_size` bytes. Callers that
    /// have not yet enumerated the cache geometry should use `CpuDataCache::conservative()`.
    pub const fn new(line_size: usize) -> Self {
        Self { line_size }
    }

    /// Returns a cleaner using the smallest line size any supported processor implements.
    pub const fn conservative() -> Self {
        Self::new(MIN_LINE_SIZE)
    }
}

impl CacheMaintenance for CpuDataCache {
    fn clean(&self, addr: PhysAddr, len: usize) {
        let start = addr.bits() & !(self.line_size as u64 - 1);
        let end = addr.bits() + len as u64;
        let mut line = start;
        while line < end {
            clean_line(line);
            line += self.line_size as u64;
        }
        finish_clean();
    }

    fn line_size(&self) -> usize {
        self.line_size
    }
}

// Safety for the asm blocks below: cleaning a cache line writes back dirty data but never changes
// the architectural contents of memory.

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
fn clean_line(addr: u64) {
    unsafe { asm!("dc cvac, {}", in(reg) addr, options(nostack, preserves_flags)) };
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
fn finish_clean() {
    unsafe { asm!("dsb sy", options(nostack, preserves_flags)) };
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn clean_line(addr: u64) {
    unsafe { asm!("clflush [{}]", in(reg) addr, options(nostack, preserves_flags)) };
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn finish_clean() {
    unsafe { asm!("mfence", options(nostack, preserves_flags)) };
}

// No caches to maintain when testing.
#[cfg(not(all(any(target_arch = "aarch64", target_arch = "x86_64"), target_os = "none")))]
fn clean_line(_addr: u64) {}
#[cfg(not(all(any(target_arch = "aarch64", target_arch = "x86_64"), target_os = "none")))]
fn finish_clean() {}
