// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use core::mem::size_of;
use core::sync::atomic::{AtomicU64, Ordering};
use hyp_arch::dma_wmb;
use hyp_pages::{CacheMaintenance, PhysAddr};
use static_assertions::const_assert_eq;

/// Bit 0 of the low half marks context, root and interrupt-remap entries present.
pub(crate) const PRESENT: u64 = 1 << 0;

/// A 128-bit entry of a table the remapping unit reads with DMA. The unit may not snoop processor
/// caches, so every write is cleaned to memory.
#[repr(C)]
pub(crate) struct HwEntry {
    lo: AtomicU64,
    hi: AtomicU64,
}

const_assert_eq!(size_of::<HwEntry>(), 16);

impl HwEntry {
    pub fn lo(&self) -> u64 {
        self.lo.load(Ordering::Acquire)
    }

    pub fn hi(&self) -> u64 {
        self.hi.load(Ordering::Acquire)
    }

    /// Writes a present entry. The low half carries the present bit and is written last so the
    /// unit never sees it present with a stale high half.
    pub fn set(&self, hi: u64, lo: u64, cache: &dyn CacheMaintenance) {
        self.hi.store(hi, Ordering::Relaxed);
        dma_wmb();
        self.lo.store(lo, Ordering::Release);
        self.clean(cache);
    }

    /// Rewrites the entry with a present one. A present entry is first made non-present and cleaned
    /// so the unit never reads a mix of the old and new halves.
    pub fn replace(&self, hi: u64, lo: u64, cache: &dyn CacheMaintenance) {
        if self.lo() & PRESENT != 0 {
            self.lo.store(0, Ordering::Relaxed);
            dma_wmb();
            self.clean(cache);
        }
        self.set(hi, lo, cache);
    }

    /// Clears the entry, present bit first.
    pub fn clear(&self, cache: &dyn CacheMaintenance) {
        self.lo.store(0, Ordering::Relaxed);
        dma_wmb();
        self.hi.store(0, Ordering::Release);
        self.clean(cache);
    }

    /// Publishes `lo` if the low half is still zero. Returns the value found otherwise.
    pub fn publish_lo(&self, lo: u64, cache: &dyn CacheMaintenance) -> Result<(), u64> {
        self.lo
            .compare_exchange(0, lo, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| self.clean(cache))
    }

    pub fn address(&self) -> PhysAddr {
        PhysAddr::from_ptr(self as *const Self)
    }

    fn clean(&self, cache: &dyn CacheMaintenance) {
        cache.clean(self.address(), size_of::<Self>());
    }
}

/// Views the 4kB table page at `table` as entries.
///
/// # Safety
///
/// `table` must be a page owned by the caller for at least `'a`.
pub(crate) unsafe fn table<'a>(table: PhysAddr) -> &'a [HwEntry] {
    core::slice::from_raw_parts(table.as_ptr::<HwEntry>(), 256)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyp_pages::test_stubs::CountingCache;

    #[test]
    fn writes_are_cleaned() {
        let cache = CountingCache::default();
        let entry = HwEntry {
            lo: AtomicU64::new(0),
            hi: AtomicU64::new(0),
        };
        entry.set(0x2_0100, 0x5000 | PRESENT, &cache);
        assert_eq!((entry.lo(), entry.hi()), (0x5001, 0x2_0100));
        assert!(cache.covered(entry.address(), 16));
        entry.clear(&cache);
        assert_eq!((entry.lo(), entry.hi()), (0, 0));
        assert_eq!(cache.cleans(), 2);
        assert!(entry.publish_lo(0x7001, &cache).is_ok());
        assert_eq!(entry.publish_lo(0x8001, &cache), Err(0x7001));
        assert_eq!(cache.cleans(), 3);
    }

    #[test]
    fn replace_only_adds_a_clean_when_present() {
        let cache = CountingCache::default();
        let entry = HwEntry {
            lo: AtomicU64::new(0),
            hi: AtomicU64::new(0),
        };
        entry.replace(0x101, 0x5001, &cache);
        assert_eq!(cache.cleans(), 1);
        entry.replace(0x202, 0x6001, &cache);
        assert_eq!((entry.lo(), entry.hi()), (0x6001, 0x202));
        assert_eq!(cache.cleans(), 3);
    }
}
