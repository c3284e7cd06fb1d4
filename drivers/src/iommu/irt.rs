// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use hyp_pages::{CacheMaintenance, Fill, PageAllocator, PhysAddr, PAGE_SIZE};

use super::entry::{table, HwEntry, PRESENT};
use super::error::*;

/// Number of entries in the interrupt-remap table.
pub const IRT_ENTRIES: usize = 256;

// Table size field of the IRTA register: the table holds 2^(S + 1) entries.
const IRTA_SIZE: u64 = 7;
// Verify the requester id of the interrupt's source.
const SOURCE_VALIDATION: u64 = 1 << 18;
const DESTINATION_SHIFT: u64 = 40;
const VECTOR_SHIFT: u64 = 16;
const TRIGGER_SHIFT: u64 = 4;

/// The interrupt-remap table shared by every remapping unit.
pub struct RemapTable {
    base: PhysAddr,
    pages: &'static dyn PageAllocator,
    cache: &'static dyn CacheMaintenance,
}

impl RemapTable {
    pub fn new(
        pages: &'static dyn PageAllocator,
        cache: &'static dyn CacheMaintenance,
    ) -> Result<Self> {
        let base = pages
            .alloc(0, Fill::Bits0)
            .ok_or(Error::InsufficientMemory)?;
        cache.clean(base, PAGE_SIZE as usize);
        Ok(Self { base, pages, cache })
    }

    pub fn base_address(&self) -> PhysAddr {
        self.base
    }

    /// Returns the value of the interrupt-remap table address register.
    pub fn irta(&self) -> u64 {
        self.base.bits() | IRTA_SIZE
    }

    fn entries(&self) -> &[HwEntry] {
        // Safety: the table page is owned by `self`.
        unsafe { table(self.base) }
    }

    /// Routes interrupt `index`, accepted only from requester `rid`, to vector `vector` of the
    /// processor with APIC id `aid`. `level` selects level-triggered delivery.
    pub fn set(&self, index: usize, rid: u16, aid: u32, vector: u8, level: bool) {
        assert!(index < IRT_ENTRIES, "interrupt remap index {index} out of range");
        let hi = SOURCE_VALIDATION | rid as u64;
        let lo = (aid as u64) << DESTINATION_SHIFT
            | (vector as u64) << VECTOR_SHIFT
            | (level as u64) << TRIGGER_SHIFT
            | PRESENT;
        self.entries()[index].set(hi, lo, self.cache);
    }

    /// Returns the raw (low, high) halves of entry `index`.
    pub fn entry(&self, index: usize) -> (u64, u64) {
        let entry = &self.entries()[index];
        (entry.lo(), entry.hi())
    }
}

impl Drop for RemapTable {
    fn drop(&mut self) {
        // Safety: the table is owned by `self` and the units no longer use it.
        unsafe { self.pages.free(self.base, 0) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyp_pages::test_stubs::{CountingCache, HeapPages};

    #[test]
    fn entry_layout() {
        let cache = CountingCache::leaked();
        let irt = RemapTable::new(HeapPages::leaked(), cache).unwrap();
        irt.set(3, 0x00f8, 2, 0x41, true);
        assert_eq!(irt.entry(3), (0x0200_0041_0011, 0x4_00f8));
        assert!(cache.covered(PhysAddr::new(irt.base_address().bits() + 48), 16));
        assert_eq!(irt.irta() & 0xfff, 7);
    }

    #[test]
    #[should_panic]
    fn index_out_of_range() {
        let irt = RemapTable::new(HeapPages::leaked(), CountingCache::leaked()).unwrap();
        irt.set(IRT_ENTRIES, 0, 0, 0, false);
    }
}
