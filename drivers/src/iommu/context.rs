// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use hyp_pages::{CacheMaintenance, Fill, PageAllocator, PhysAddr, PAGE_SIZE};

use super::entry::{table, HwEntry, PRESENT};
use super::error::*;

const ADDR_MASK: u64 = !(PAGE_SIZE - 1);
const DOMAIN_SHIFT: u64 = 8;

/// The root table and per-bus context tables shared by every remapping unit.
///
/// The root table has one entry per bus pointing to a context table with one entry per
/// device/function. Context tables are allocated the first time a device on their bus is
/// configured and are never freed before the tables themselves are dropped.
pub struct ContextTables {
    root: PhysAddr,
    pages: &'static dyn PageAllocator,
    cache: &'static dyn CacheMaintenance,
}

impl ContextTables {
    /// Allocates an empty root table.
    pub fn new(
        pages: &'static dyn PageAllocator,
        cache: &'static dyn CacheMaintenance,
    ) -> Result<Self> {
        let root = pages
            .alloc(0, Fill::Bits0)
            .ok_or(Error::InsufficientMemory)?;
        cache.clean(root, PAGE_SIZE as usize);
        Ok(Self { root, pages, cache })
    }

    /// Returns the address programmed into the root-table address register.
    pub fn root_address(&self) -> PhysAddr {
        self.root
    }

    fn root_entries(&self) -> &[HwEntry] {
        // Safety: the root table is owned by `self`.
        unsafe { table(self.root) }
    }

    // Returns the context table for `bus`, allocating it when `create` is set.
    fn context_table(&self, bus: u8, create: bool) -> Result<Option<&[HwEntry]>> {
        let entry = &self.root_entries()[bus as usize];
        let lo = entry.lo();
        let addr = if lo & PRESENT != 0 {
            PhysAddr::new(lo & ADDR_MASK)
        } else if !create {
            return Ok(None);
        } else {
            let page = self
                .pages
                .alloc(0, Fill::Bits0)
                .ok_or(Error::InsufficientMemory)?;
            self.cache.clean(page, PAGE_SIZE as usize);
            match entry.publish_lo(page.bits() | PRESENT, self.cache) {
                Ok(()) => page,
                Err(winner) => {
                    // Another processor published a table for this bus first.
                    // Safety: `page` was never reachable by the unit.
                    unsafe { self.pages.free(page, 0) };
                    PhysAddr::new(winner & ADDR_MASK)
                }
            }
        };
        // Safety: context tables live as long as `self`.
        Ok(Some(unsafe { table(addr) }))
    }

    /// Points requester `rid` at the second-level table `root` with `levels` levels, tagging its
    /// translations with `domain`. An existing entry for `rid` is replaced.
    pub fn attach(&self, rid: u16, root: PhysAddr, levels: usize, domain: u16) -> Result<()> {
        let [bus, devfn] = rid.to_be_bytes();
        if let Some(ctx) = self.context_table(bus, true)? {
            let hi = (levels as u64 - 2) | (domain as u64) << DOMAIN_SHIFT;
            ctx[devfn as usize].replace(hi, root.bits() | PRESENT, self.cache);
        }
        Ok(())
    }

    /// Blocks DMA from requester `rid`.
    pub fn detach(&self, rid: u16) {
        let [bus, devfn] = rid.to_be_bytes();
        if let Ok(Some(ctx)) = self.context_table(bus, false) {
            ctx[devfn as usize].clear(self.cache);
        }
    }

    /// Returns the raw (low, high) halves of the context entry for `rid`, if its bus has a table.
    pub fn entry(&self, rid: u16) -> Option<(u64, u64)> {
        let [bus, devfn] = rid.to_be_bytes();
        let ctx = self.context_table(bus, false).ok()??;
        let entry = &ctx[devfn as usize];
        Some((entry.lo(), entry.hi()))
    }
}

impl Drop for ContextTables {
    fn drop(&mut self) {
        for entry in self.root_entries() {
            let lo = entry.lo();
            if lo & PRESENT != 0 {
                // Safety: context tables are owned by `self` and the units no longer use them.
                unsafe { self.pages.free(PhysAddr::new(lo & ADDR_MASK), 0) };
            }
        }
        // Safety: as above.
        unsafe { self.pages.free(self.root, 0) };
    }
}
