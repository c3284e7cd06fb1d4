// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use alloc::vec::Vec;
use core::cmp;
use core::marker::PhantomData;
use hyp_pages::{
    order_bytes, CacheMaintenance, Fill, GuestPhysAddr, PageAllocator, PhysAddr, PAGE_SHIFT,
    PAGE_SIZE,
};
use spin::Mutex;

use crate::attr::PageAttrs;
use crate::error::{Error, Result};
use crate::pte::Pte;
use crate::walkers::{WalkGuard, Walkers};

/// Geometry and entry encoding of a hardware translation table format.
///
/// Levels are numbered from 0 (4kB leaves) up to `LEVELS - 1` (the root). Every table, the root
/// included, occupies exactly one 4kB page.
pub trait PageTableFormat: Sized + Send + Sync + 'static {
    /// Number of levels in the tree.
    const LEVELS: usize;
    /// Number of input address bits translated per level.
    const BITS_PER_LEVEL: u32;
    /// Highest level at which a leaf (block) entry may be written.
    const MAX_LEAF_LEVEL: usize;
    /// Bits of an entry holding the output address.
    const ADDR_MASK: u64;

    /// Returns the attribute bits of an entry pointing to a next-level table.
    fn table_attr() -> u64;

    /// Returns the attribute bits of a leaf at `level` mapping with `attrs`, or 0 if `attrs`
    /// grants no access.
    fn page_attr(level: usize, attrs: PageAttrs) -> u64;

    /// Decodes the attributes of the leaf `raw`.
    fn page_attrs(raw: u64) -> PageAttrs;

    /// Returns true if `raw` maps something, either a table or a leaf.
    fn is_present(raw: u64) -> bool;

    /// Returns true if `raw`, found at `level`, points to a next-level table.
    fn is_table(raw: u64, level: usize) -> bool;

    /// Returns the number of entries in one table.
    fn entries() -> usize {
        1 << Self::BITS_PER_LEVEL
    }

    /// Returns the order, in 4kB pages, of the region covered by one entry at `level`.
    fn level_order(level: usize) -> u32 {
        level as u32 * Self::BITS_PER_LEVEL
    }

    /// Returns the number of input address bits the whole tree translates.
    fn input_bits() -> u32 {
        PAGE_SHIFT + Self::LEVELS as u32 * Self::BITS_PER_LEVEL
    }
}

/// A translation found by `PageTable::lookup`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Translation {
    /// Output address of the start of the leaf's region.
    pub base: PhysAddr,
    /// Order, in 4kB pages, of the region the leaf covers.
    pub order: u32,
    pub attrs: PageAttrs,
    /// The raw leaf entry.
    pub raw: u64,
}

impl Translation {
    /// Returns the output address `gpa` translates to.
    pub fn phys_addr(&self, gpa: GuestPhysAddr) -> PhysAddr {
        let offset = gpa.bits() & (order_bytes(self.order) - 1);
        PhysAddr::new(self.base.bits() + offset)
    }
}

/// A reference to an entry of a tree, as returned by `PageTable::walk`.
///
/// Tables detached from the tree while the reference is alive are not freed until it is dropped.
pub struct EntryRef<'a, F: PageTableFormat> {
    pte: &'a Pte,
    level: usize,
    _guard: WalkGuard<'a>,
    _format: PhantomData<F>,
}

impl<'a, F: PageTableFormat> EntryRef<'a, F> {
    /// Returns the level of the table holding the entry.
    pub fn level(&self) -> usize {
        self.level
    }

    /// Returns the current raw value of the entry.
    pub fn raw(&self) -> u64 {
        self.pte.get()
    }

    /// Returns true if the entry currently points to a next-level table.
    pub fn is_table(&self) -> bool {
        F::is_table(self.raw(), self.level)
    }
}

// Location of one entry: the table page holding it, its index and the table's level.
#[derive(Clone, Copy)]
struct Slot {
    table: PhysAddr,
    index: usize,
    level: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Walk {
    // Stop at the first leaf or absent entry.
    Lookup,
    // Split large leaves on the way down but stop at absent entries.
    Split,
    // Split large leaves and fill absent entries with new tables.
    Create,
}

/// A multi-level translation tree in the layout of `F`.
///
/// The tree owns its table pages. Pages of tables detached by `update` stay allocated until
/// `reclaim_retired` is called after every processor has discarded translations that may refer to
/// them, and until every software walk that started before they were detached has finished.
pub struct PageTable<F: PageTableFormat> {
    root: PhysAddr,
    pages: &'static dyn PageAllocator,
    // Set when a non-coherent walker reads the tree, typically a DMA remapping unit.
    cache: Option<&'static dyn CacheMaintenance>,
    retired: Mutex<Vec<(PhysAddr, usize)>>,
    walkers: Walkers,
    released: core::sync::atomic::AtomicBool,
    _format: PhantomData<F>,
}

impl<F: PageTableFormat> PageTable<F> {
    /// Creates an empty tree, allocating its root table from `pages`.
    pub fn new(pages: &'static dyn PageAllocator) -> Result<Self> {
        Self::with_cache(pages, None)
    }

    /// Creates an empty tree whose writes are cleaned to memory with `cache` when `Some`.
    pub fn with_cache(
        pages: &'static dyn PageAllocator,
        cache: Option<&'static dyn CacheMaintenance>,
    ) -> Result<Self> {
        let root = pages.alloc(0, Fill::Bits0).ok_or(Error::InsufficientMemory)?;
        let tree = Self {
            root,
            pages,
            cache,
            retired: Mutex::new(Vec::new()),
            walkers: Walkers::new(),
            released: core::sync::atomic::AtomicBool::new(false),
            _format: PhantomData,
        };
        tree.clean(root, PAGE_SIZE as usize);
        Ok(tree)
    }

    /// Returns the physical address of the root table.
    pub fn root_address(&self) -> PhysAddr {
        self.root
    }

    /// Returns the largest order a single `update` accepts.
    pub fn max_order() -> u32 {
        F::LEVELS as u32 * F::BITS_PER_LEVEL
    }

    /// Returns the entry translating `gpa` at `level`, creating intermediate tables and splitting
    /// large leaves on the way.
    pub fn walk(&self, gpa: GuestPhysAddr, level: usize) -> Result<EntryRef<'_, F>> {
        if level >= F::LEVELS {
            return Err(Error::OrderTooLarge(F::level_order(level)));
        }
        if gpa.bits() >> F::input_bits() != 0 {
            return Err(Error::AddressOutOfRange(gpa.bits()));
        }
        let guard = self.walkers.enter();
        // Create mode always reaches the target level.
        let slot = self
            .walk_slot(gpa.bits(), level, Walk::Create)?
            .ok_or(Error::InsufficientMemory)?;
        Ok(EntryRef {
            pte: self.pte(slot),
            level: slot.level,
            _guard: guard,
            _format: PhantomData,
        })
    }

    /// Returns the translation of `gpa`, if any.
    pub fn lookup(&self, gpa: GuestPhysAddr) -> Option<Translation> {
        if gpa.bits() >> F::input_bits() != 0 {
            return None;
        }
        let _guard = self.walkers.enter();
        let slot = self.walk_slot(gpa.bits(), 0, Walk::Lookup).ok()??;
        let raw = self.pte(slot).get();
        if !F::is_present(raw) || F::is_table(raw, slot.level) {
            return None;
        }
        Some(Translation {
            base: PhysAddr::new(raw & F::ADDR_MASK),
            order: F::level_order(slot.level),
            attrs: F::page_attrs(raw),
            raw,
        })
    }

    /// Maps (or, when `attrs` grants no access, unmaps) the naturally aligned run of up to
    /// `2^order` pages at `gpa` to `phys`.
    ///
    /// Writes entries at the highest level whose granule fits both the alignment of the addresses
    /// and `order`, but never past the end of one table. Returns the order actually covered, which
    /// may be smaller than `order`; callers iterate for the remainder. Tables displaced by the
    /// update are retired.
    pub fn update(
        &self,
        gpa: GuestPhysAddr,
        phys: PhysAddr,
        order: u32,
        attrs: PageAttrs,
    ) -> Result<u32> {
        let map = attrs.perms.grants_access();
        let v = gpa.bits();
        if !gpa.is_aligned(PAGE_SIZE) {
            return Err(Error::MisalignedAddress(v));
        }
        if map && !phys.is_page_aligned() {
            return Err(Error::MisalignedAddress(phys.bits()));
        }
        if order > Self::max_order() {
            return Err(Error::OrderTooLarge(order));
        }
        if v >> F::input_bits() != 0 {
            return Err(Error::AddressOutOfRange(v));
        }

        let fits = |level: usize| {
            let bytes = order_bytes(F::level_order(level));
            F::level_order(level) <= order
                && gpa.is_aligned(bytes)
                && (!map || phys.is_aligned(bytes))
        };
        let level = (1..=F::MAX_LEAF_LEVEL)
            .rev()
            .find(|&l| fits(l))
            .unwrap_or(0);
        let level_order = F::level_order(level);
        let index = Self::index(v, level);
        // The run of entries stays inside one table and is aligned to its own size.
        let index_align = if index == 0 {
            F::BITS_PER_LEVEL
        } else {
            index.trailing_zeros()
        };
        let covered = cmp::min(order, level_order + cmp::min(index_align, F::BITS_PER_LEVEL));
        let count = 1usize << (covered - level_order);

        let _guard = self.walkers.enter();
        let mode = if map { Walk::Create } else { Walk::Split };
        let Some(slot) = self.walk_slot(v, level, mode)? else {
            // Nothing mapped below an absent entry.
            return Ok(covered);
        };

        let granule = order_bytes(level_order);
        let bits = F::page_attr(level, attrs);
        let table = self.table(slot.table);
        for (i, pte) in table[slot.index..slot.index + count].iter().enumerate() {
            let new = if map {
                ((phys.bits() + i as u64 * granule) & F::ADDR_MASK) | bits
            } else {
                0
            };
            let old = pte.swap(new);
            if F::is_table(old, level) {
                self.retire(PhysAddr::new(old & F::ADDR_MASK), level - 1);
            }
        }
        self.clean(
            PhysAddr::new(slot.table.bits() + (slot.index * 8) as u64),
            count * 8,
        );
        Ok(covered)
    }

    /// Maps `pages` 4kB pages at `gpa` to `phys`, or unmaps them when `attrs` grants no access,
    /// using the largest leaves alignment allows.
    pub fn install(
        &self,
        gpa: GuestPhysAddr,
        phys: PhysAddr,
        pages: u64,
        attrs: PageAttrs,
    ) -> Result<()> {
        pages
            .checked_mul(PAGE_SIZE)
            .and_then(|bytes| gpa.bits().checked_add(bytes))
            .filter(|&end| end <= 1 << F::input_bits())
            .ok_or(Error::AddressOutOfRange(gpa.bits()))?;
        let mut done = 0;
        while done < pages {
            let remaining = pages - done;
            let order = cmp::min(63 - remaining.leading_zeros(), Self::max_order());
            let offset = done << PAGE_SHIFT;
            let covered = self.update(
                GuestPhysAddr::new(gpa.bits() + offset),
                PhysAddr::new(phys.bits().wrapping_add(offset)),
                order,
                attrs,
            )?;
            done += 1 << covered;
        }
        Ok(())
    }

    /// Detaches the retired tables, leaving later retirements for the next call.
    pub(crate) fn take_retired(&self) -> Vec<(PhysAddr, usize)> {
        core::mem::take(&mut *self.retired.lock())
    }

    /// Frees tables previously returned by `take_retired` once every software walk that started
    /// before the call has finished. The caller must not be inside a walk of this tree.
    ///
    /// # Safety
    ///
    /// No hardware walker may still reference the tables.
    pub(crate) unsafe fn free_retired(&self, retired: Vec<(PhysAddr, usize)>) {
        if retired.is_empty() {
            return;
        }
        // Walks that started later begin at the root and cannot reach detached tables.
        self.walkers.wait_for_older();
        for (table, level) in retired {
            self.free_subtree(table, level);
        }
    }

    /// Frees every table retired so far, waiting for software walks that may still reach them.
    ///
    /// # Safety
    ///
    /// Every processor and device that may have cached translations of this tree must have
    /// discarded them since the tables were retired.
    pub unsafe fn reclaim_retired(&self) {
        let retired = self.take_retired();
        self.free_retired(retired);
    }

    /// Returns the number of tables waiting to be reclaimed.
    pub fn retired_tables(&self) -> usize {
        self.retired.lock().len()
    }

    /// Frees every table of the tree, the root included. Later calls do nothing.
    ///
    /// # Safety
    ///
    /// No walker may use the tree during or after the call.
    pub(crate) unsafe fn release(&self) {
        use core::sync::atomic::Ordering;
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.reclaim_retired();
        self.free_subtree(self.root, F::LEVELS - 1);
    }

    fn index(gpa: u64, level: usize) -> usize {
        ((gpa >> (PAGE_SHIFT + F::level_order(level))) as usize) & (F::entries() - 1)
    }

    fn table(&self, table: PhysAddr) -> &[Pte] {
        // Safety: `table` is a page-sized table of this tree. Callers either hold a `WalkGuard`,
        // which keeps tables detached after it was taken allocated, or own the table exclusively.
        // Entries are only accessed atomically.
        unsafe { core::slice::from_raw_parts(table.as_ptr::<Pte>(), F::entries()) }
    }

    fn pte(&self, slot: Slot) -> &Pte {
        &self.table(slot.table)[slot.index]
    }

    fn clean(&self, addr: PhysAddr, len: usize) {
        if let Some(cache) = self.cache {
            cache.clean(addr, len);
        }
    }

    fn walk_slot(&self, gpa: u64, target: usize, mode: Walk) -> Result<Option<Slot>> {
        let mut table = self.root;
        let mut level = F::LEVELS - 1;
        loop {
            let slot = Slot {
                table,
                index: Self::index(gpa, level),
                level,
            };
            if level == target {
                return Ok(Some(slot));
            }
            let pte = self.pte(slot);
            let raw = pte.get();
            if F::is_table(raw, level) {
                table = PhysAddr::new(raw & F::ADDR_MASK);
                level -= 1;
                continue;
            }
            match (F::is_present(raw), mode) {
                (true, Walk::Lookup) => return Ok(Some(slot)),
                (false, Walk::Lookup | Walk::Split) => return Ok(None),
                (true, _) => self.split(pte, raw, level)?,
                (false, Walk::Create) => self.fill(pte)?,
            }
            // Re-read the entry: either our table or a concurrent walker's is now in place.
        }
    }

    // Publishes a new empty table in the absent entry `pte`.
    fn fill(&self, pte: &Pte) -> Result<()> {
        let page = self
            .pages
            .alloc(0, Fill::Bits0)
            .ok_or(Error::InsufficientMemory)?;
        self.clean(page, PAGE_SIZE as usize);
        if pte.publish(0, page.bits() | F::table_attr()).is_err() {
            // Another walker published a table first.
            // Safety: `page` was never reachable from the tree.
            unsafe { self.pages.free(page, 0) };
        } else {
            self.clean(PhysAddr::from_ptr(pte as *const Pte), 8);
        }
        Ok(())
    }

    // Replaces the large leaf `raw` at `level` with a table of leaves one level down that map the
    // same region with the same attributes.
    fn split(&self, pte: &Pte, raw: u64, level: usize) -> Result<()> {
        let page = self
            .pages
            .alloc(0, Fill::Bits0)
            .ok_or(Error::InsufficientMemory)?;
        let child_level = level - 1;
        let bits = F::page_attr(child_level, F::page_attrs(raw));
        let base = raw & F::ADDR_MASK;
        let step = order_bytes(F::level_order(child_level));
        for (i, child) in self.table(page).iter().enumerate() {
            child.init(((base + i as u64 * step) & F::ADDR_MASK) | bits);
        }
        self.clean(page, PAGE_SIZE as usize);
        if pte.publish(raw, page.bits() | F::table_attr()).is_err() {
            // The leaf changed under us. The caller re-reads and retries.
            // Safety: `page` was never reachable from the tree.
            unsafe { self.pages.free(page, 0) };
        } else {
            self.clean(PhysAddr::from_ptr(pte as *const Pte), 8);
        }
        Ok(())
    }

    fn retire(&self, table: PhysAddr, level: usize) {
        self.retired.lock().push((table, level));
    }

    // Frees `table`, found at `level`, and every table below it.
    unsafe fn free_subtree(&self, table: PhysAddr, level: usize) {
        if level > 0 {
            for pte in self.table(table) {
                let raw = pte.get();
                if F::is_table(raw, level) {
                    self.free_subtree(PhysAddr::new(raw & F::ADDR_MASK), level - 1);
                }
            }
        }
        self.pages.free(table, 0);
    }
}

impl<F: PageTableFormat> Drop for PageTable<F> {
    fn drop(&mut self) {
        // Safety: `self` is exclusively owned, so no software walker remains. Owners detach the
        // tree from hardware before dropping it.
        unsafe { self.release() };
    }
}
