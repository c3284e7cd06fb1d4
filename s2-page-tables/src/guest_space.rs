// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use hyp_arch::pause;
use hyp_pages::{CacheMaintenance, GuestPhysAddr, PageAllocator, PhysAddr};

use crate::attr::PageAttrs;
use crate::cpu_set::{CpuId, CpuSet};
use crate::error::{Error, Result};
use crate::page_table::{PageTable, Translation};
use crate::regime::{RegimeControl, RegimeId};
use crate::root::TranslationRoot;
use crate::shootdown::{Shootdown, TlbTarget};

/// Lifecycle of a `GuestSpace`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpaceState {
    /// Accepting updates.
    Active,
    /// Draining in-flight operations before its tables are freed.
    Destroying,
    /// Every table has been freed.
    Destroyed,
}

const ACTIVE: u8 = 0;
const DESTROYING: u8 = 1;
const DESTROYED: u8 = 2;

/// The second-stage address space of one guest or one DMA domain.
///
/// Updates may run concurrently from any processor. They only become guaranteed to be observed
/// by every processor after `sync()`, or by one processor after its `invalidate()`.
pub struct GuestSpace<C: RegimeControl> {
    root: TranslationRoot<C>,
    regime: RegimeId,
    // Processors that may cache translations older than the latest update.
    dirty: CpuSet,
    state: AtomicU8,
    // Operations that require the tables to stay allocated.
    in_flight: AtomicUsize,
}

// Keeps a space's tables alive while held.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<C: RegimeControl> GuestSpace<C> {
    /// Creates an empty space tagged with `regime`.
    pub fn create(pages: &'static dyn PageAllocator, regime: RegimeId) -> Result<Self> {
        Ok(Self::from_root(TranslationRoot::new(pages)?, regime))
    }

    /// Creates an empty space whose tables are read by a non-coherent walker. Table writes are
    /// cleaned to memory with `cache`.
    pub fn create_with_cache(
        pages: &'static dyn PageAllocator,
        cache: &'static dyn CacheMaintenance,
        regime: RegimeId,
    ) -> Result<Self> {
        Ok(Self::from_root(TranslationRoot::with_cache(pages, cache)?, regime))
    }

    fn from_root(root: TranslationRoot<C>, regime: RegimeId) -> Self {
        log::debug!(
            "Created space {:?} with root {:?}",
            regime,
            root.root_address()
        );
        Self {
            root,
            regime,
            dirty: CpuSet::new(),
            state: AtomicU8::new(ACTIVE),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn regime(&self) -> RegimeId {
        self.regime
    }

    pub fn root_address(&self) -> PhysAddr {
        self.root.root_address()
    }

    pub fn state(&self) -> SpaceState {
        match self.state.load(Ordering::SeqCst) {
            ACTIVE => SpaceState::Active,
            DESTROYING => SpaceState::Destroying,
            _ => SpaceState::Destroyed,
        }
    }

    /// Returns the underlying tree.
    pub(crate) fn tree(&self) -> &PageTable<C::Format> {
        self.root.tree()
    }

    fn enter(&self) -> Result<InFlight<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);
        if self.state.load(Ordering::SeqCst) != ACTIVE {
            return Err(Error::SpaceDestroyed);
        }
        Ok(guard)
    }

    /// Maps or unmaps up to `2^order` pages at `gpa`. See `PageTable::update`.
    pub fn update(
        &self,
        gpa: GuestPhysAddr,
        phys: PhysAddr,
        order: u32,
        attrs: PageAttrs,
    ) -> Result<u32> {
        let _guard = self.enter()?;
        self.tree().update(gpa, phys, order, attrs)
    }

    /// Maps or unmaps `pages` pages at `gpa`. See `PageTable::install`.
    pub fn install(
        &self,
        gpa: GuestPhysAddr,
        phys: PhysAddr,
        pages: u64,
        attrs: PageAttrs,
    ) -> Result<()> {
        let _guard = self.enter()?;
        self.tree().install(gpa, phys, pages, attrs)
    }

    /// Returns the current translation of `gpa`, if any.
    pub fn lookup(&self, gpa: GuestPhysAddr) -> Option<Translation> {
        let _guard = self.enter().ok()?;
        self.tree().lookup(gpa)
    }

    /// Makes every update made so far visible on all processors, then frees the tables those
    /// updates detached.
    pub fn sync(&self, shootdown: &dyn Shootdown) -> Result<()> {
        let _guard = self.enter()?;
        self.sync_all(shootdown);
        Ok(())
    }

    fn sync_all(&self, shootdown: &dyn Shootdown) {
        // Tables retired after this point may still be cached after the shootdown below.
        let retired = self.tree().take_retired();
        self.dirty.set_all();
        shootdown.shootdown(self);
        // Safety: every online processor flushed this regime after the tables were detached, and
        // offline processors flush everything before they next run a guest. Software walks are
        // waited for by `free_retired`.
        unsafe { self.tree().free_retired(retired) };
    }

    /// Flushes this space's cached translations on `cpu`, the calling processor.
    pub fn invalidate(&self, cpu: CpuId) -> Result<()> {
        let _guard = self.enter()?;
        self.flush_local(cpu);
        Ok(())
    }

    /// Switches `cpu`, the calling processor, to this space before guest entry. Flushes first if
    /// a sync left the processor dirty.
    pub fn activate(&self, cpu: CpuId) -> Result<()> {
        let _guard = self.enter()?;
        if self.dirty.test_and_clear(cpu) {
            self.root.invalidate(cpu, self.regime);
        } else {
            self.root.make_current(cpu, self.regime);
        }
        Ok(())
    }

    /// Tears the space down: locks out new operations, waits for in-flight ones, makes every
    /// processor drop its translations and frees all tables.
    pub fn destroy(&self, shootdown: &dyn Shootdown) -> Result<()> {
        self.state
            .compare_exchange(ACTIVE, DESTROYING, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::SpaceDestroyed)?;
        while self.in_flight.load(Ordering::SeqCst) != 0 {
            pause();
        }
        self.sync_all(shootdown);
        // Safety: new operations are refused and in-flight ones have drained, so no software
        // walker remains; the shootdown removed the tree from every processor's caches.
        unsafe { self.tree().release() };
        self.state.store(DESTROYED, Ordering::SeqCst);
        log::debug!("Destroyed space {:?}", self.regime);
        Ok(())
    }
}

impl<C: RegimeControl> TlbTarget for GuestSpace<C> {
    fn dirty(&self) -> &CpuSet {
        &self.dirty
    }

    fn flush_local(&self, cpu: CpuId) {
        self.dirty.clear(cpu);
        self.root.invalidate(cpu, self.regime);
    }
}
