// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use core::cell::Cell;
use core::sync::atomic::{AtomicUsize, Ordering};
use hyp_pages::PhysAddr;
use std::boxed::Box;

use crate::cpu_set::CpuId;
use crate::npt::Npt;
use crate::regime::{LoadedRoots, RegimeControl, RegimeId};
use crate::shootdown::{Shootdown, TlbTarget};

std::thread_local! {
    static LOADS: Cell<usize> = Cell::new(0);
    static FLUSHES: Cell<usize> = Cell::new(0);
    static LAST_FLUSH: Cell<u64> = Cell::new(0);
    static ROOTS: &'static LoadedRoots = Box::leak(Box::new(LoadedRoots::new()));
}

/// A stage-2 regime that counts hardware loads and flushes instead of touching the processor.
/// Counters and loaded-root records are per test thread.
pub enum CountingRegime {}

impl CountingRegime {
    /// Returns the number of loads on this thread since the last reset.
    pub fn loads() -> usize {
        LOADS.with(|c| c.get())
    }

    /// Returns the number of flushes on this thread since the last reset.
    pub fn flushes() -> usize {
        FLUSHES.with(|c| c.get())
    }

    /// Returns the value passed to the latest flush.
    pub fn last_flush() -> u64 {
        LAST_FLUSH.with(|c| c.get())
    }

    pub fn reset_counts() {
        LOADS.with(|c| c.set(0));
        FLUSHES.with(|c| c.set(0));
        LAST_FLUSH.with(|c| c.set(0));
    }
}

impl RegimeControl for CountingRegime {
    type Format = Npt;

    fn compose(regime: RegimeId, root: PhysAddr) -> u64 {
        (regime.bits() as u64) << 48 | root.bits()
    }

    fn load(_value: u64) {
        LOADS.with(|c| c.set(c.get() + 1));
    }

    fn flush(value: u64) {
        FLUSHES.with(|c| c.set(c.get() + 1));
        LAST_FLUSH.with(|c| c.set(value));
    }

    fn loaded_roots() -> &'static LoadedRoots {
        ROOTS.with(|r| *r)
    }
}

/// Performs shootdowns synchronously on the calling thread, acting in turn as each online
/// processor.
pub struct LocalShootdown {
    online: usize,
    rounds: AtomicUsize,
    flushed: AtomicUsize,
}

impl LocalShootdown {
    /// Creates a shootdown over processors `0..online`; the others count as offline.
    pub fn new(online: usize) -> Self {
        Self {
            online,
            rounds: AtomicUsize::new(0),
            flushed: AtomicUsize::new(0),
        }
    }

    /// Returns the number of shootdowns performed.
    pub fn rounds(&self) -> usize {
        self.rounds.load(Ordering::SeqCst)
    }

    /// Returns the number of processor flushes performed.
    pub fn flushed(&self) -> usize {
        self.flushed.load(Ordering::SeqCst)
    }
}

impl Shootdown for LocalShootdown {
    fn shootdown(&self, target: &dyn TlbTarget) {
        self.rounds.fetch_add(1, Ordering::SeqCst);
        let online = self.online;
        for cpu in target.dirty().iter().filter(|c| c.raw() < online) {
            target.flush_local(cpu);
            self.flushed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Returns processor `id`.
pub fn cpu(id: usize) -> CpuId {
    CpuId::new(id)
}
