// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use core::sync::atomic::{AtomicUsize, Ordering};
use hyp_arch::pause;
use spin::Mutex;

/// Tracks the software walkers of a tree so that detached tables are only freed once every walker
/// that might still hold a pointer into them has finished.
///
/// Walkers are counted by the parity of the generation they entered in. `wait_for_older` moves to
/// the next generation and waits for the count of the previous one to drain; walkers entering
/// afterwards start from the root and can no longer reach tables detached before the call.
pub(crate) struct Walkers {
    generation: AtomicUsize,
    active: [AtomicUsize; 2],
    // Serializes generation changes so at most two generations have walkers at once.
    advance: Mutex<()>,
}

/// Keeps the tables reachable at the time it was taken allocated until dropped.
pub(crate) struct WalkGuard<'a> {
    count: &'a AtomicUsize,
}

impl Drop for WalkGuard<'_> {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Walkers {
    pub const fn new() -> Self {
        Self {
            generation: AtomicUsize::new(0),
            active: [AtomicUsize::new(0), AtomicUsize::new(0)],
            advance: Mutex::new(()),
        }
    }

    /// Registers a walker in the current generation.
    pub fn enter(&self) -> WalkGuard<'_> {
        loop {
            let generation = self.generation.load(Ordering::SeqCst);
            let count = &self.active[generation & 1];
            count.fetch_add(1, Ordering::SeqCst);
            if self.generation.load(Ordering::SeqCst) == generation {
                return WalkGuard { count };
            }
            // The generation moved before we were counted; retry in the new one.
            count.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Waits until every walker that entered before the call has finished. Must not be called
    /// while the caller holds a `WalkGuard` of the same tree.
    pub fn wait_for_older(&self) {
        let _advance = self.advance.lock();
        let old = self.generation.fetch_add(1, Ordering::SeqCst);
        while self.active[old & 1].load(Ordering::SeqCst) != 0 {
            pause();
        }
    }

    #[cfg(test)]
    fn active(&self) -> usize {
        self.active
            .iter()
            .map(|c| c.load(Ordering::SeqCst))
            .sum()
    }
}
