// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use core::sync::atomic::{AtomicU64, Ordering};

/// A translation table entry in memory. Never instantiated, only referenced in place inside a
/// table page. Every access is a single atomic word access since hardware walkers and other
/// processors read entries concurrently with updates.
#[repr(transparent)]
pub(crate) struct Pte(AtomicU64);

impl Pte {
    /// Returns the raw bits of the entry.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Replaces the entry, returning what it held.
    pub fn swap(&self, val: u64) -> u64 {
        self.0.swap(val, Ordering::AcqRel)
    }

    /// Replaces the entry with `new` if it still holds `old`. On failure returns the value another
    /// processor installed.
    pub fn publish(&self, old: u64, new: u64) -> Result<(), u64> {
        self.0
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
    }

    /// Initializes an entry of a table that is not yet reachable from the tree.
    pub fn init(&self, val: u64) {
        self.0.store(val, Ordering::Relaxed);
    }
}
