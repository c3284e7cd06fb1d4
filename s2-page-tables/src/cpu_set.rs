// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use core::sync::atomic::{AtomicU64, Ordering};

/// The maximum number of processors supported.
pub const MAX_CPUS: usize = 128;

const WORDS: usize = MAX_CPUS / 64;

/// Identifies a processor, from 0 to `MAX_CPUS - 1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(usize);

impl CpuId {
    /// Creates a `CpuId`. Panics if `id` is not below `MAX_CPUS`.
    pub const fn new(id: usize) -> Self {
        assert!(id < MAX_CPUS);
        Self(id)
    }

    /// Returns the raw index of this processor.
    pub const fn raw(&self) -> usize {
        self.0
    }

    fn word_bit(&self) -> (usize, u64) {
        (self.0 / 64, 1 << (self.0 % 64))
    }
}

/// A set of processors that can be updated concurrently.
pub struct CpuSet {
    words: [AtomicU64; WORDS],
}

impl CpuSet {
    /// Creates an empty set.
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const EMPTY: AtomicU64 = AtomicU64::new(0);
        Self {
            words: [EMPTY; WORDS],
        }
    }

    /// Adds `cpu` to the set.
    pub fn set(&self, cpu: CpuId) {
        let (word, bit) = cpu.word_bit();
        self.words[word].fetch_or(bit, Ordering::AcqRel);
    }

    /// Removes `cpu` from the set.
    pub fn clear(&self, cpu: CpuId) {
        let (word, bit) = cpu.word_bit();
        self.words[word].fetch_and(!bit, Ordering::AcqRel);
    }

    /// Returns if `cpu` is in the set.
    pub fn contains(&self, cpu: CpuId) -> bool {
        let (word, bit) = cpu.word_bit();
        self.words[word].load(Ordering::Acquire) & bit != 0
    }

    /// Removes `cpu` from the set, returning if it was present.
    pub fn test_and_clear(&self, cpu: CpuId) -> bool {
        let (word, bit) = cpu.word_bit();
        self.words[word].fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }

    /// Adds every processor to the set.
    pub fn set_all(&self) {
        for word in &self.words {
            word.fetch_or(u64::MAX, Ordering::AcqRel);
        }
    }

    /// Returns if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| w.load(Ordering::Acquire) == 0)
    }

    /// Iterates over a snapshot of the processors in the set.
    pub fn iter(&self) -> impl Iterator<Item = CpuId> + '_ {
        self.words.iter().enumerate().flat_map(|(i, word)| {
            let bits = word.load(Ordering::Acquire);
            (0..64)
                .filter(move |b| bits & (1 << b) != 0)
                .map(move |b| CpuId(i * 64 + b))
        })
    }
}

impl Default for CpuSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn set_and_clear() {
        let set = CpuSet::new();
        assert!(set.is_empty());
        set.set(CpuId::new(3));
        set.set(CpuId::new(70));
        assert!(set.contains(CpuId::new(70)));
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            [CpuId::new(3), CpuId::new(70)]
        );
        assert!(set.test_and_clear(CpuId::new(3)));
        assert!(!set.test_and_clear(CpuId::new(3)));
        set.clear(CpuId::new(70));
        assert!(set.is_empty());
    }

    #[test]
    fn set_all_covers_every_cpu() {
        let set = CpuSet::new();
        set.set_all();
        assert_eq!(set.iter().count(), MAX_CPUS);
        assert!(set.contains(CpuId::new(MAX_CPUS - 1)));
    }

    #[test]
    #[should_panic]
    fn cpu_id_out_of_range() {
        let _ = CpuId::new(MAX_CPUS);
    }
}
