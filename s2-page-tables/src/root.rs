// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use hyp_pages::{CacheMaintenance, PageAllocator, PhysAddr};

use crate::cpu_set::CpuId;
use crate::error::Result;
use crate::page_table::PageTable;
use crate::regime::{RegimeControl, RegimeId};

/// A translation tree bound to the processor regime `C` that walks it.
pub struct TranslationRoot<C: RegimeControl> {
    tree: PageTable<C::Format>,
}

impl<C: RegimeControl> TranslationRoot<C> {
    /// Creates an empty tree.
    pub fn new(pages: &'static dyn PageAllocator) -> Result<Self> {
        Ok(Self {
            tree: PageTable::new(pages)?,
        })
    }

    /// Creates an empty tree walked by a non-coherent agent. Every write is cleaned with `cache`.
    pub fn with_cache(
        pages: &'static dyn PageAllocator,
        cache: &'static dyn CacheMaintenance,
    ) -> Result<Self> {
        Ok(Self {
            tree: PageTable::with_cache(pages, Some(cache))?,
        })
    }

    pub fn tree(&self) -> &PageTable<C::Format> {
        &self.tree
    }

    pub fn root_address(&self) -> PhysAddr {
        self.tree.root_address()
    }

    /// Loads this tree, tagged with `regime`, on `cpu` unless it is already loaded there.
    pub fn make_current(&self, cpu: CpuId, regime: RegimeId) {
        let value = C::compose(regime, self.root_address());
        if C::loaded_roots().replace(cpu, value) {
            C::load(value);
        }
    }

    /// Flushes the translations of this tree, tagged with `regime`, cached by `cpu`.
    pub fn invalidate(&self, cpu: CpuId, regime: RegimeId) {
        self.make_current(cpu, regime);
        C::flush(C::compose(regime, self.root_address()));
    }

    /// Resets the loaded-regime record of `cpu` when it comes online or resumes.
    pub fn init(cpu: CpuId) {
        C::loaded_roots().reset(cpu);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_stubs::CountingRegime;
    use hyp_pages::test_stubs::HeapPages;

    #[test]
    fn make_current_elides_reload() {
        let root = TranslationRoot::<CountingRegime>::new(HeapPages::leaked()).unwrap();
        let cpu = CpuId::new(0);
        TranslationRoot::<CountingRegime>::init(cpu);
        CountingRegime::reset_counts();
        root.make_current(cpu, RegimeId::new(1));
        root.make_current(cpu, RegimeId::new(1));
        assert_eq!(CountingRegime::loads(), 1);
        // A different tag is a different regime value.
        root.make_current(cpu, RegimeId::new(2));
        assert_eq!(CountingRegime::loads(), 2);
        TranslationRoot::<CountingRegime>::init(cpu);
        root.make_current(cpu, RegimeId::new(2));
        assert_eq!(CountingRegime::loads(), 3);
    }

    #[test]
    fn invalidate_flushes_loaded_regime() {
        let root = TranslationRoot::<CountingRegime>::new(HeapPages::leaked()).unwrap();
        let cpu = CpuId::new(1);
        TranslationRoot::<CountingRegime>::init(cpu);
        CountingRegime::reset_counts();
        root.invalidate(cpu, RegimeId::new(3));
        assert_eq!(CountingRegime::loads(), 1);
        assert_eq!(CountingRegime::flushes(), 1);
        assert_eq!(
            CountingRegime::loaded_roots().current(cpu),
            CountingRegime::compose(RegimeId::new(3), root.root_address())
        );
    }
}
