// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use drivers::iommu::{DmaSpace, RegisterIo, UnitRegistry};
use hyp_arch::CpuDataCache;
use hyp_pages::{CacheMaintenance, PageAllocator};
use s2_page_tables::{CpuId, Eptp, GuestSpace, Npt, RegimeId, TranslationRoot, Vttbr};

use crate::config::TranslationConfig;
use crate::error::Result;

/// Second-stage translation for guests and assigned devices.
pub struct Stage2<R: RegisterIo> {
    config: TranslationConfig,
    pages: &'static dyn PageAllocator,
    cache: &'static dyn CacheMaintenance,
    iommu: UnitRegistry<R>,
}

impl<R: RegisterIo> Stage2<R> {
    /// Applies `config` and brings up the remapping units in `units`, given as register base and
    /// register accessor, in discovery order.
    pub fn bring_up(
        config: TranslationConfig,
        pages: &'static dyn PageAllocator,
        cache: &'static dyn CacheMaintenance,
        units: impl IntoIterator<Item = (u64, R)>,
    ) -> Result<Self> {
        Npt::set_xnx(config.xnx);
        let mut iommu = UnitRegistry::new(config.remap_config(), pages, cache)?;
        for (phys_base, regs) in units {
            iommu.add_unit(phys_base, regs)?;
        }
        iommu.init_all()?;
        log::info!(
            "Stage-2 translation: xnx {}, {} remapping units, interrupt remapping {}",
            config.xnx,
            iommu.units().len(),
            if iommu.interrupt_remapping() { "on" } else { "off" }
        );
        Ok(Self {
            config,
            pages,
            cache,
            iommu,
        })
    }

    /// Like `bring_up`, cleaning structures read by non-coherent units from the executing
    /// processor's data cache before its line size has been enumerated.
    pub fn bring_up_on_cpu(
        config: TranslationConfig,
        pages: &'static dyn PageAllocator,
        units: impl IntoIterator<Item = (u64, R)>,
    ) -> Result<Self> {
        static CPU_CACHE: CpuDataCache = CpuDataCache::conservative();
        Self::bring_up(config, pages, &CPU_CACHE, units)
    }

    pub fn config(&self) -> &TranslationConfig {
        &self.config
    }

    pub fn iommu(&self) -> &UnitRegistry<R> {
        &self.iommu
    }

    /// Forgets what `cpu` had loaded. Called as the processor comes online.
    pub fn cpu_online(&self, cpu: CpuId) {
        TranslationRoot::<Vttbr>::init(cpu);
        TranslationRoot::<Eptp>::init(cpu);
    }

    /// Forgets what `cpu` had loaded before it was suspended.
    pub fn cpu_resume(&self, cpu: CpuId) {
        self.cpu_online(cpu);
    }

    /// Creates an empty guest address space tagged with `vmid`.
    pub fn create_guest(&self, vmid: u16) -> Result<GuestSpace<Vttbr>> {
        Ok(GuestSpace::create(self.pages, RegimeId::new(vmid))?)
    }

    /// Creates an empty DMA address space for `domain`. Its tables are cleaned to memory on every
    /// write if some unit does not snoop processor caches.
    pub fn create_dma_space(&self, domain: u16) -> Result<GuestSpace<Eptp>> {
        let regime = RegimeId::new(domain);
        let space = if self.iommu.noncoherent() {
            GuestSpace::create_with_cache(self.pages, self.cache, regime)?
        } else {
            GuestSpace::create(self.pages, regime)?
        };
        Ok(space)
    }

    /// Attaches device `rid` behind the unit at `unit` to `space`, or detaches it.
    pub fn assign_device(
        &self,
        unit: u64,
        space: &dyn DmaSpace,
        rid: u32,
        enable: bool,
    ) -> Result<()> {
        Ok(self.iommu.configure(unit, space, rid, enable)?)
    }

    /// Routes remapped interrupt `index`.
    pub fn set_irt(&self, index: usize, rid: u16, aid: u32, vector: u8, level: bool) -> Result<()> {
        Ok(self.iommu.set_irt(index, rid, aid, vector, level)?)
    }

    /// Handles a remapping fault interrupt. Returns the number of faults drained.
    pub fn interrupt(&self) -> usize {
        self.iommu.interrupt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use drivers::iommu::test_stubs::{FakeCaps, FakeUnit, Observed};
    use drivers::iommu::{Descriptor, Granularity, IommuError};
    use hyp_pages::test_stubs::{CountingCache, HeapPages};
    use hyp_pages::{Fill, GuestPhysAddr, PhysAddr};
    use s2_page_tables::test_stubs::{cpu, LocalShootdown};
    use s2_page_tables::{PageAttrs, PageTableError, Permissions, SpaceState};

    const UNIT: u64 = 0xfed9_0000;

    fn stage2(
        config: TranslationConfig,
        caps: FakeCaps,
    ) -> (Stage2<&'static FakeUnit>, &'static FakeUnit) {
        let fake = FakeUnit::leaked(caps);
        let stage2 = Stage2::bring_up(
            config,
            HeapPages::leaked(),
            CountingCache::leaked(),
            [(UNIT, fake)],
        )
        .unwrap();
        (stage2, fake)
    }

    fn page() -> PhysAddr {
        HeapPages::leaked().alloc(0, Fill::Bits0).unwrap()
    }

    #[test]
    fn guest_map_sync_unmap() {
        let (stage2, _) = stage2(TranslationConfig::default(), FakeCaps::default());
        stage2.cpu_online(cpu(0));
        stage2.cpu_online(cpu(1));
        let guest = stage2.create_guest(1).unwrap();
        let shootdown = LocalShootdown::new(2);
        let gpa = GuestPhysAddr::new(0x4000_1000);
        let phys = page();

        guest
            .update(gpa, phys, 0, PageAttrs::memory(Permissions::RW))
            .unwrap();
        guest.sync(&shootdown).unwrap();
        guest.activate(cpu(0)).unwrap();
        let translation = guest.lookup(gpa).unwrap();
        assert_eq!(translation.base, phys);
        assert_eq!(translation.order, 0);
        assert_eq!(translation.attrs, PageAttrs::memory(Permissions::RW));

        guest
            .update(gpa, PhysAddr::new(0), 0, PageAttrs::unmapped())
            .unwrap();
        guest.sync(&shootdown).unwrap();
        assert!(guest.lookup(gpa).is_none());
        assert_eq!(shootdown.rounds(), 2);

        guest.destroy(&shootdown).unwrap();
        assert_eq!(guest.state(), SpaceState::Destroyed);
        assert_eq!(
            guest.update(gpa, phys, 0, PageAttrs::memory(Permissions::RW)),
            Err(PageTableError::SpaceDestroyed)
        );
    }

    #[test]
    fn device_configure_in_and_out() {
        let (stage2, fake) = stage2(TranslationConfig::default(), FakeCaps::default());
        let space = stage2.create_dma_space(3).unwrap();
        space
            .install(
                GuestPhysAddr::new(0x10_0000),
                page(),
                1,
                PageAttrs::memory(Permissions::RW),
            )
            .unwrap();

        stage2.assign_device(UNIT, &space, 0x0310, true).unwrap();
        let contexts = stage2.iommu().contexts();
        let (lo, hi) = contexts.entry(0x0310).unwrap();
        assert_eq!(lo, space.root_address().bits() | 1);
        assert_eq!(hi >> 8 & 0xffff, 3);

        fake.clear_observed();
        stage2.assign_device(UNIT, &space, 0x0310, false).unwrap();
        let (lo, _) = contexts.entry(0x0310).unwrap();
        assert_eq!(lo & 1, 0);
        assert!(fake
            .queued()
            .contains(&Descriptor::context(Granularity::Global, 0)));
    }

    #[test]
    fn device_configure_out_with_register_invalidation() {
        let config = TranslationConfig {
            queued_invalidation: false,
            ..TranslationConfig::default()
        };
        let (stage2, fake) = stage2(config, FakeCaps::default());
        assert!(!stage2.iommu().interrupt_remapping());
        let space = stage2.create_dma_space(4).unwrap();
        stage2.assign_device(UNIT, &space, 0x0008, true).unwrap();
        fake.clear_observed();
        stage2.assign_device(UNIT, &space, 0x0008, false).unwrap();
        assert_eq!(stage2.iommu().contexts().entry(0x0008).unwrap().0 & 1, 0);
        assert!(fake.observed().contains(&Observed::Context {
            granularity: Granularity::Global as u64,
            domain: 0
        }));
    }

    #[test]
    fn assignment_errors_are_wrapped() {
        let (stage2, _) = stage2(TranslationConfig::default(), FakeCaps::default());
        let space = stage2.create_dma_space(5).unwrap();
        assert_eq!(
            stage2.assign_device(0x1000, &space, 0x10, true),
            Err(Error::Iommu(IommuError::UnitNotFound(0x1000)))
        );
    }

    #[test]
    fn bring_up_fails_without_translation_support() {
        let caps = FakeCaps {
            sagaw: 0b0010,
            ..FakeCaps::default()
        };
        let result = Stage2::bring_up(
            TranslationConfig::default(),
            HeapPages::leaked(),
            CountingCache::leaked(),
            [(UNIT, FakeUnit::leaked(caps))],
        );
        assert_eq!(
            result.err(),
            Some(Error::Iommu(IommuError::MissingTranslationSupport))
        );
    }

    #[test]
    fn noncoherent_units_get_cleaned_dma_tables() {
        let pages = HeapPages::leaked();
        let cache = CountingCache::leaked();
        let caps = FakeCaps {
            coherent: false,
            ..FakeCaps::default()
        };
        let stage2 = Stage2::bring_up(
            TranslationConfig::default(),
            pages,
            cache,
            [(UNIT, FakeUnit::leaked(caps))],
        )
        .unwrap();
        let space = stage2.create_dma_space(6).unwrap();
        let before = cache.cleans();
        space
            .update(
                GuestPhysAddr::new(0x2000),
                page(),
                0,
                PageAttrs::memory(Permissions::R),
            )
            .unwrap();
        assert!(cache.cleans() > before);
    }

    #[test]
    fn bring_up_on_cpu_maps_noncoherent_dma() {
        let caps = FakeCaps {
            coherent: false,
            ..FakeCaps::default()
        };
        let stage2 = Stage2::bring_up_on_cpu(
            TranslationConfig::default(),
            HeapPages::leaked(),
            [(UNIT, FakeUnit::leaked(caps))],
        )
        .unwrap();
        assert!(stage2.iommu().noncoherent());
        let space = stage2.create_dma_space(7).unwrap();
        let phys = page();
        let gpa = GuestPhysAddr::new(0x3000);
        space
            .update(gpa, phys, 0, PageAttrs::memory(Permissions::RW))
            .unwrap();
        assert_eq!(space.lookup(gpa).unwrap().base, phys);
        stage2.assign_device(UNIT, &space, 0x0200, true).unwrap();
        assert_eq!(
            stage2.iommu().contexts().entry(0x0200).unwrap().0,
            space.root_address().bits() | 1
        );
    }

    #[test]
    fn remapped_interrupts_and_faults() {
        let (stage2, fake) = stage2(TranslationConfig::default(), FakeCaps::default());
        assert!(stage2.iommu().interrupt_remapping());
        fake.clear_observed();
        stage2.set_irt(9, 0x0310, 1, 0x30, false).unwrap();
        assert_eq!(fake.queued(), [Descriptor::interrupt_entries()]);

        fake.inject_fault(0, 0x0310, 6, 0x8000, false);
        assert_eq!(stage2.interrupt(), 1);
        assert_eq!(fake.pending_faults(), 0);
    }
}
