// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use arrayvec::ArrayVec;
use hyp_pages::{CacheMaintenance, PageAllocator, PhysAddr};
use s2_page_tables::{Ept, Eptp, GuestSpace, PageTableFormat};

use super::context::ContextTables;
use super::error::*;
use super::fault::FaultEvent;
use super::irt::RemapTable;
use super::registers::RegisterIo;
use super::unit::RemapUnit;

/// Maximum number of remapping units found at boot.
pub const MAX_UNITS: usize = 8;

/// Remapping features requested by the platform.
#[derive(Clone, Copy, Debug, Default)]
pub struct RemapConfig {
    /// Remap interrupts if every unit can.
    pub interrupt_remapping: bool,
    /// Use the invalidation queue on units that have one.
    pub queued_invalidation: bool,
    /// Where units signal recorded faults. Fault interrupts stay masked if unset.
    pub fault_event: Option<FaultEvent>,
}

/// A second-level address space that devices can be attached to.
pub trait DmaSpace {
    /// The domain id tagging the space's cached translations.
    fn domain_id(&self) -> u16;
    /// The root of the space's second-level table.
    fn root_address(&self) -> PhysAddr;
    /// The number of levels of the space's second-level table.
    fn levels(&self) -> usize;
}

impl DmaSpace for GuestSpace<Eptp> {
    fn domain_id(&self) -> u16 {
        self.regime().bits()
    }

    fn root_address(&self) -> PhysAddr {
        GuestSpace::root_address(self)
    }

    fn levels(&self) -> usize {
        Ept::LEVELS
    }
}

/// The remapping units of the platform and the context and interrupt-remap tables they share.
pub struct UnitRegistry<R: RegisterIo> {
    units: ArrayVec<RemapUnit<R>, MAX_UNITS>,
    contexts: ContextTables,
    irt: RemapTable,
    pages: &'static dyn PageAllocator,
    cache: &'static dyn CacheMaintenance,
    config: RemapConfig,
    // Set by `init_all` when every unit remaps interrupts.
    remapping: bool,
}

impl<R: RegisterIo> UnitRegistry<R> {
    /// Allocates the shared tables.
    pub fn new(
        config: RemapConfig,
        pages: &'static dyn PageAllocator,
        cache: &'static dyn CacheMaintenance,
    ) -> Result<Self> {
        Ok(Self {
            units: ArrayVec::new(),
            contexts: ContextTables::new(pages, cache)?,
            irt: RemapTable::new(pages, cache)?,
            pages,
            cache,
            config,
            remapping: false,
        })
    }

    /// Adds the unit with registers at `phys_base`.
    pub fn add_unit(&mut self, phys_base: u64, regs: R) -> Result<()> {
        if self.units.is_full() {
            return Err(Error::TooManyUnits);
        }
        let unit = RemapUnit::new(
            phys_base,
            regs,
            self.config.queued_invalidation,
            self.pages,
            self.cache,
        )?;
        log::debug!(
            "Remapping unit {:#x} uses {} invalidation",
            phys_base,
            if unit.is_queued() { "queued" } else { "register" }
        );
        self.units.push(unit);
        Ok(())
    }

    pub fn units(&self) -> &[RemapUnit<R>] {
        &self.units
    }

    pub fn contexts(&self) -> &ContextTables {
        &self.contexts
    }

    pub fn remap_table(&self) -> &RemapTable {
        &self.irt
    }

    /// Returns if some unit walks tables without snooping processor caches.
    pub fn noncoherent(&self) -> bool {
        self.units.iter().any(|u| !u.is_coherent())
    }

    /// Returns if interrupts are remapped.
    pub fn interrupt_remapping(&self) -> bool {
        self.remapping
    }

    /// Brings up every unit. Interrupt remapping is turned on only if requested and every unit
    /// supports it along with queued invalidation.
    pub fn init_all(&mut self) -> Result<()> {
        self.remapping = self.config.interrupt_remapping
            && !self.units.is_empty()
            && self
                .units
                .iter()
                .all(|u| u.has_interrupt_remapping() && u.is_queued());
        let irta = self.remapping.then(|| self.irt.irta());
        for unit in self.units.iter() {
            unit.init(self.contexts.root_address(), irta, self.config.fault_event)?;
        }
        Ok(())
    }

    /// Handles a fault interrupt from any unit. Returns the number of faults drained.
    pub fn interrupt(&self) -> usize {
        self.units.iter().map(|u| u.fault_handler()).sum()
    }

    /// Returns the unit with registers at `phys_base`.
    pub fn lookup(&self, phys_base: u64) -> Option<&RemapUnit<R>> {
        self.units.iter().find(|u| u.phys_base() == phys_base)
    }

    /// Attaches requester `rid` behind the unit at `phys_base` to `space`, or blocks its DMA if
    /// `enable` is false. Stale context entries are invalidated before returning.
    pub fn configure(
        &self,
        phys_base: u64,
        space: &dyn DmaSpace,
        rid: u32,
        enable: bool,
    ) -> Result<()> {
        let unit = self
            .lookup(phys_base)
            .ok_or(Error::UnitNotFound(phys_base))?;
        let rid = u16::try_from(rid).map_err(|_| Error::InvalidRequesterId(rid))?;
        if enable {
            let levels = space.levels();
            if !unit.supports_levels(levels) {
                return Err(Error::UnsupportedAddressWidth(levels));
            }
            self.contexts
                .attach(rid, space.root_address(), levels, space.domain_id())?;
        } else {
            self.contexts.detach(rid);
        }
        unit.invalidate_ctx()
    }

    /// Programs interrupt-remap entry `index` and invalidates every unit's cached copy. Does
    /// nothing when interrupts are not remapped.
    pub fn set_irt(&self, index: usize, rid: u16, aid: u32, vector: u8, level: bool) -> Result<()> {
        if !self.remapping {
            return Ok(());
        }
        self.irt.set(index, rid, aid, vector, level);
        for unit in self.units.iter() {
            unit.invalidate_iec(true)?;
        }
        Ok(())
    }

    /// Invalidates the cached context entries and translations of `domain` on every unit.
    pub fn invalidate_all(&self, domain: u16) -> Result<()> {
        for unit in self.units.iter() {
            unit.invalidate_domain(domain)?;
        }
        Ok(())
    }
}
