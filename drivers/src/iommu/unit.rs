// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use hyp_arch::{mmio_wmb, pause};
use hyp_pages::{CacheMaintenance, Fill, PageAllocator, PhysAddr};
use spin::Mutex;
use tock_registers::fields::FieldValue;
use tock_registers::LocalRegisterCopy;

use super::error::*;
use super::fault::{FaultEvent, FaultRecord};
use super::queue::*;
use super::registers::*;

/// One DMA and interrupt remapping unit.
///
/// Global commands and direct-register invalidations are serialized by a per-unit lock that is
/// held until the unit acknowledges them. Queued invalidations only hold the queue lock while
/// descriptors are written; waiting for their completion happens unlocked.
pub struct RemapUnit<R: RegisterIo> {
    phys_base: u64,
    regs: R,
    cap: CapabilityReg,
    ecap: ExtCapabilityReg,
    // Present when invalidations go through the queue.
    queue: Option<Mutex<InvalidationQueue>>,
    lock: Mutex<()>,
    pages: &'static dyn PageAllocator,
    cache: &'static dyn CacheMaintenance,
}

impl<R: RegisterIo> RemapUnit<R> {
    /// Creates the driver for the unit whose registers, at `phys_base`, are accessed through
    /// `regs`. Invalidations are queued if `queued` is set and the unit supports it.
    pub fn new(
        phys_base: u64,
        regs: R,
        queued: bool,
        pages: &'static dyn PageAllocator,
        cache: &'static dyn CacheMaintenance,
    ) -> Result<Self> {
        let cap = CapabilityReg::new(regs.read64(CAP));
        let ecap = ExtCapabilityReg::new(regs.read64(ECAP));
        // Guest spaces use 4-level tables.
        if cap.read(Capability::Sagaw) & (1 << 2) == 0 {
            return Err(Error::MissingTranslationSupport);
        }
        let queue = if queued && ecap.is_set(ExtCapability::QueuedInvalidation) {
            let page = pages
                .alloc(0, Fill::Bits0)
                .ok_or(Error::InsufficientMemory)?;
            // Safety: the page was just allocated and is owned by the queue until `drop`.
            Some(Mutex::new(unsafe { InvalidationQueue::new(page) }))
        } else {
            None
        };
        Ok(Self {
            phys_base,
            regs,
            cap,
            ecap,
            queue,
            lock: Mutex::new(()),
            pages,
            cache,
        })
    }

    /// Returns the physical address of the unit's registers.
    pub fn phys_base(&self) -> u64 {
        self.phys_base
    }

    /// Returns the unit's register accessor.
    pub fn regs(&self) -> &R {
        &self.regs
    }

    /// Returns if the unit snoops processor caches when walking tables.
    pub fn is_coherent(&self) -> bool {
        self.ecap.is_set(ExtCapability::Coherent)
    }

    /// Returns if the unit supports interrupt remapping.
    pub fn has_interrupt_remapping(&self) -> bool {
        self.ecap.is_set(ExtCapability::InterruptRemapping)
    }

    /// Returns if invalidations go through the invalidation queue.
    pub fn is_queued(&self) -> bool {
        self.queue.is_some()
    }

    /// Returns if the unit walks second-level tables with `levels` levels.
    pub fn supports_levels(&self, levels: usize) -> bool {
        (2..=6).contains(&levels) && self.cap.read(Capability::Sagaw) & (1 << (levels - 2)) != 0
    }

    /// Returns the number of fault recording registers.
    pub fn fault_records(&self) -> usize {
        self.cap.read(Capability::NumFaultRecords) as usize + 1
    }

    fn fault_record_offset(&self) -> usize {
        self.cap.read(Capability::FaultRecordOffset) as usize * 16
    }

    fn iotlb_offset(&self) -> usize {
        self.ecap.read(ExtCapability::IotlbRegisterOffset) as usize * 16 + IOTLB
    }

    /// Brings the unit up: points it at the context tables rooted at `root`, at the
    /// interrupt-remap table `irta` if interrupt remapping is in use, enables queued invalidation
    /// when configured, flushes its caches and turns translation on.
    pub fn init(
        &self,
        root: PhysAddr,
        irta: Option<u64>,
        fault_event: Option<FaultEvent>,
    ) -> Result<()> {
        let mask = FaultEventControl::InterruptMask::SET.value;
        match fault_event {
            Some(event) => {
                self.regs.write32(FECTL, mask);
                self.regs.write32(FEDATA, event.data);
                self.regs.write32(FEADDR, event.addr);
                self.regs.write32(FECTL, 0);
            }
            None => self.regs.write32(FECTL, mask),
        }

        self.regs.write64(RTADDR, root.bits());
        self.command(GlobalCommand::SetRootTable::SET);

        if let Some(irta) = irta {
            self.regs.write64(IRTA, irta);
            self.command(GlobalCommand::SetInterruptTable::SET);
            self.command(GlobalCommand::InterruptRemapping::SET);
        }

        if let Some(queue) = &self.queue {
            let queue = queue.lock();
            self.regs.write64(IQT, queue.tail_register());
            // Queue size 0: one 4kB page of 128-bit descriptors.
            self.regs.write64(IQA, queue.base_address().bits());
            drop(queue);
            self.command(GlobalCommand::QueuedInvalidation::SET);
        }

        self.invalidate_ctx()?;
        self.command(GlobalCommand::Translation::SET);

        let version = self.regs.read32(VER);
        log::info!(
            "Remapping unit {:#x}: version {}.{}, {} invalidation, interrupt remapping {}",
            self.phys_base,
            version >> 4 & 0xf,
            version & 0xf,
            if self.is_queued() { "queued" } else { "register" },
            if irta.is_some() { "on" } else { "off" }
        );
        Ok(())
    }

    /// Issues the single global command `cmd` and waits for the unit to report it done.
    ///
    /// Holds the unit lock until the status register acknowledges the command.
    pub fn command(&self, cmd: FieldValue<u32, GlobalCommand::Register>) {
        let bit = cmd.value;
        assert_eq!(bit.count_ones(), 1, "one global command per write");
        let _guard = self.lock.lock();
        // Writing back a completed one-shot status bit would trigger that action again.
        let status = self.regs.read32(GSTS) & !ONE_SHOT;
        self.regs.write32(GCMD, status | bit);
        while self.regs.read32(GSTS) & bit == 0 {
            pause();
        }
    }

    /// Invalidates every cached context entry and second-level translation.
    pub fn invalidate_ctx(&self) -> Result<()> {
        self.invalidate(Granularity::Global, 0)
    }

    /// Invalidates the cached context entries and second-level translations of `domain`.
    pub fn invalidate_domain(&self, domain: u16) -> Result<()> {
        self.invalidate(Granularity::Domain, domain)
    }

    fn invalidate(&self, granularity: Granularity, domain: u16) -> Result<()> {
        if let Some(queue) = &self.queue {
            return self.submit(
                queue,
                &[
                    Descriptor::context(granularity, domain),
                    Descriptor::iotlb(granularity, domain),
                ],
            );
        }

        let _guard = self.lock.lock();
        let mut ccmd = LocalRegisterCopy::<u64, ContextCommand::Register>::new(0);
        ccmd.modify(
            ContextCommand::Invalidate::SET
                + ContextCommand::Granularity.val(granularity as u64)
                + ContextCommand::DomainId.val(domain as u64),
        );
        self.regs.write64(CCMD, ccmd.get());
        while self.regs.read64(CCMD) & ContextCommand::Invalidate::SET.value != 0 {
            pause();
        }

        let mut iotlb = LocalRegisterCopy::<u64, IotlbCommand::Register>::new(0);
        iotlb.modify(
            IotlbCommand::Invalidate::SET
                + IotlbCommand::Granularity.val(granularity as u64)
                + IotlbCommand::DomainId.val(domain as u64),
        );
        let offset = self.iotlb_offset();
        self.regs.write64(offset, iotlb.get());
        while self.regs.read64(offset) & IotlbCommand::Invalidate::SET.value != 0 {
            pause();
        }
        Ok(())
    }

    /// Invalidates the unit's interrupt entry cache. Only valid with interrupt remapping on, which
    /// requires queued invalidation.
    pub fn invalidate_iec(&self, remapping: bool) -> Result<()> {
        assert!(
            remapping && self.is_queued(),
            "interrupt entry invalidation needs remapping and queued invalidation"
        );
        match &self.queue {
            Some(queue) => self.submit(queue, &[Descriptor::interrupt_entries()]),
            None => Ok(()),
        }
    }

    // Appends `descs` to the queue, publishing the tail after each, then waits unlocked until
    // the unit has consumed them.
    fn submit(&self, queue: &Mutex<InvalidationQueue>, descs: &[Descriptor]) -> Result<()> {
        let end = {
            let mut queue = queue.lock();
            for desc in descs {
                while queue.is_full() {
                    queue.update_head(pointer_index(self.regs.read64(IQH)))?;
                    pause();
                }
                let slot = queue.slot_address(queue.tail());
                queue.push(*desc)?;
                self.cache.clean(slot, core::mem::size_of::<Descriptor>());
                mmio_wmb();
                self.regs.write64(IQT, queue.tail_register());
            }
            queue.tail()
        };
        loop {
            let head = pointer_index(self.regs.read64(IQH));
            let tail = pointer_index(self.regs.read64(IQT));
            if !is_pending(end, head, tail) {
                return Ok(());
            }
            pause();
        }
    }

    // Reads fault record `index` and clears it. Returns `None` if it holds no fault.
    fn take_fault(&self, index: usize) -> Option<FaultRecord> {
        let offset = self.fault_record_offset() + index * 16;
        let lo = self.regs.read64(offset);
        let hi = self.regs.read64(offset + 8);
        let record = FaultRecord::decode(lo, hi)?;
        self.regs
            .write64(offset + 8, FaultRecordHigh::Fault::SET.value);
        Some(record)
    }

    /// Drains and reports every pending fault, then acknowledges the fault status. Returns the
    /// number of fault records drained.
    pub fn fault_handler(&self) -> usize {
        let mut drained = 0;
        loop {
            let status = FaultStatusReg::new(self.regs.read32(FSTS));
            if status.get() & FAULT_EVENTS == 0 {
                return drained;
            }
            if status.is_set(FaultStatus::PrimaryPending) {
                // The record index is latched when the first fault is recorded; later records may
                // sit anywhere in the ring, so visit every slot once.
                let records = self.fault_records();
                let first = status.read(FaultStatus::RecordIndex) as usize % records;
                for index in (first..records).chain(0..first) {
                    if let Some(record) = self.take_fault(index) {
                        log::warn!("Remapping unit {:#x}: DMA fault {}", self.phys_base, record);
                        drained += 1;
                    }
                }
            }
            // The pending bit is derived from the records; the other event bits are write-1-clear.
            let ack = status.get() & FAULT_EVENTS & !FaultStatus::PrimaryPending::SET.value;
            self.regs.write32(FSTS, ack);
        }
    }
}

impl<R: RegisterIo> Drop for RemapUnit<R> {
    fn drop(&mut self) {
        if let Some(queue) = &self.queue {
            // Safety: the queue page was allocated by `new` and is only used by `self`.
            unsafe { self.pages.free(queue.lock().base_address(), 0) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iommu::test_stubs::{FakeCaps, FakeUnit, Observed};
    use hyp_pages::test_stubs::{CountingCache, HeapPages};
    use std::vec::Vec;

    fn unit(fake: &'static FakeUnit, queued: bool) -> RemapUnit<&'static FakeUnit> {
        RemapUnit::new(0xfed9_0000, fake, queued, HeapPages::leaked(), CountingCache::leaked())
            .unwrap()
    }

    #[test]
    fn rejects_unit_without_4_level_tables() {
        let fake = FakeUnit::leaked(FakeCaps {
            sagaw: 0b0010,
            ..FakeCaps::default()
        });
        assert_eq!(
            RemapUnit::new(0, fake, true, HeapPages::leaked(), CountingCache::leaked()).err(),
            Some(Error::MissingTranslationSupport)
        );
    }

    #[test]
    fn queued_only_when_supported_and_requested() {
        let with_qi = FakeUnit::leaked(FakeCaps::default());
        assert!(unit(with_qi, true).is_queued());
        assert!(!unit(with_qi, false).is_queued());
        let without_qi = FakeUnit::leaked(FakeCaps {
            queued_invalidation: false,
            ..FakeCaps::default()
        });
        assert!(!unit(without_qi, true).is_queued());
    }

    #[test]
    fn commands_change_one_bit() {
        let fake = FakeUnit::leaked(FakeCaps::default());
        let unit = unit(fake, true);
        unit.command(GlobalCommand::SetRootTable::SET);
        // The root-table status bit is still set; it must not be written back with TE.
        unit.command(GlobalCommand::Translation::SET);
        unit.command(GlobalCommand::QueuedInvalidation::SET);
        assert_eq!(fake.violations(), 0);
        let persistent = GlobalCommand::Translation::SET.value
            | GlobalCommand::QueuedInvalidation::SET.value;
        assert_eq!(fake.global_status() & !ONE_SHOT, persistent);
    }

    #[test]
    #[should_panic]
    fn two_bit_command_is_refused() {
        let fake = FakeUnit::leaked(FakeCaps::default());
        let both = GlobalCommand::Translation::SET + GlobalCommand::SetRootTable::SET;
        unit(fake, true).command(both);
    }

    #[test]
    fn init_sequence_with_queue_and_remapping() {
        let fake = FakeUnit::leaked(FakeCaps::default());
        let unit = unit(fake, true);
        let event = FaultEvent {
            data: 0x30,
            addr: 0xfee0_0000,
        };
        unit.init(PhysAddr::new(0x7000), Some(0x9007), Some(event))
            .unwrap();
        assert_eq!(fake.root_table(), 0x7000);
        assert_eq!(fake.irta(), 0x9007);
        assert_eq!(fake.fault_event(), (0, 0x30, 0xfee0_0000));
        let globals: Vec<u32> = fake
            .observed()
            .into_iter()
            .filter_map(|o| match o {
                Observed::Global(bit) => Some(bit),
                _ => None,
            })
            .collect();
        assert_eq!(
            globals,
            [1 << 30, 1 << 24, 1 << 25, 1 << 26, 1 << 31]
        );
        assert_eq!(fake.violations(), 0);
        // The initial flush went through the queue.
        let queued: Vec<Descriptor> = fake.queued();
        assert_eq!(
            queued,
            [
                Descriptor::context(Granularity::Global, 0),
                Descriptor::iotlb(Granularity::Global, 0)
            ]
        );
    }

    #[test]
    fn init_without_queue_uses_registers() {
        let fake = FakeUnit::leaked(FakeCaps::default());
        let unit = unit(fake, false);
        unit.init(PhysAddr::new(0x7000), None, None).unwrap();
        // Fault interrupts stay masked.
        assert_eq!(fake.fault_event().0, 1 << 31);
        assert!(fake.observed().contains(&Observed::Context {
            granularity: Granularity::Global as u64,
            domain: 0
        }));
        assert!(fake.observed().contains(&Observed::Iotlb {
            granularity: Granularity::Global as u64,
            domain: 0
        }));
        assert!(fake.queued().is_empty());
    }

    #[test]
    fn domain_invalidation_through_registers() {
        let fake = FakeUnit::leaked(FakeCaps::default());
        let unit = unit(fake, false);
        unit.invalidate_domain(9).unwrap();
        assert_eq!(
            fake.observed(),
            [
                Observed::Context {
                    granularity: Granularity::Domain as u64,
                    domain: 9
                },
                Observed::Iotlb {
                    granularity: Granularity::Domain as u64,
                    domain: 9
                }
            ]
        );
    }

    #[test]
    fn queue_wraps_without_overrun() {
        let fake = FakeUnit::leaked(FakeCaps::default());
        let unit = unit(fake, true);
        unit.init(PhysAddr::new(0x7000), Some(0x9007), None).unwrap();
        fake.clear_observed();
        for _ in 0..QUEUE_ENTRIES {
            unit.invalidate_iec(true).unwrap();
        }
        assert_eq!(fake.queued().len(), QUEUE_ENTRIES);
        // Two descriptors from init, then a full lap.
        assert_eq!(pointer_index(fake.tail()), 2);
        assert_eq!(fake.tail(), fake.head());
    }

    #[test]
    fn submitter_waits_for_stalled_unit() {
        let fake = FakeUnit::leaked(FakeCaps::default());
        let unit = std::sync::Arc::new(unit(fake, true));
        unit.init(PhysAddr::new(0x7000), None, None).unwrap();
        fake.clear_observed();
        fake.stall();
        let submitter = {
            let unit = unit.clone();
            std::thread::spawn(move || unit.invalidate_domain(4).unwrap())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!submitter.is_finished());
        assert!(fake.queued().is_empty());
        fake.release();
        submitter.join().unwrap();
        assert_eq!(
            fake.queued(),
            [
                Descriptor::context(Granularity::Domain, 4),
                Descriptor::iotlb(Granularity::Domain, 4)
            ]
        );
    }

    #[test]
    #[should_panic]
    fn iec_needs_remapping() {
        let fake = FakeUnit::leaked(FakeCaps::default());
        let _ = unit(fake, true).invalidate_iec(false);
    }

    #[test]
    fn fault_handler_drains_all_records() {
        let fake = FakeUnit::leaked(FakeCaps::default());
        let unit = unit(fake, true);
        fake.inject_fault(2, 0x0310, 5, 0x1000, true);
        fake.inject_fault(3, 0x0311, 6, 0x2000, false);
        fake.inject_fault(0, 0x0312, 7, 0x3000, false);
        fake.inject_status(FaultStatus::Overflow::SET.value);
        assert_eq!(unit.fault_handler(), 3);
        assert_eq!(fake.pending_faults(), 0);
        assert_eq!(fake.fault_status() & FAULT_EVENTS, 0);
        assert_eq!(unit.fault_handler(), 0);
    }

    #[test]
    fn fault_handler_skips_cleared_slots() {
        let fake = FakeUnit::leaked(FakeCaps::default());
        let unit = unit(fake, true);
        // The index latches on record 0; record 1 is empty and record 2 arrives later.
        fake.inject_fault(0, 0x0310, 5, 0x1000, true);
        fake.inject_fault(2, 0x0311, 6, 0x2000, false);
        assert_eq!(fake.fault_status() >> 8 & 0xff, 0);
        assert_eq!(unit.fault_handler(), 2);
        assert_eq!(fake.pending_faults(), 0);
        assert_eq!(fake.fault_status() & FAULT_EVENTS, 0);
    }
}
