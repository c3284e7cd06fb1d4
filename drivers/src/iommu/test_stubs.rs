// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use alloc::collections::BTreeMap;
use spin::Mutex;
use std::boxed::Box;
use std::vec::Vec;

use super::queue::{Descriptor, QUEUE_ENTRIES};
use super::registers::*;

/// Capabilities reported by a `FakeUnit`.
#[derive(Clone, Copy, Debug)]
pub struct FakeCaps {
    pub queued_invalidation: bool,
    pub interrupt_remapping: bool,
    pub coherent: bool,
    pub fault_records: usize,
    pub sagaw: u64,
    /// Byte offset of the fault recording registers.
    pub fault_record_offset: usize,
    /// Byte offset of the IOTLB register block.
    pub iotlb_offset: usize,
}

impl Default for FakeCaps {
    fn default() -> Self {
        Self {
            queued_invalidation: true,
            interrupt_remapping: true,
            coherent: true,
            fault_records: 4,
            sagaw: 0b0110,
            fault_record_offset: 0x200,
            iotlb_offset: 0x100,
        }
    }
}

/// A request the unit acted on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observed {
    /// A global command bit.
    Global(u32),
    /// A context-cache invalidation through the command register.
    Context { granularity: u64, domain: u16 },
    /// An IOTLB invalidation through the command register.
    Iotlb { granularity: u64, domain: u16 },
    /// A descriptor consumed from the invalidation queue.
    Queued(Descriptor),
}

#[derive(Default)]
struct State {
    gsts: u32,
    regs: BTreeMap<usize, u64>,
    iqh: usize,
    iqt: u64,
    stalled: bool,
    observed: Vec<Observed>,
    violations: usize,
    faults: Vec<(u64, u64)>,
    // Record index latched when the primary pending bit last went from clear to set.
    fri: usize,
    fault_status: u32,
}

/// Emulates the register file of one remapping unit.
///
/// Global commands complete immediately and each write that triggers more than one command is
/// counted as a violation. Queued descriptors are consumed from memory as soon as the tail is
/// written unless the unit is stalled.
pub struct FakeUnit {
    caps: FakeCaps,
    state: Mutex<State>,
}

const PERSISTENT: u32 = 0xff80_0000 & !ONE_SHOT;

impl FakeUnit {
    pub fn new(caps: FakeCaps) -> Self {
        let state = State {
            faults: alloc::vec![(0, 0); caps.fault_records],
            ..State::default()
        };
        Self {
            caps,
            state: Mutex::new(state),
        }
    }

    /// Creates a unit for the life of the test binary.
    pub fn leaked(caps: FakeCaps) -> &'static Self {
        Box::leak(Box::new(Self::new(caps)))
    }

    fn capability(&self) -> u64 {
        let c = &self.caps;
        c.sagaw << 8 | (c.fault_record_offset as u64 / 16) << 24 | (c.fault_records as u64 - 1) << 40
    }

    fn ext_capability(&self) -> u64 {
        let c = &self.caps;
        c.coherent as u64
            | (c.queued_invalidation as u64) << 1
            | (c.interrupt_remapping as u64) << 3
            | (c.iotlb_offset as u64 / 16) << 8
    }

    // Returns the fault record and half addressed by `offset`, if any.
    fn fault_slot(&self, offset: usize) -> Option<(usize, bool)> {
        let start = self.caps.fault_record_offset;
        let end = start + self.caps.fault_records * 16;
        (start..end)
            .contains(&offset)
            .then(|| ((offset - start) / 16, (offset - start) % 16 == 8))
    }

    fn any_fault(state: &State) -> bool {
        state.faults.iter().any(|&(_, hi)| hi >> 63 != 0)
    }

    fn fault_status_locked(state: &State) -> u32 {
        if Self::any_fault(state) {
            state.fault_status | FaultStatus::PrimaryPending::SET.value | (state.fri as u32) << 8
        } else {
            state.fault_status
        }
    }

    fn global_command(state: &mut State, val: u32) {
        let triggered = ((val ^ state.gsts) & PERSISTENT) | (val & ONE_SHOT);
        if triggered.count_ones() > 1 {
            state.violations += 1;
        }
        for bit in (0..32).map(|b| 1u32 << b).filter(|b| triggered & b != 0) {
            state.observed.push(Observed::Global(bit));
            if bit & ONE_SHOT != 0 {
                state.gsts |= bit;
            } else {
                state.gsts ^= bit;
            }
            if bit == GlobalCommand::QueuedInvalidation::SET.value {
                state.iqh = 0;
            }
        }
    }

    fn consume(state: &mut State) {
        let queued = state.gsts & GlobalCommand::QueuedInvalidation::SET.value != 0;
        if state.stalled || !queued {
            return;
        }
        let base = state.regs.get(&IQA).copied().unwrap_or(0) & !0xfff;
        let tail = (state.iqt >> 4) as usize % QUEUE_ENTRIES;
        while state.iqh != tail {
            let slot = (base + state.iqh as u64 * 16) as *const Descriptor;
            // Safety: IQA points at the driver's queue page, which outlives the unit.
            let desc = unsafe { slot.read_volatile() };
            state.observed.push(Observed::Queued(desc));
            state.iqh = (state.iqh + 1) % QUEUE_ENTRIES;
        }
    }

    /// Returns every request acted on so far.
    pub fn observed(&self) -> Vec<Observed> {
        self.state.lock().observed.clone()
    }

    /// Returns the descriptors consumed from the queue so far.
    pub fn queued(&self) -> Vec<Descriptor> {
        self.state
            .lock()
            .observed
            .iter()
            .filter_map(|o| match o {
                Observed::Queued(desc) => Some(*desc),
                _ => None,
            })
            .collect()
    }

    pub fn clear_observed(&self) {
        self.state.lock().observed.clear();
    }

    /// Returns the number of command writes that changed more than one bit.
    pub fn violations(&self) -> usize {
        self.state.lock().violations
    }

    pub fn global_status(&self) -> u32 {
        self.state.lock().gsts
    }

    fn reg(&self, offset: usize) -> u64 {
        self.state.lock().regs.get(&offset).copied().unwrap_or(0)
    }

    pub fn root_table(&self) -> u64 {
        self.reg(RTADDR)
    }

    pub fn irta(&self) -> u64 {
        self.reg(IRTA)
    }

    pub fn iqa(&self) -> u64 {
        self.reg(IQA)
    }

    /// Returns the queue head register.
    pub fn head(&self) -> u64 {
        (self.state.lock().iqh as u64) << 4
    }

    /// Returns the queue tail register.
    pub fn tail(&self) -> u64 {
        self.state.lock().iqt
    }

    /// Returns the fault event control, data and address registers.
    pub fn fault_event(&self) -> (u32, u32, u32) {
        (
            self.reg(FECTL) as u32,
            self.reg(FEDATA) as u32,
            self.reg(FEADDR) as u32,
        )
    }

    /// Stops consuming queued descriptors.
    pub fn stall(&self) {
        self.state.lock().stalled = true;
    }

    /// Resumes consuming queued descriptors, starting with those already published.
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.stalled = false;
        Self::consume(&mut state);
    }

    /// Records a primary fault in record `index`. The record index reported in the fault status
    /// only changes when no other record is pending.
    pub fn inject_fault(&self, index: usize, source: u16, reason: u8, addr: u64, is_read: bool) {
        let hi = 1 << 63 | (is_read as u64) << 62 | (reason as u64) << 32 | source as u64;
        let mut state = self.state.lock();
        if !Self::any_fault(&state) {
            state.fri = index;
        }
        state.faults[index] = (addr, hi);
    }

    /// Raises the write-1-clear fault status bits in `bits`.
    pub fn inject_status(&self, bits: u32) {
        self.state.lock().fault_status |= bits;
    }

    /// Returns the number of fault records not yet cleared.
    pub fn pending_faults(&self) -> usize {
        let state = self.state.lock();
        state.faults.iter().filter(|&&(_, hi)| hi >> 63 != 0).count()
    }

    pub fn fault_status(&self) -> u32 {
        Self::fault_status_locked(&self.state.lock())
    }
}

impl RegisterIo for FakeUnit {
    fn read32(&self, offset: usize) -> u32 {
        let state = self.state.lock();
        match offset {
            VER => 0x10,
            GSTS => state.gsts,
            FSTS => Self::fault_status_locked(&state),
            _ => state.regs.get(&offset).copied().unwrap_or(0) as u32,
        }
    }

    fn read64(&self, offset: usize) -> u64 {
        if offset == CAP {
            return self.capability();
        }
        if offset == ECAP {
            return self.ext_capability();
        }
        let state = self.state.lock();
        if let Some((index, high)) = self.fault_slot(offset) {
            let (lo, hi) = state.faults[index];
            return if high { hi } else { lo };
        }
        match offset {
            IQH => (state.iqh as u64) << 4,
            IQT => state.iqt,
            _ => state.regs.get(&offset).copied().unwrap_or(0),
        }
    }

    fn write32(&self, offset: usize, val: u32) {
        let mut state = self.state.lock();
        match offset {
            GCMD => Self::global_command(&mut state, val),
            FSTS => {
                state.fault_status &= !(val & FAULT_EVENTS & !FaultStatus::PrimaryPending::SET.value)
            }
            _ => {
                state.regs.insert(offset, val as u64);
            }
        }
    }

    fn write64(&self, offset: usize, val: u64) {
        let mut state = self.state.lock();
        if let Some((index, high)) = self.fault_slot(offset) {
            if high {
                state.faults[index].1 &= !(val & FaultRecordHigh::Fault::SET.value);
            }
            return;
        }
        let iotlb = self.caps.iotlb_offset + IOTLB;
        match offset {
            IQT => {
                state.iqt = val;
                Self::consume(&mut state);
            }
            CCMD => {
                state.observed.push(Observed::Context {
                    granularity: (val >> 61) & 0x3,
                    domain: val as u16,
                });
                state.regs.insert(offset, val & !(1 << 63));
            }
            _ if offset == iotlb => {
                state.observed.push(Observed::Iotlb {
                    granularity: (val >> 60) & 0x3,
                    domain: (val >> 32) as u16,
                });
                state.regs.insert(offset, val & !(1 << 63));
            }
            _ => {
                state.regs.insert(offset, val);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_capabilities() {
        let fake = FakeUnit::new(FakeCaps::default());
        let cap = CapabilityReg::new(fake.read64(CAP));
        assert_eq!(cap.read(Capability::Sagaw), 0b0110);
        assert_eq!(cap.read(Capability::NumFaultRecords), 3);
        assert_eq!(cap.read(Capability::FaultRecordOffset) * 16, 0x200);
        assert_eq!(fake.read64(ECAP), 0x100b);
    }

    #[test]
    fn rewriting_one_shot_status_is_a_violation() {
        let fake = FakeUnit::new(FakeCaps::default());
        fake.write32(GCMD, GlobalCommand::SetRootTable::SET.value);
        let status = fake.read32(GSTS);
        fake.write32(GCMD, status | GlobalCommand::Translation::SET.value);
        assert_eq!(fake.violations(), 1);
    }
}
