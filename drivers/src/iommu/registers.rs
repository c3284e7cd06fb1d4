// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use core::mem::offset_of;
use hyp_pages::PhysAddr;
use static_assertions::const_assert_eq;
use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::register_bitfields;
use tock_registers::registers::{ReadOnly, ReadWrite, WriteOnly};
use tock_registers::LocalRegisterCopy;

// Remapping unit register definitions; see the Intel Virtualization Technology for Directed I/O
// architecture specification, chapter 11.

pub(crate) const VER: usize = 0x000;
pub(crate) const CAP: usize = 0x008;
pub(crate) const ECAP: usize = 0x010;
pub(crate) const GCMD: usize = 0x018;
pub(crate) const GSTS: usize = 0x01c;
pub(crate) const RTADDR: usize = 0x020;
pub(crate) const CCMD: usize = 0x028;
pub(crate) const FSTS: usize = 0x034;
pub(crate) const FECTL: usize = 0x038;
pub(crate) const FEDATA: usize = 0x03c;
pub(crate) const FEADDR: usize = 0x040;
pub(crate) const IQH: usize = 0x080;
pub(crate) const IQT: usize = 0x088;
pub(crate) const IQA: usize = 0x090;
pub(crate) const IRTA: usize = 0x0b8;
// Offset of the IOTLB invalidate register inside the block found at `ECAP.IRO`.
pub(crate) const IOTLB: usize = 0x008;

register_bitfields![u64,
    pub Capability [
        // Supported adjusted guest address widths; bit n set means n + 2 levels.
        Sagaw OFFSET(8) NUMBITS(5),
        // Fault recording register offset in 16-byte units.
        FaultRecordOffset OFFSET(24) NUMBITS(10),
        // Number of fault recording registers minus one.
        NumFaultRecords OFFSET(40) NUMBITS(8),
    ],

    pub ExtCapability [
        Coherent OFFSET(0) NUMBITS(1),
        QueuedInvalidation OFFSET(1) NUMBITS(1),
        DeviceTlb OFFSET(2) NUMBITS(1),
        InterruptRemapping OFFSET(3) NUMBITS(1),
        // IOTLB register block offset in 16-byte units.
        IotlbRegisterOffset OFFSET(8) NUMBITS(10),
    ],

    pub ContextCommand [
        DomainId OFFSET(0) NUMBITS(16),
        Granularity OFFSET(61) NUMBITS(2),
        Invalidate OFFSET(63) NUMBITS(1),
    ],

    pub IotlbCommand [
        DomainId OFFSET(32) NUMBITS(16),
        Granularity OFFSET(60) NUMBITS(2),
        Invalidate OFFSET(63) NUMBITS(1),
    ],

    pub FaultRecordHigh [
        SourceId OFFSET(0) NUMBITS(16),
        Reason OFFSET(32) NUMBITS(8),
        // Set for reads, clear for writes.
        Type OFFSET(62) NUMBITS(1),
        Fault OFFSET(63) NUMBITS(1),
    ],
];

register_bitfields![u32,
    pub GlobalCommand [
        CompatibilityFormat OFFSET(23) NUMBITS(1),
        SetInterruptTable OFFSET(24) NUMBITS(1),
        InterruptRemapping OFFSET(25) NUMBITS(1),
        QueuedInvalidation OFFSET(26) NUMBITS(1),
        WriteBufferFlush OFFSET(27) NUMBITS(1),
        AdvancedFaultLog OFFSET(28) NUMBITS(1),
        SetFaultLog OFFSET(29) NUMBITS(1),
        SetRootTable OFFSET(30) NUMBITS(1),
        Translation OFFSET(31) NUMBITS(1),
    ],

    pub FaultStatus [
        Overflow OFFSET(0) NUMBITS(1),
        PrimaryPending OFFSET(1) NUMBITS(1),
        AdvancedOverflow OFFSET(2) NUMBITS(1),
        AdvancedPending OFFSET(3) NUMBITS(1),
        QueueError OFFSET(4) NUMBITS(1),
        CompletionError OFFSET(5) NUMBITS(1),
        TimeoutError OFFSET(6) NUMBITS(1),
        RecordIndex OFFSET(8) NUMBITS(8),
    ],

    pub FaultEventControl [
        InterruptPending OFFSET(30) NUMBITS(1),
        InterruptMask OFFSET(31) NUMBITS(1),
    ],
];

/// Global command bits that trigger an action rather than hold state. Their status bits stay set
/// after completion and must not be written back.
// TODO: Check against the full GCMD description of newer hardware revisions; only these four
// are known to be one-shot.
pub(crate) const ONE_SHOT: u32 = GlobalCommand::SetRootTable::SET.value
    | GlobalCommand::SetFaultLog::SET.value
    | GlobalCommand::WriteBufferFlush::SET.value
    | GlobalCommand::SetInterruptTable::SET.value;

/// Low bits of the fault status register that report events.
pub(crate) const FAULT_EVENTS: u32 = 0xff;

pub(crate) type CapabilityReg = LocalRegisterCopy<u64, Capability::Register>;
pub(crate) type ExtCapabilityReg = LocalRegisterCopy<u64, ExtCapability::Register>;
pub(crate) type FaultStatusReg = LocalRegisterCopy<u32, FaultStatus::Register>;

/// Access to the register file of one remapping unit by byte offset.
pub trait RegisterIo: Sync {
    fn read32(&self, offset: usize) -> u32;
    fn read64(&self, offset: usize) -> u64;
    fn write32(&self, offset: usize, val: u32);
    fn write64(&self, offset: usize, val: u64);
}

impl<T: RegisterIo + ?Sized> RegisterIo for &T {
    fn read32(&self, offset: usize) -> u32 {
        (**self).read32(offset)
    }

    fn read64(&self, offset: usize) -> u64 {
        (**self).read64(offset)
    }

    fn write32(&self, offset: usize, val: u32) {
        (**self).write32(offset, val)
    }

    fn write64(&self, offset: usize, val: u64) {
        (**self).write64(offset, val)
    }
}

/// The fixed part of a unit's register page.
#[repr(C)]
pub struct VtdRegisters {
    pub version: ReadOnly<u32>,
    _reserved0: u32,
    pub capability: ReadOnly<u64, Capability::Register>,
    pub ext_capability: ReadOnly<u64, ExtCapability::Register>,
    pub global_command: WriteOnly<u32, GlobalCommand::Register>,
    pub global_status: ReadOnly<u32, GlobalCommand::Register>,
    pub root_table: ReadWrite<u64>,
    pub context_command: ReadWrite<u64, ContextCommand::Register>,
    _reserved1: u32,
    pub fault_status: ReadWrite<u32, FaultStatus::Register>,
    pub fault_event_control: ReadWrite<u32, FaultEventControl::Register>,
    pub fault_event_data: ReadWrite<u32>,
    pub fault_event_address: ReadWrite<u32>,
    pub fault_event_upper_address: ReadWrite<u32>,
    _reserved2: [u64; 7],
    pub queue_head: ReadOnly<u64>,
    pub queue_tail: ReadWrite<u64>,
    pub queue_address: ReadWrite<u64>,
    _reserved3: [u64; 4],
    pub interrupt_table: ReadWrite<u64>,
}

const_assert_eq!(offset_of!(VtdRegisters, capability), CAP);
const_assert_eq!(offset_of!(VtdRegisters, ext_capability), ECAP);
const_assert_eq!(offset_of!(VtdRegisters, global_command), GCMD);
const_assert_eq!(offset_of!(VtdRegisters, global_status), GSTS);
const_assert_eq!(offset_of!(VtdRegisters, root_table), RTADDR);
const_assert_eq!(offset_of!(VtdRegisters, context_command), CCMD);
const_assert_eq!(offset_of!(VtdRegisters, fault_status), FSTS);
const_assert_eq!(offset_of!(VtdRegisters, fault_event_control), FECTL);
const_assert_eq!(offset_of!(VtdRegisters, fault_event_data), FEDATA);
const_assert_eq!(offset_of!(VtdRegisters, fault_event_address), FEADDR);
const_assert_eq!(offset_of!(VtdRegisters, queue_head), IQH);
const_assert_eq!(offset_of!(VtdRegisters, queue_tail), IQT);
const_assert_eq!(offset_of!(VtdRegisters, queue_address), IQA);
const_assert_eq!(offset_of!(VtdRegisters, interrupt_table), IRTA);

/// One fault recording register, at `CAP.FRO` plus 16 bytes per record.
#[repr(C)]
pub struct FaultRecordRegisters {
    pub info: ReadWrite<u64>,
    pub status: ReadWrite<u64, FaultRecordHigh::Register>,
}

/// The IOTLB invalidation registers, at `ECAP.IRO`.
#[repr(C)]
pub struct IotlbRegisters {
    pub address: ReadWrite<u64>,
    pub command: ReadWrite<u64, IotlbCommand::Register>,
}

const_assert_eq!(offset_of!(IotlbRegisters, command), IOTLB);

/// The memory-mapped register file of a unit, accessed through the hypervisor's identity map.
pub struct MmioRegisters {
    regs: &'static VtdRegisters,
}

impl MmioRegisters {
    /// Creates an accessor for the registers at `base`.
    ///
    /// # Safety
    ///
    /// `base` must map a remapping unit's register page exclusively owned by the caller.
    pub unsafe fn new(base: PhysAddr) -> Self {
        Self {
            regs: &*base.as_ptr::<VtdRegisters>(),
        }
    }

    /// Returns the fixed registers.
    pub fn registers(&self) -> &VtdRegisters {
        self.regs
    }

    /// Returns the register of width `T` at `offset` outside the fixed layout, such as a fault
    /// record or the IOTLB block.
    fn at<T>(&self, offset: usize) -> &T {
        let base = self.regs as *const VtdRegisters as *const u8;
        // Safety: `new` requires `base` to map the unit's register page, and the offsets read
        // from the capability registers stay within it.
        unsafe { &*(base.add(offset) as *const T) }
    }
}

// Safety: the register page is only reached through volatile register accesses, and `new`
// makes it exclusive to this accessor.
unsafe impl Send for MmioRegisters {}
unsafe impl Sync for MmioRegisters {}

impl RegisterIo for MmioRegisters {
    fn read32(&self, offset: usize) -> u32 {
        let regs = self.regs;
        match offset {
            VER => regs.version.get(),
            GSTS => regs.global_status.get(),
            FSTS => regs.fault_status.get(),
            FECTL => regs.fault_event_control.get(),
            FEDATA => regs.fault_event_data.get(),
            FEADDR => regs.fault_event_address.get(),
            _ => self.at::<ReadOnly<u32>>(offset).get(),
        }
    }

    fn read64(&self, offset: usize) -> u64 {
        let regs = self.regs;
        match offset {
            CAP => regs.capability.get(),
            ECAP => regs.ext_capability.get(),
            RTADDR => regs.root_table.get(),
            CCMD => regs.context_command.get(),
            IQH => regs.queue_head.get(),
            IQT => regs.queue_tail.get(),
            IQA => regs.queue_address.get(),
            IRTA => regs.interrupt_table.get(),
            _ => self.at::<ReadOnly<u64>>(offset).get(),
        }
    }

    fn write32(&self, offset: usize, val: u32) {
        let regs = self.regs;
        match offset {
            GCMD => regs.global_command.set(val),
            FSTS => regs.fault_status.set(val),
            FECTL => regs.fault_event_control.set(val),
            FEDATA => regs.fault_event_data.set(val),
            FEADDR => regs.fault_event_address.set(val),
            _ => self.at::<WriteOnly<u32>>(offset).set(val),
        }
    }

    fn write64(&self, offset: usize, val: u64) {
        let regs = self.regs;
        match offset {
            RTADDR => regs.root_table.set(val),
            CCMD => regs.context_command.set(val),
            IQT => regs.queue_tail.set(val),
            IQA => regs.queue_address.set(val),
            IRTA => regs.interrupt_table.set(val),
            _ => self.at::<WriteOnly<u64>>(offset).set(val),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_bits() {
        assert_eq!(ONE_SHOT, 1 << 30 | 1 << 29 | 1 << 27 | 1 << 24);
        assert_eq!(GlobalCommand::Translation::SET.value, 1 << 31);
    }

    #[test]
    fn mmio_accesses_reach_their_registers() {
        use hyp_pages::test_stubs::HeapPages;
        use hyp_pages::{Fill, PageAllocator};
        let page = HeapPages::leaked().alloc(0, Fill::Bits0).unwrap();
        let words = |offset: usize| unsafe { page.as_ptr::<u8>().add(offset).cast::<u64>().read() };
        let regs = unsafe { MmioRegisters::new(page) };
        regs.write64(IRTA, 0x1234_5000);
        regs.write64(IQT, 0x20);
        regs.write32(FEDATA, 0x41);
        regs.write32(FEADDR, 0xfee0_0000);
        // A fault record at 0x200 and the IOTLB command at 0x108.
        regs.write64(0x208, 1 << 63);
        regs.write64(0x100 + IOTLB, 0x9000_0000_0000_0000);
        assert_eq!(words(IRTA), 0x1234_5000);
        assert_eq!(regs.registers().queue_tail.get(), 0x20);
        assert_eq!(regs.read64(IQT), 0x20);
        assert_eq!(words(FECTL) >> 32, 0x41);
        assert_eq!(words(FEADDR), 0xfee0_0000);
        assert_eq!(regs.read32(FEADDR), 0xfee0_0000);
        assert_eq!(regs.read64(0x208), 1 << 63);
        assert_eq!(words(0x108), 0x9000_0000_0000_0000);
        assert_eq!(regs.read32(VER), 0);
    }

    #[test]
    fn capability_offsets() {
        // FRO of 0x20 units, 8 records; IRO of 0x10 units.
        let cap = CapabilityReg::new(0x0700_2000_0400);
        assert_eq!(cap.read(Capability::FaultRecordOffset) * 16, 0x200);
        assert_eq!(cap.read(Capability::NumFaultRecords) + 1, 8);
        assert_eq!(cap.read(Capability::Sagaw), 0b100);
        let ecap = ExtCapabilityReg::new(0x100b);
        assert_eq!(ecap.read(ExtCapability::IotlbRegisterOffset) * 16, 0x100);
        assert!(ecap.is_set(ExtCapability::QueuedInvalidation));
        assert!(ecap.is_set(ExtCapability::InterruptRemapping));
        assert!(!ecap.is_set(ExtCapability::DeviceTlb));
    }
}
