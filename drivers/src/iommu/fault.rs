// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use core::fmt;
use tock_registers::LocalRegisterCopy;

use super::registers::FaultRecordHigh;

/// The message-signalled interrupt a unit raises when it records a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultEvent {
    pub data: u32,
    pub addr: u32,
}

/// One primary fault recorded by a unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultRecord {
    /// Requester id of the faulting device.
    pub source: u16,
    /// Architecture-defined fault reason code.
    pub reason: u8,
    pub is_read: bool,
    /// Page address of the faulting request.
    pub addr: u64,
}

impl FaultRecord {
    /// Decodes a fault recording register pair. Returns `None` if the record is not valid.
    pub fn decode(lo: u64, hi: u64) -> Option<Self> {
        let hi = LocalRegisterCopy::<u64, FaultRecordHigh::Register>::new(hi);
        if !hi.is_set(FaultRecordHigh::Fault) {
            return None;
        }
        Some(Self {
            source: hi.read(FaultRecordHigh::SourceId) as u16,
            reason: hi.read(FaultRecordHigh::Reason) as u8,
            is_read: hi.is_set(FaultRecordHigh::Type),
            addr: lo & !0xfff,
        })
    }
}

impl fmt::Display for FaultRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let [bus, devfn] = self.source.to_be_bytes();
        write!(
            f,
            "{:02x}:{:02x}.{} {} {:#x} reason {:#x}",
            bus,
            devfn >> 3,
            devfn & 0x7,
            if self.is_read { "read" } else { "write" },
            self.addr,
            self.reason
        )
    }
}
