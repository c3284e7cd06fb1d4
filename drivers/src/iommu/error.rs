// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

/// Errors resulting from interacting with the remapping hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Not enough memory for a context table, the interrupt-remap table or a queue.
    InsufficientMemory,
    /// The registry is already tracking the maximum number of units.
    TooManyUnits,
    /// No unit has its registers at this physical address.
    UnitNotFound(u64),
    /// The unit cannot walk a second-level table with this number of levels.
    UnsupportedAddressWidth(usize),
    /// Requester identifiers are 16 bits wide.
    InvalidRequesterId(u32),
    /// No room left in the invalidation queue.
    QueueFull,
    /// Hardware reported a queue head outside the outstanding descriptors.
    InvalidQueuePointer(usize),
    /// The unit lacks 4-level second-level translation.
    MissingTranslationSupport,
}

/// Holds results for remapping operations.
pub type Result<T> = core::result::Result<T, Error>;
