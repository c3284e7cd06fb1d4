// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

/// Errors resulting from manipulating a translation tree or guest address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The page allocator could not supply a table page.
    InsufficientMemory,
    /// An input or output address is not aligned to a 4kB page.
    MisalignedAddress(u64),
    /// The range starting at this input address does not fit in the tree's input space.
    AddressOutOfRange(u64),
    /// The requested order exceeds what a single update can cover.
    OrderTooLarge(u32),
    /// The address space is being or has been destroyed.
    SpaceDestroyed,
}

/// Holds results for page table operations.
pub type Result<T> = core::result::Result<T, Error>;
