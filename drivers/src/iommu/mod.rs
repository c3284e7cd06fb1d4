// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

mod context;
mod entry;
mod error;
mod fault;
mod irt;
mod queue;
mod registers;
mod registry;
/// Emulated remapping unit for tests.
#[cfg(any(test, feature = "test-stubs"))]
pub mod test_stubs;
mod unit;

pub use context::ContextTables;
pub use error::Error as IommuError;
pub use error::Result as IommuResult;
pub use fault::{FaultEvent, FaultRecord};
pub use irt::{RemapTable, IRT_ENTRIES};
pub use queue::{Descriptor, DescriptorType, Granularity, InvalidationQueue};
pub use registers::{MmioRegisters, RegisterIo};
pub use registry::{DmaSpace, RemapConfig, UnitRegistry, MAX_UNITS};
pub use unit::RemapUnit;
