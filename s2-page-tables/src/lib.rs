// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! # Second-stage translation tables for guest and device address spaces.
//!
//! ## Key types
//!
//! - `PageTable` is a generic multi-level radix tree of atomic entries. Its geometry (number of
//!   levels, index bits per level, largest leaf level) and the bit layout of its entries come from
//!   a `PageTableFormat`.
//! - `Npt` (aarch64 stage 2) and `Ept` (x86 EPT, shared with the DMA remapping hardware) are the
//!   formats. They translate an abstract `PageAttrs` (permissions, cacheability, shareability) to
//!   an entry word and back.
//! - `TranslationRoot` binds a tree to a `RegimeControl`, which knows how to load the tree into
//!   the processor tagged with a `RegimeId` and how to flush that regime's cached translations.
//! - `GuestSpace` is the only mutation surface the rest of the hypervisor sees: `update`, `sync`
//!   and `invalidate`, plus the per-processor dirty set consumed by cross-processor `Shootdown`.
//!
//! ## Concurrency
//!
//! Any number of processors may update the same tree at once. New intermediate tables are
//! published with a single compare-and-exchange of the zero entry, splits of large leaves with a
//! compare-and-exchange of the old leaf, and leaf writes are single-word stores, so walkers never
//! observe a torn tree and unrelated ranges never contend on a lock. Tables detached from the tree
//! are retired until the next completed `sync()`, and freed only once every software walk that
//! started before they were detached has finished.
#![no_std]

extern crate alloc;

// Include std when running unit tests.
#[cfg(any(test, feature = "test-stubs"))]
#[macro_use]
extern crate std;

mod attr;
mod cpu_set;
mod ept;
mod error;
mod guest_space;
mod npt;
mod page_table;
/// Provides access to the bits of a translation table entry.
mod pte;
mod regime;
mod root;
mod shootdown;
mod walkers;
/// Provides stubs for test harnesses.
#[cfg(any(test, feature = "test-stubs"))]
pub mod test_stubs;
/// Provides low-level TLB management functions.
pub mod tlb;

pub use attr::{Cacheability, PageAttrs, Permissions, Shareability};
pub use cpu_set::{CpuId, CpuSet, MAX_CPUS};
pub use ept::Ept;
pub use error::{Error as PageTableError, Result as PageTableResult};
pub use guest_space::{GuestSpace, SpaceState};
pub use npt::Npt;
pub use page_table::{EntryRef, PageTable, PageTableFormat, Translation};
pub use regime::{Eptp, LoadedRoots, RegimeControl, RegimeId, Vttbr};
pub use root::TranslationRoot;
pub use shootdown::{Shootdown, TlbTarget};
