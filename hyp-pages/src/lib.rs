// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! # Physical pages and the memory services consumed by the translation engine.
//!
//! ## Key types
//!
//! - `PhysAddr` and `GuestPhysAddr` keep host-physical and guest-physical (or device-virtual)
//!   addresses apart.
//! - `PageSize` and the order helpers describe the granules a translation tree can map. An order
//!   is the base-2 logarithm of a number of 4kB pages.
//! - `PageAllocator` is the interface to the host's physical page allocator, which supplies
//!   zero- or pattern-filled pages for translation tables and remapping structures.
//! - `CacheMaintenance` cleans processor cache lines for structures read by hardware that does not
//!   snoop processor caches.
//!
//! The hypervisor identity maps physical memory, so a `PhysAddr` can be turned into a pointer
//! directly.
#![no_std]

#[cfg(any(test, feature = "test-stubs"))]
extern crate std;

mod addr;
mod cache;
mod page;
mod page_alloc;
/// Host-side stand-ins for the page allocator and cache maintenance.
#[cfg(any(test, feature = "test-stubs"))]
pub mod test_stubs;

pub use addr::{GuestPhysAddr, PhysAddr};
pub use cache::CacheMaintenance;
pub use page::{order_bytes, order_pages, PageSize, PAGE_SHIFT, PAGE_SIZE};
pub use page_alloc::{Fill, PageAllocator};
