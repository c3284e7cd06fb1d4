// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use crate::addr::PhysAddr;

/// How the allocator initializes the pages it hands out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fill {
    /// Every bit cleared.
    Bits0,
    /// Every bit set.
    Bits1,
}

/// The host's physical page allocator.
///
/// Translation trees and remapping structures get every page they use from here and give them
/// back when the structure is torn down. Pages are aligned to their own size.
pub trait PageAllocator: Sync {
    /// Allocates `2^order` contiguous base pages initialized according to `fill`. Returns `None`
    /// if no suitable block is available.
    fn alloc(&self, order: u32, fill: Fill) -> Option<PhysAddr>;

    /// Returns a block to the allocator.
    ///
    /// # Safety
    ///
    /// `addr` must have been returned by `alloc()` on this allocator with the same `order`, and no
    /// references to the block (including hardware ones) may remain.
    unsafe fn free(&self, addr: PhysAddr, order: u32);
}
