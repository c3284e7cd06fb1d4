// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use crate::addr::PhysAddr;

/// Processor cache maintenance for memory read by agents that may not snoop processor caches.
pub trait CacheMaintenance: Sync {
    /// Writes back every processor cache line overlapping `[addr, addr + len)` so a non-coherent
    /// reader observes the latest stores.
    fn clean(&self, addr: PhysAddr, len: usize);

    /// Returns the data-cache line size in bytes.
    fn line_size(&self) -> usize {
        64
    }
}
