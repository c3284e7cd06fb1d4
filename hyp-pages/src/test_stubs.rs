// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::boxed::Box;
use std::vec::Vec;

use crate::{order_bytes, CacheMaintenance, Fill, PageAllocator, PhysAddr};

/// A page allocator backed by the host heap. Every block is aligned to its size and "physical"
/// addresses are the host pointers, matching the hypervisor's identity map.
pub struct HeapPages {
    live: Mutex<Vec<(u64, u32)>>,
    // Number of allocations that may still succeed.
    budget: AtomicUsize,
    total: AtomicUsize,
}

impl HeapPages {
    /// Creates an allocator with no allocation limit.
    pub fn new() -> Self {
        Self {
            live: Mutex::new(Vec::new()),
            budget: AtomicUsize::new(usize::MAX),
            total: AtomicUsize::new(0),
        }
    }

    /// Creates an allocator for the life of the test binary.
    pub fn leaked() -> &'static Self {
        Box::leak(Box::new(Self::new()))
    }

    /// Lets only the next `count` allocations succeed.
    pub fn fail_after(&self, count: usize) {
        self.budget.store(count, Ordering::SeqCst);
    }

    /// Removes any allocation limit.
    pub fn unlimited(&self) {
        self.budget.store(usize::MAX, Ordering::SeqCst);
    }

    /// Returns the number of blocks currently allocated.
    pub fn live_blocks(&self) -> usize {
        self.live.lock().len()
    }

    /// Returns the number of successful allocations made so far.
    pub fn total_allocs(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// Returns if `addr` is the start of a live block.
    pub fn is_live(&self, addr: PhysAddr) -> bool {
        self.live.lock().iter().any(|&(a, _)| a == addr.bits())
    }

    fn layout(order: u32) -> Layout {
        let size = order_bytes(order) as usize;
        // Unwrap ok: sizes are non-zero powers of two.
        Layout::from_size_align(size, size).unwrap()
    }
}

impl Default for HeapPages {
    fn default() -> Self {
        Self::new()
    }
}

impl PageAllocator for HeapPages {
    fn alloc(&self, order: u32, fill: Fill) -> Option<PhysAddr> {
        let taken = self
            .budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| match b {
                usize::MAX => Some(b),
                0 => None,
                _ => Some(b - 1),
            });
        taken.ok()?;
        let layout = Self::layout(order);
        // Not safe - just a test. The layout is non-zero sized.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        if fill == Fill::Bits1 {
            // Safety: `ptr` points to `layout.size()` freshly allocated bytes.
            unsafe { core::ptr::write_bytes(ptr, 0xff, layout.size()) };
        }
        self.live.lock().push((ptr as u64, order));
        self.total.fetch_add(1, Ordering::SeqCst);
        Some(PhysAddr::new(ptr as u64))
    }

    unsafe fn free(&self, addr: PhysAddr, order: u32) {
        let mut live = self.live.lock();
        let pos = live
            .iter()
            .position(|&(a, o)| a == addr.bits() && o == order)
            .expect("freeing a block that was never allocated");
        live.swap_remove(pos);
        dealloc(addr.as_mut_ptr::<u8>(), Self::layout(order));
    }
}

/// Records every range it is asked to clean.
#[derive(Default)]
pub struct CountingCache {
    cleaned: Mutex<Vec<(u64, usize)>>,
}

impl CountingCache {
    /// Creates a cache stub for the life of the test binary.
    pub fn leaked() -> &'static Self {
        Box::leak(Box::default())
    }

    /// Returns the number of clean requests seen.
    pub fn cleans(&self) -> usize {
        self.cleaned.lock().len()
    }

    /// Returns if some clean request covered `[addr, addr + len)` entirely.
    pub fn covered(&self, addr: PhysAddr, len: usize) -> bool {
        self.cleaned.lock().iter().any(|&(a, l)| {
            a <= addr.bits() && addr.bits() + len as u64 <= a + l as u64
        })
    }
}

impl CacheMaintenance for CountingCache {
    fn clean(&self, addr: PhysAddr, len: usize) {
        self.cleaned.lock().push((addr.bits(), len));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_pages_fill_and_budget() {
        let pages = HeapPages::new();
        let zeroed = pages.alloc(0, Fill::Bits0).unwrap();
        assert!(zeroed.is_page_aligned());
        // Safety: just allocated, 4kB long.
        let bytes = unsafe { core::slice::from_raw_parts(zeroed.as_ptr::<u8>(), 4096) };
        assert!(bytes.iter().all(|&b| b == 0));
        let ones = pages.alloc(0, Fill::Bits1).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(ones.as_ptr::<u8>(), 4096) };
        assert!(bytes.iter().all(|&b| b == 0xff));
        assert_eq!(pages.live_blocks(), 2);

        pages.fail_after(1);
        let third = pages.alloc(0, Fill::Bits0).unwrap();
        assert!(pages.alloc(0, Fill::Bits0).is_none());
        pages.unlimited();
        unsafe {
            pages.free(zeroed, 0);
            pages.free(ones, 0);
            pages.free(third, 0);
        }
        assert_eq!(pages.live_blocks(), 0);
        assert_eq!(pages.total_allocs(), 3);
    }

    #[test]
    fn counting_cache_coverage() {
        let cache = CountingCache::default();
        cache.clean(PhysAddr::new(0x1000), 32);
        assert_eq!(cache.cleans(), 1);
        assert!(cache.covered(PhysAddr::new(0x1010), 16));
        assert!(!cache.covered(PhysAddr::new(0x1010), 32));
    }
}
