// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

/// Number of address bits covered by a base page.
pub const PAGE_SHIFT: u32 = 12;
/// Size of a base page in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Returns the number of base pages in a block of the given order.
pub const fn order_pages(order: u32) -> u64 {
    1 << order
}

/// Returns the number of bytes in a block of the given order.
pub const fn order_bytes(order: u32) -> u64 {
    PAGE_SIZE << order
}

/// The granules a 4kB-granule translation tree with 9 bits per level can map.
#[repr(u64)]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum PageSize {
    Size4k = 4 * 1024,
    Size2M = 2 * 1024 * 1024,
    Size1G = 1024 * 1024 * 1024,
    Size512G = 512 * 1024 * 1024 * 1024,
}

impl PageSize {
    /// Returns the page size for a block of `order` base pages, if that is a mappable granule.
    pub fn from_order(order: u32) -> Option<Self> {
        match order {
            0 => Some(PageSize::Size4k),
            9 => Some(PageSize::Size2M),
            18 => Some(PageSize::Size1G),
            27 => Some(PageSize::Size512G),
            _ => None,
        }
    }

    /// Returns the order of this page size.
    pub fn order(&self) -> u32 {
        (*self as u64).trailing_zeros() - PAGE_SHIFT
    }

    /// Checks if the given quantity is aligned to this page size.
    pub fn is_aligned(&self, val: u64) -> bool {
        (val & (*self as u64 - 1)) == 0
    }

    /// Rounds up the quantity to the nearest multiple of this page size.
    pub fn round_up(&self, val: u64) -> u64 {
        (val + *self as u64 - 1) & !(*self as u64 - 1)
    }

    /// Rounds down the quantity to the nearest multiple of this page size.
    pub fn round_down(&self, val: u64) -> u64 {
        val & !(*self as u64 - 1)
    }

    /// Returns if the size is a huge page (> 4kB) size.
    pub fn is_huge(&self) -> bool {
        !matches!(*self, PageSize::Size4k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders() {
        assert_eq!(PageSize::Size4k.order(), 0);
        assert_eq!(PageSize::Size2M.order(), 9);
        assert_eq!(PageSize::Size1G.order(), 18);
        assert_eq!(PageSize::from_order(18), Some(PageSize::Size1G));
        assert_eq!(PageSize::from_order(3), None);
        assert_eq!(order_bytes(9), PageSize::Size2M as u64);
        assert_eq!(order_pages(9), 512);
    }

    #[test]
    fn rounding() {
        assert_eq!(PageSize::Size2M.round_up(0x20_0001), 0x40_0000);
        assert_eq!(PageSize::Size2M.round_down(0x3f_ffff), 0x20_0000);
        assert!(PageSize::Size4k.is_aligned(0x3000));
        assert!(!PageSize::Size4k.is_huge());
        assert!(PageSize::Size1G.is_huge());
    }
}
