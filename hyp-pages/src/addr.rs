// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use core::fmt;

use crate::page::PAGE_SIZE;

/// A host (supervisor) physical address.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Creates a physical address from its raw bits.
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Returns the raw bits of the address.
    pub const fn bits(&self) -> u64 {
        self.0
    }

    /// Returns if the address is a multiple of `align`, which must be a power of two.
    pub const fn is_aligned(&self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }

    /// Returns if the address is aligned to a 4kB page.
    pub const fn is_page_aligned(&self) -> bool {
        self.is_aligned(PAGE_SIZE)
    }

    /// Returns the address `bytes` past this one, or `None` on overflow.
    pub fn checked_add(&self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Returns the identity-mapped pointer for this address.
    pub fn as_ptr<T>(&self) -> *const T {
        self.0 as *const T
    }

    /// Returns the identity-mapped mutable pointer for this address.
    pub fn as_mut_ptr<T>(&self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns the physical address of an identity-mapped object.
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as u64)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

/// An address in the input space of a second-stage translation: a guest-physical address for a
/// VM, or an I/O virtual address for a device.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GuestPhysAddr(u64);

impl GuestPhysAddr {
    /// Creates a guest-physical address from its raw bits.
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Returns the raw bits of the address.
    pub const fn bits(&self) -> u64 {
        self.0
    }

    /// Returns if the address is a multiple of `align`, which must be a power of two.
    pub const fn is_aligned(&self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }

    /// Returns the address `bytes` past this one, or `None` on overflow.
    pub fn checked_add(&self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl fmt::Debug for GuestPhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GuestPhysAddr({:#x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment() {
        let addr = PhysAddr::new(0x20_1000);
        assert!(addr.is_page_aligned());
        assert!(!addr.is_aligned(0x20_0000));
        assert!(PhysAddr::new(0x40_0000).is_aligned(0x20_0000));
        assert!(!PhysAddr::new(0x1008).is_page_aligned());
        assert!(GuestPhysAddr::new(0x4000_0000).is_aligned(1 << 30));
    }

    #[test]
    fn checked_add_overflows() {
        assert_eq!(
            PhysAddr::new(0x1000).checked_add(0x1000),
            Some(PhysAddr::new(0x2000))
        );
        assert!(PhysAddr::new(u64::MAX).checked_add(1).is_none());
        assert!(GuestPhysAddr::new(u64::MAX - 1).checked_add(2).is_none());
    }
}
