// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use core::fmt;
use core::ops::{BitAnd, BitOr, BitOrAssign};

/// Access permissions of a leaf mapping.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Permissions(u8);

impl Permissions {
    /// No access. Updating with these permissions removes the mapping.
    pub const NONE: Self = Self(0);
    /// Readable.
    pub const R: Self = Self(1 << 0);
    /// Writable.
    pub const W: Self = Self(1 << 1);
    /// Executable by guest user mode.
    pub const XU: Self = Self(1 << 2);
    /// Executable by guest supervisor mode.
    pub const XS: Self = Self(1 << 3);
    /// Mapping owned by the hypervisor rather than the guest.
    pub const K: Self = Self(1 << 4);

    /// Read and write.
    pub const RW: Self = Self(Self::R.0 | Self::W.0);
    /// Full access, executable from both guest modes.
    pub const RWX: Self = Self(Self::R.0 | Self::W.0 | Self::XU.0 | Self::XS.0);

    const ACCESS: u8 = Self::RWX.0;
    const ALL: u8 = Self::ACCESS | Self::K.0;

    /// Returns the raw permission bits.
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Creates permissions from raw bits, discarding unknown ones.
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & Self::ALL)
    }

    /// Returns true if every permission in `other` is also in `self`.
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if any of R, W, XU or XS is granted. Mappings without any of them are absent.
    pub const fn grants_access(&self) -> bool {
        self.0 & Self::ACCESS != 0
    }
}

impl BitOr for Permissions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Permissions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Permissions {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        const NAMES: [(Permissions, char); 5] = [
            (Permissions::R, 'R'),
            (Permissions::W, 'W'),
            (Permissions::XU, 'U'),
            (Permissions::XS, 'S'),
            (Permissions::K, 'K'),
        ];
        for (perm, name) in NAMES {
            let c = if self.contains(perm) { name } else { '-' };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

/// Memory type of a mapping. The discriminants are the stable abstract encoding.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cacheability {
    /// Normal memory, non-cacheable.
    MemNc = 1,
    /// Normal memory, write-through.
    MemWt = 2,
    /// Normal memory, write-back.
    MemWb = 3,
    /// Device, non-gathering, non-reordering, no early write acknowledgement.
    DevNgnrne = 4,
    /// Device, non-gathering, non-reordering, early write acknowledgement.
    DevNgnre = 5,
    /// Device, non-gathering, reordering, early write acknowledgement.
    DevNgre = 6,
    /// Device, gathering, reordering, early write acknowledgement.
    DevGre = 7,
}

impl Cacheability {
    /// Every memory type.
    pub const ALL: [Cacheability; 7] = [
        Cacheability::MemNc,
        Cacheability::MemWt,
        Cacheability::MemWb,
        Cacheability::DevNgnrne,
        Cacheability::DevNgnre,
        Cacheability::DevNgre,
        Cacheability::DevGre,
    ];

    /// Returns the memory type with the abstract encoding `bits`.
    pub fn from_bits(bits: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|ca| *ca as u8 == bits)
    }

    /// Returns true for the device memory types.
    pub fn is_device(&self) -> bool {
        *self as u8 >= Cacheability::DevNgnrne as u8
    }
}

/// Shareability domain of a mapping.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shareability {
    NonShareable = 0,
    Outer = 2,
    Inner = 3,
}

impl Shareability {
    /// Every shareability domain.
    pub const ALL: [Shareability; 3] = [
        Shareability::NonShareable,
        Shareability::Outer,
        Shareability::Inner,
    ];

    /// Returns the domain with encoding `bits`. The reserved encoding decodes as non-shareable.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            2 => Shareability::Outer,
            3 => Shareability::Inner,
            _ => Shareability::NonShareable,
        }
    }
}

/// The format-independent description of a leaf mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageAttrs {
    pub perms: Permissions,
    pub ca: Cacheability,
    pub sh: Shareability,
}

impl PageAttrs {
    pub const fn new(perms: Permissions, ca: Cacheability, sh: Shareability) -> Self {
        Self { perms, ca, sh }
    }

    /// Write-back, inner-shareable memory with `perms`.
    pub const fn memory(perms: Permissions) -> Self {
        Self::new(perms, Cacheability::MemWb, Shareability::Inner)
    }

    /// Attributes that remove a mapping.
    pub const fn unmapped() -> Self {
        Self::memory(Permissions::NONE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_sets() {
        let p = Permissions::R | Permissions::XS;
        assert!(p.contains(Permissions::R));
        assert!(!p.contains(Permissions::RW));
        assert!(p.grants_access());
        assert!(!Permissions::K.grants_access());
        assert!(!Permissions::NONE.grants_access());
        assert_eq!(Permissions::from_bits_truncate(0xff).bits(), 0x1f);
        assert_eq!(format!("{:?}", Permissions::RW | Permissions::K), "RW--K");
    }

    #[test]
    fn cacheability_encoding() {
        for ca in Cacheability::ALL {
            assert_eq!(Cacheability::from_bits(ca as u8), Some(ca));
        }
        assert_eq!(Cacheability::from_bits(0), None);
        assert!(Cacheability::DevGre.is_device());
        assert!(!Cacheability::MemWb.is_device());
    }

    #[test]
    fn shareability_encoding() {
        for sh in Shareability::ALL {
            assert_eq!(Shareability::from_bits(sh as u8), sh);
        }
        assert_eq!(Shareability::from_bits(1), Shareability::NonShareable);
    }
}
