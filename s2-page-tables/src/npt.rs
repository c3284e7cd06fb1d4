// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use core::sync::atomic::{AtomicBool, Ordering};
use static_assertions::const_assert_eq;

use crate::attr::{Cacheability, PageAttrs, Permissions, Shareability};
use crate::page_table::PageTableFormat;

/// The aarch64 stage-2 translation table format with a 4kB granule and a 39-bit input address
/// (three levels, starting at level 1 in the architecture's numbering).
pub enum Npt {}

const ATTR_P: u64 = 1 << 0;
// Marks a table at levels above 0 and a page at level 0.
const ATTR_NL: u64 = 1 << 1;
const MEMATTR_SHIFT: u64 = 2;
const ATTR_R: u64 = 1 << 6;
const ATTR_W: u64 = 1 << 7;
const SH_SHIFT: u64 = 8;
const ATTR_A: u64 = 1 << 10;
const ATTR_NX0: u64 = 1 << 53;
const ATTR_NX1: u64 = 1 << 54;
// Software bit: mapping owned by the hypervisor.
const ATTR_K: u64 = 1 << 55;

// Output address bits 47:12.
const ADDR_MASK: u64 = ((1 << 48) - 1) & !((1 << 12) - 1);

const_assert_eq!(8 << 9, hyp_pages::PAGE_SIZE);

// Whether the processor separates privileged and unprivileged execute-never (FEAT_XNX).
static XNX: AtomicBool = AtomicBool::new(true);

impl Npt {
    /// Sets whether entries carry distinct supervisor and user execute permissions. Must be set
    /// before any entry is written.
    pub fn set_xnx(enabled: bool) {
        XNX.store(enabled, Ordering::Relaxed);
    }

    /// Returns whether distinct execute permissions are encoded.
    pub fn xnx() -> bool {
        XNX.load(Ordering::Relaxed)
    }

    /// Encodes the execute permissions of `perms` as the two execute-never bits.
    ///
    /// Without XNX only the upper bit exists and execution is denied only when both modes lose
    /// it.
    pub fn execute_never(perms: Permissions, xnx: bool) -> u64 {
        let nxs = !perms.contains(Permissions::XS);
        let nxu = !perms.contains(Permissions::XU);
        let mut bits = 0;
        if (nxs && nxu) || (xnx && nxu) {
            bits |= ATTR_NX1;
        }
        if xnx && nxs != nxu {
            bits |= ATTR_NX0;
        }
        bits
    }

    /// Encodes a leaf at `level` for `attrs` with execute permissions encoded per `xnx`.
    pub fn encode(level: usize, attrs: PageAttrs, xnx: bool) -> u64 {
        let perms = attrs.perms;
        if !perms.grants_access() {
            return 0;
        }
        let mut val = ATTR_A
            | ATTR_P
            | (Self::mem_attr(attrs.ca) << MEMATTR_SHIFT)
            | ((attrs.sh as u64) << SH_SHIFT)
            | Self::execute_never(perms, xnx);
        if level == 0 {
            val |= ATTR_NL;
        }
        if perms.contains(Permissions::R) {
            val |= ATTR_R;
        }
        if perms.contains(Permissions::W) {
            val |= ATTR_W;
        }
        if perms.contains(Permissions::K) {
            val |= ATTR_K;
        }
        val
    }

    /// Decodes the permissions of the leaf `raw`.
    pub fn decode_perms(raw: u64) -> Permissions {
        if raw & ATTR_P == 0 {
            return Permissions::NONE;
        }
        let nx1 = raw & ATTR_NX1 != 0;
        let nx0 = raw & ATTR_NX0 != 0;
        let mut perms = Permissions::NONE;
        if raw & ATTR_R != 0 {
            perms |= Permissions::R;
        }
        if raw & ATTR_W != 0 {
            perms |= Permissions::W;
        }
        if nx1 == nx0 {
            perms |= Permissions::XS;
        }
        if !nx1 {
            perms |= Permissions::XU;
        }
        if raw & ATTR_K != 0 {
            perms |= Permissions::K;
        }
        perms
    }

    /// Decodes the memory type of the leaf `raw`.
    pub fn decode_ca(raw: u64) -> Cacheability {
        let mem_attr = (raw >> MEMATTR_SHIFT) & 0xf;
        let bits = if mem_attr >> 2 != 0 {
            mem_attr & 0x3
        } else {
            Cacheability::DevNgnrne as u64 + (mem_attr & 0x3)
        };
        Cacheability::from_bits(bits as u8).unwrap_or(Cacheability::DevNgnrne)
    }

    // Device types use MemAttr 0b00xx; normal types set the same policy for inner and outer.
    fn mem_attr(ca: Cacheability) -> u64 {
        if ca.is_device() {
            ca as u64 - Cacheability::DevNgnrne as u64
        } else {
            (ca as u64) << 2 | ca as u64
        }
    }
}

impl PageTableFormat for Npt {
    const LEVELS: usize = 3;
    const BITS_PER_LEVEL: u32 = 9;
    const MAX_LEAF_LEVEL: usize = 1;
    const ADDR_MASK: u64 = ADDR_MASK;

    fn table_attr() -> u64 {
        ATTR_NL | ATTR_P
    }

    fn page_attr(level: usize, attrs: PageAttrs) -> u64 {
        Self::encode(level, attrs, Self::xnx())
    }

    fn page_attrs(raw: u64) -> PageAttrs {
        PageAttrs {
            perms: Self::decode_perms(raw),
            ca: Self::decode_ca(raw),
            sh: Shareability::from_bits(((raw >> SH_SHIFT) & 0x3) as u8),
        }
    }

    fn is_present(raw: u64) -> bool {
        raw & ATTR_P != 0
    }

    fn is_table(raw: u64, level: usize) -> bool {
        level > 0 && raw & (ATTR_NL | ATTR_P) == ATTR_NL | ATTR_P
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const X_COMBOS: [Permissions; 4] = [
        Permissions::NONE,
        Permissions::XS,
        Permissions::XU,
        Permissions::from_bits_truncate(0b1100),
    ];

    #[test]
    fn execute_never_with_xnx() {
        let xs_xu = Permissions::XS | Permissions::XU;
        assert_eq!(Npt::execute_never(xs_xu, true), 0);
        assert_eq!(Npt::execute_never(Permissions::XS, true), ATTR_NX1 | ATTR_NX0);
        assert_eq!(Npt::execute_never(Permissions::XU, true), ATTR_NX0);
        assert_eq!(Npt::execute_never(Permissions::NONE, true), ATTR_NX1);
    }

    #[test]
    fn execute_never_without_xnx() {
        assert_eq!(Npt::execute_never(Permissions::XS | Permissions::XU, false), 0);
        assert_eq!(Npt::execute_never(Permissions::XS, false), 0);
        assert_eq!(Npt::execute_never(Permissions::XU, false), 0);
        assert_eq!(Npt::execute_never(Permissions::NONE, false), ATTR_NX1);
    }

    #[test]
    fn attributes_round_trip_with_xnx() {
        for level in 0..=Npt::MAX_LEAF_LEVEL {
            for x in X_COMBOS {
                for ca in Cacheability::ALL {
                    for sh in Shareability::ALL {
                        let attrs = PageAttrs::new(Permissions::R | x, ca, sh);
                        let raw = Npt::encode(level, attrs, true);
                        assert_eq!(Npt::page_attrs(raw), attrs, "{level} {attrs:?}");
                    }
                }
            }
        }
    }

    #[test]
    fn symmetric_execute_round_trips_without_xnx() {
        for perms in [Permissions::RW, Permissions::RWX, Permissions::R | Permissions::K] {
            let attrs = PageAttrs::memory(perms);
            assert_eq!(Npt::page_attrs(Npt::encode(0, attrs, false)), attrs);
        }
    }

    #[test]
    fn no_access_encodes_absent() {
        let attrs = PageAttrs::memory(Permissions::K);
        assert_eq!(Npt::encode(0, attrs, true), 0);
        assert!(!Npt::is_present(0));
        assert_eq!(Npt::decode_perms(0), Permissions::NONE);
    }

    #[test]
    fn leaf_layout() {
        let attrs = PageAttrs::new(Permissions::RW, Cacheability::MemWb, Shareability::Inner);
        let page = Npt::encode(0, attrs, true);
        assert_eq!(page & 0x7ff, ATTR_A | 0b11 << 8 | ATTR_W | ATTR_R | 0xf << 2 | ATTR_NL | ATTR_P);
        assert_eq!(page & (ATTR_NX1 | ATTR_NX0), ATTR_NX1);
        let block = Npt::encode(1, attrs, true);
        assert_eq!(block & (ATTR_NL | ATTR_P), ATTR_P);
        assert!(!Npt::is_table(block, 1));
        // Level 0 pages carry the same bit as tables but are never tables.
        assert!(!Npt::is_table(page, 0));
        assert!(Npt::is_table(Npt::table_attr() | 0x1000, 1));
    }

    #[test]
    fn device_memory_attribute() {
        let attrs = PageAttrs::new(Permissions::RW, Cacheability::DevNgre, Shareability::NonShareable);
        let raw = Npt::encode(1, attrs, true);
        assert_eq!((raw >> MEMATTR_SHIFT) & 0xf, 0b0010);
        assert_eq!(Npt::decode_ca(raw), Cacheability::DevNgre);
    }
}
