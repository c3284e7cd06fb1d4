// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use static_assertions::const_assert_eq;

use crate::attr::{Cacheability, PageAttrs, Permissions, Shareability};
use crate::page_table::PageTableFormat;

/// The x86 extended page table format with a 4kB granule and a 48-bit input address. The DMA
/// remapping hardware walks the same layout as its second-level tables.
pub enum Ept {}

const ATTR_R: u64 = 1 << 0;
const ATTR_W: u64 = 1 << 1;
const ATTR_XS: u64 = 1 << 2;
const MEMTYPE_SHIFT: u64 = 3;
const MEMTYPE_MASK: u64 = 0x7 << MEMTYPE_SHIFT;
const ATTR_S: u64 = 1 << 7;
const ATTR_A: u64 = 1 << 8;
const ATTR_XU: u64 = 1 << 10;
// Software bit: mapping owned by the hypervisor.
const ATTR_K: u64 = 1 << 52;

const ACCESS_MASK: u64 = ATTR_R | ATTR_W | ATTR_XS | ATTR_XU;
// Output address bits 47:12.
const ADDR_MASK: u64 = ((1 << 48) - 1) & !((1 << 12) - 1);

const MEMTYPE_UC: u64 = 0;
const MEMTYPE_WC: u64 = 1;
const MEMTYPE_WT: u64 = 4;
const MEMTYPE_WB: u64 = 6;

const_assert_eq!(8 << 9, hyp_pages::PAGE_SIZE);

impl Ept {
    fn memtype(ca: Cacheability) -> u64 {
        match ca {
            Cacheability::MemWb => MEMTYPE_WB,
            Cacheability::MemWt => MEMTYPE_WT,
            Cacheability::MemNc => MEMTYPE_WC,
            _ => MEMTYPE_UC,
        }
    }

    fn decode_ca(raw: u64) -> Cacheability {
        match (raw & MEMTYPE_MASK) >> MEMTYPE_SHIFT {
            MEMTYPE_WB => Cacheability::MemWb,
            MEMTYPE_WT => Cacheability::MemWt,
            MEMTYPE_WC => Cacheability::MemNc,
            _ => Cacheability::DevNgnrne,
        }
    }
}

impl PageTableFormat for Ept {
    const LEVELS: usize = 4;
    const BITS_PER_LEVEL: u32 = 9;
    const MAX_LEAF_LEVEL: usize = 2;
    const ADDR_MASK: u64 = ADDR_MASK;

    fn table_attr() -> u64 {
        ACCESS_MASK
    }

    fn page_attr(level: usize, attrs: PageAttrs) -> u64 {
        let perms = attrs.perms;
        if !perms.grants_access() {
            return 0;
        }
        let mut val = ATTR_A | Self::memtype(attrs.ca) << MEMTYPE_SHIFT;
        if level > 0 {
            val |= ATTR_S;
        }
        for (perm, bit) in [
            (Permissions::R, ATTR_R),
            (Permissions::W, ATTR_W),
            (Permissions::XS, ATTR_XS),
            (Permissions::XU, ATTR_XU),
            (Permissions::K, ATTR_K),
        ] {
            if perms.contains(perm) {
                val |= bit;
            }
        }
        val
    }

    fn page_attrs(raw: u64) -> PageAttrs {
        let mut perms = Permissions::NONE;
        if raw & ACCESS_MASK != 0 {
            for (perm, bit) in [
                (Permissions::R, ATTR_R),
                (Permissions::W, ATTR_W),
                (Permissions::XS, ATTR_XS),
                (Permissions::XU, ATTR_XU),
                (Permissions::K, ATTR_K),
            ] {
                if raw & bit != 0 {
                    perms |= perm;
                }
            }
        }
        PageAttrs {
            perms,
            ca: Self::decode_ca(raw),
            sh: Shareability::Inner,
        }
    }

    fn is_present(raw: u64) -> bool {
        raw & ACCESS_MASK != 0
    }

    fn is_table(raw: u64, level: usize) -> bool {
        level > 0 && Self::is_present(raw) && raw & ATTR_S == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_table::PageTable;
    use hyp_pages::test_stubs::HeapPages;
    use hyp_pages::{GuestPhysAddr, PhysAddr};

    #[test]
    fn leaf_layout() {
        let attrs = PageAttrs::memory(Permissions::RW | Permissions::XS);
        assert_eq!(Ept::page_attr(0, attrs), ATTR_A | 6 << 3 | ATTR_XS | ATTR_W | ATTR_R);
        assert_eq!(Ept::page_attr(2, attrs) & ATTR_S, ATTR_S);
        assert!(!Ept::is_table(Ept::page_attr(1, attrs), 1));
        assert!(Ept::is_table(Ept::table_attr() | 0x5000, 3));
        assert_eq!(Ept::page_attr(0, PageAttrs::unmapped()), 0);
    }

    #[test]
    fn attributes_round_trip() {
        for ca in [Cacheability::MemWb, Cacheability::MemWt, Cacheability::MemNc, Cacheability::DevNgnrne] {
            for perms in [
                Permissions::R,
                Permissions::RW,
                Permissions::RWX | Permissions::K,
                Permissions::XU,
            ] {
                let attrs = PageAttrs::new(perms, ca, Shareability::Inner);
                assert_eq!(Ept::page_attrs(Ept::page_attr(1, attrs)), attrs);
            }
        }
        // Other device types collapse to uncacheable.
        let gre = PageAttrs::new(Permissions::RW, Cacheability::DevGre, Shareability::Inner);
        assert_eq!(Ept::page_attrs(Ept::page_attr(0, gre)).ca, Cacheability::DevNgnrne);
    }

    #[test]
    fn gigabyte_leaf() {
        let pages = HeapPages::leaked();
        let tree = PageTable::<Ept>::new(pages).unwrap();
        let attrs = PageAttrs::memory(Permissions::RW);
        assert_eq!(
            tree.update(GuestPhysAddr::new(1 << 30), PhysAddr::new(2 << 30), 18, attrs),
            Ok(18)
        );
        let t = tree.lookup(GuestPhysAddr::new((1 << 30) + 0x1234_5000)).unwrap();
        assert_eq!(t.order, 18);
        assert_eq!(t.base, PhysAddr::new(2 << 30));
        // Root and level 3 tables only.
        assert_eq!(pages.live_blocks(), 2);
    }
}
