//! Sv39 address translation
//!
//! Stateless three-level walk: there is no TLB, so `sfence.vma` has no
//! cached state to shoot down and every access sees the page tables the
//! guest last wrote. Superpage leaves are accepted at any level; a leaf
//! with a misaligned PPN faults.
//!
//! A/D policy: the walker never sets A or D. An access to a page with
//! A=0, or a store to a page with D=0, raises the matching page fault and
//! the guest is expected to fix the bits up, which is what xv6-style
//! kernels do.

use crate::bus::SystemBus;
use crate::csr::{self, CsrFile};
use crate::trap::{Exception, Privilege};
use bitflags::bitflags;

bitflags! {
    /// Sv39 page-table entry permission bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        const G = 1 << 5;
        const A = 1 << 6;
        const D = 1 << 7;
    }
}

pub const PAGE_SHIFT: u64 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
const LEVELS: u64 = 3;
const PTE_PPN_MASK: u64 = 0xFFF_FFFF_FFFF; // 44 bits

/// What an access is for; selects both the permission check and the fault
/// flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Fetch,
    Load,
    Store,
}

impl Access {
    fn page_fault(&self, va: u64) -> Exception {
        match self {
            Access::Fetch => Exception::InstrPageFault(va),
            Access::Load => Exception::LoadPageFault(va),
            Access::Store => Exception::StorePageFault(va),
        }
    }

    fn access_fault(&self, addr: u64) -> Exception {
        match self {
            Access::Fetch => Exception::InstrAccessFault(addr),
            Access::Load => Exception::LoadAccessFault(addr),
            Access::Store => Exception::StoreAccessFault(addr),
        }
    }
}

/// Translate a virtual address, or identity-map when translation is off.
///
/// M-mode runs untranslated except that loads and stores with
/// `mstatus.MPRV` set translate at the privilege in `mstatus.MPP`.
pub fn translate(
    bus: &SystemBus,
    csrs: &CsrFile,
    prv: Privilege,
    va: u64,
    access: Access,
) -> Result<u64, Exception> {
    let eff = effective_privilege(csrs, prv, access);
    if eff == Privilege::Machine || !csrs.satp_sv39() {
        return Ok(va);
    }

    // Bits 63:39 must replicate bit 38.
    let sext = (va as i64) << 25 >> 25;
    if sext as u64 != va {
        return Err(access.page_fault(va));
    }

    let mut table = csrs.satp_ppn() << PAGE_SHIFT;
    for level in (0..LEVELS).rev() {
        let vpn = va >> (PAGE_SHIFT + 9 * level) & 0x1FF;
        let pte_addr = table + vpn * 8;
        let pte = bus
            .read(pte_addr, 8)
            .map_err(|_| access.access_fault(pte_addr))?;
        let flags = PteFlags::from_bits_truncate(pte);
        let ppn = pte >> 10 & PTE_PPN_MASK;

        if !flags.contains(PteFlags::V)
            || (flags.contains(PteFlags::W) && !flags.contains(PteFlags::R))
        {
            return Err(access.page_fault(va));
        }

        if !flags.intersects(PteFlags::R | PteFlags::X) {
            // Pointer to the next level.
            table = ppn << PAGE_SHIFT;
            continue;
        }

        check_permissions(csrs, eff, access, flags).map_err(|_| access.page_fault(va))?;

        // Superpage PPN low bits must be zero.
        let align_mask = (1 << (9 * level)) - 1;
        if ppn & align_mask != 0 {
            return Err(access.page_fault(va));
        }

        let offset_mask = (PAGE_SIZE << (9 * level)) - 1;
        return Ok((ppn << PAGE_SHIFT & !offset_mask) | (va & offset_mask));
    }

    // Level 0 entry was itself a pointer.
    Err(access.page_fault(va))
}

fn effective_privilege(csrs: &CsrFile, prv: Privilege, access: Access) -> Privilege {
    if access != Access::Fetch
        && prv == Privilege::Machine
        && csrs.mstatus & csr::MSTATUS_MPRV != 0
    {
        Privilege::from_bits(csrs.mstatus >> csr::MSTATUS_MPP_SHIFT)
    } else {
        prv
    }
}

fn check_permissions(
    csrs: &CsrFile,
    eff: Privilege,
    access: Access,
    flags: PteFlags,
) -> Result<(), ()> {
    match eff {
        Privilege::User => {
            if !flags.contains(PteFlags::U) {
                return Err(());
            }
        }
        Privilege::Supervisor => {
            if flags.contains(PteFlags::U) {
                // S-mode never executes U pages; data access needs SUM.
                if access == Access::Fetch || csrs.mstatus & csr::MSTATUS_SUM == 0 {
                    return Err(());
                }
            }
        }
        Privilege::Machine => {}
    }

    let ok = match access {
        Access::Fetch => flags.contains(PteFlags::X),
        Access::Load => {
            flags.contains(PteFlags::R)
                || (flags.contains(PteFlags::X) && csrs.mstatus & csr::MSTATUS_MXR != 0)
        }
        Access::Store => flags.contains(PteFlags::W),
    };
    if !ok {
        return Err(());
    }

    // Software-managed A/D: fault so the guest can fix up.
    if !flags.contains(PteFlags::A) {
        return Err(());
    }
    if access == Access::Store && !flags.contains(PteFlags::D) {
        return Err(());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::DRAM_BASE;
    use crate::csr::{CSR_SATP, SATP_MODE_SV39};

    const ROOT: u64 = DRAM_BASE + 0x10000;
    const L1: u64 = DRAM_BASE + 0x11000;
    const L0: u64 = DRAM_BASE + 0x12000;

    fn pte(pa: u64, flags: PteFlags) -> u64 {
        (pa >> PAGE_SHIFT) << 10 | flags.bits()
    }

    fn setup() -> (SystemBus, CsrFile) {
        let bus = SystemBus::new(1 << 22, 1, None, None, None);
        let mut csrs = CsrFile::new(0);
        csrs.write(CSR_SATP, SATP_MODE_SV39 << 60 | ROOT >> PAGE_SHIFT)
            .unwrap();
        (bus, csrs)
    }

    /// Map VA 0x8000_0000 -> PA 0x8020_0000 with the given leaf flags.
    fn map_page(bus: &SystemBus, leaf_flags: PteFlags) -> (u64, u64) {
        let va = 0x8000_0000u64;
        let pa = DRAM_BASE + 0x20_0000;
        // VPN[2]=2, VPN[1]=0, VPN[0]=0 for this VA.
        bus.write(ROOT + 2 * 8, 8, pte(L1, PteFlags::V)).unwrap();
        bus.write(L1, 8, pte(L0, PteFlags::V)).unwrap();
        bus.write(L0, 8, pte(pa, leaf_flags)).unwrap();
        (va, pa)
    }

    fn rwx() -> PteFlags {
        PteFlags::V | PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::A | PteFlags::D
    }

    #[test]
    fn test_bare_mode_identity() {
        let bus = SystemBus::new(1 << 20, 1, None, None, None);
        let csrs = CsrFile::new(0);
        let pa = translate(&bus, &csrs, Privilege::Supervisor, 0x1234, Access::Load).unwrap();
        assert_eq!(pa, 0x1234);
    }

    #[test]
    fn test_machine_mode_ignores_satp() {
        let (bus, csrs) = setup();
        let pa = translate(&bus, &csrs, Privilege::Machine, 0xDEAD_B000, Access::Store).unwrap();
        assert_eq!(pa, 0xDEAD_B000);
    }

    #[test]
    fn test_three_level_walk() {
        let (bus, csrs) = setup();
        let (va, pa) = map_page(&bus, rwx());
        let got = translate(&bus, &csrs, Privilege::Supervisor, va + 0x123, Access::Load).unwrap();
        assert_eq!(got, pa + 0x123);
    }

    #[test]
    fn test_unmapped_va_faults() {
        let (bus, csrs) = setup();
        map_page(&bus, rwx());
        let err = translate(&bus, &csrs, Privilege::Supervisor, 0x4000_0000, Access::Load);
        assert_eq!(err, Err(Exception::LoadPageFault(0x4000_0000)));
    }

    #[test]
    fn test_w_without_r_is_reserved() {
        let (bus, csrs) = setup();
        let (va, _) = map_page(&bus, PteFlags::V | PteFlags::W | PteFlags::A | PteFlags::D);
        let err = translate(&bus, &csrs, Privilege::Supervisor, va, Access::Load);
        assert_eq!(err, Err(Exception::LoadPageFault(va)));
    }

    #[test]
    fn test_store_needs_w_and_d() {
        let (bus, csrs) = setup();
        let (va, _) = map_page(&bus, PteFlags::V | PteFlags::R | PteFlags::W | PteFlags::A);
        assert!(translate(&bus, &csrs, Privilege::Supervisor, va, Access::Load).is_ok());
        let err = translate(&bus, &csrs, Privilege::Supervisor, va, Access::Store);
        assert_eq!(err, Err(Exception::StorePageFault(va)), "D=0 store faults");
    }

    #[test]
    fn test_accessed_bit_required() {
        let (bus, csrs) = setup();
        let (va, _) = map_page(&bus, PteFlags::V | PteFlags::R | PteFlags::X);
        assert_eq!(
            translate(&bus, &csrs, Privilege::Supervisor, va, Access::Fetch),
            Err(Exception::InstrPageFault(va))
        );
    }

    #[test]
    fn test_user_bit_enforced() {
        let (bus, mut csrs) = setup();
        let (va, _) = map_page(&bus, rwx());
        // U-mode on a kernel page.
        assert_eq!(
            translate(&bus, &csrs, Privilege::User, va, Access::Load),
            Err(Exception::LoadPageFault(va))
        );
        // S-mode on a user page without SUM.
        map_page(&bus, rwx() | PteFlags::U);
        assert_eq!(
            translate(&bus, &csrs, Privilege::Supervisor, va, Access::Load),
            Err(Exception::LoadPageFault(va))
        );
        csrs.mstatus |= csr::MSTATUS_SUM;
        assert!(translate(&bus, &csrs, Privilege::Supervisor, va, Access::Load).is_ok());
        // Fetch from a U page in S-mode faults even with SUM.
        assert_eq!(
            translate(&bus, &csrs, Privilege::Supervisor, va, Access::Fetch),
            Err(Exception::InstrPageFault(va))
        );
    }

    #[test]
    fn test_mxr_allows_load_from_execute_only() {
        let (bus, mut csrs) = setup();
        let (va, _) = map_page(&bus, PteFlags::V | PteFlags::X | PteFlags::A);
        assert!(translate(&bus, &csrs, Privilege::Supervisor, va, Access::Load).is_err());
        csrs.mstatus |= csr::MSTATUS_MXR;
        assert!(translate(&bus, &csrs, Privilege::Supervisor, va, Access::Load).is_ok());
    }

    #[test]
    fn test_gigapage_translation() {
        let (bus, csrs) = setup();
        // Leaf directly at level 2: 1 GiB superpage mapping VA 2G -> PA 2G.
        bus.write(ROOT + 2 * 8, 8, pte(DRAM_BASE, rwx())).unwrap();
        let va = 0x8000_0000u64 + 0x123_4567;
        let pa = translate(&bus, &csrs, Privilege::Supervisor, va, Access::Load).unwrap();
        assert_eq!(pa, DRAM_BASE + 0x123_4567);
    }

    #[test]
    fn test_misaligned_superpage_faults() {
        let (bus, csrs) = setup();
        // Level-2 leaf whose PPN has nonzero low bits.
        bus.write(ROOT + 2 * 8, 8, pte(DRAM_BASE + PAGE_SIZE, rwx()))
            .unwrap();
        let va = 0x8000_0000u64;
        assert_eq!(
            translate(&bus, &csrs, Privilege::Supervisor, va, Access::Fetch),
            Err(Exception::InstrPageFault(va))
        );
    }

    #[test]
    fn test_non_canonical_va_faults() {
        let (bus, csrs) = setup();
        map_page(&bus, rwx());
        assert_eq!(
            translate(&bus, &csrs, Privilege::Supervisor, 1 << 45, Access::Load),
            Err(Exception::LoadPageFault(1 << 45))
        );
    }

    #[test]
    fn test_mprv_translates_machine_data() {
        let (bus, mut csrs) = setup();
        let (va, pa) = map_page(&bus, rwx());
        csrs.mstatus |= csr::MSTATUS_MPRV | 1 << csr::MSTATUS_MPP_SHIFT; // MPP=S
        let got = translate(&bus, &csrs, Privilege::Machine, va, Access::Load).unwrap();
        assert_eq!(got, pa);
        // Fetch stays untranslated.
        let got = translate(&bus, &csrs, Privilege::Machine, va, Access::Fetch).unwrap();
        assert_eq!(got, va);
    }
}
