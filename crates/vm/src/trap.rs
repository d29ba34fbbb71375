//! Trap taxonomy and trap entry
//!
//! Exceptions and interrupts use the architectural cause encoding directly,
//! so `xcause`/`xtval` fall out of the variant. Entry logic (delegation,
//! status stacking, vector targeting) lives here and is shared by the
//! exception and interrupt paths.

use crate::csr::{self, CsrFile};
use serde::{Deserialize, Serialize};

/// Architectural privilege level of a hart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Privilege {
    User = 0,
    Supervisor = 1,
    Machine = 3,
}

impl Privilege {
    /// Decode a 2-bit xPP field. 2 is reserved and treated as Machine.
    pub fn from_bits(bits: u64) -> Self {
        match bits & 3 {
            0 => Privilege::User,
            1 => Privilege::Supervisor,
            _ => Privilege::Machine,
        }
    }
}

/// Synchronous exceptions, with the value destined for `xtval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    /// Jump/branch target with bit 0 set (2-byte alignment with C).
    InstrAddressMisaligned(u64),
    /// Bus rejected the fetch; payload is the physical address.
    InstrAccessFault(u64),
    /// Undecodable or privilege-violating instruction; payload is the
    /// faulting instruction bits.
    IllegalInstruction(u64),
    /// `ebreak`; payload is the PC.
    Breakpoint(u64),
    LoadAddressMisaligned(u64),
    LoadAccessFault(u64),
    StoreAddressMisaligned(u64),
    StoreAccessFault(u64),
    EcallFromU,
    EcallFromS,
    EcallFromM,
    /// Sv39 walk failures; payload is the faulting virtual address.
    InstrPageFault(u64),
    LoadPageFault(u64),
    StorePageFault(u64),
}

impl Exception {
    /// Architectural cause code (`xcause` with the interrupt bit clear).
    pub fn cause(&self) -> u64 {
        match self {
            Exception::InstrAddressMisaligned(_) => 0,
            Exception::InstrAccessFault(_) => 1,
            Exception::IllegalInstruction(_) => 2,
            Exception::Breakpoint(_) => 3,
            Exception::LoadAddressMisaligned(_) => 4,
            Exception::LoadAccessFault(_) => 5,
            Exception::StoreAddressMisaligned(_) => 6,
            Exception::StoreAccessFault(_) => 7,
            Exception::EcallFromU => 8,
            Exception::EcallFromS => 9,
            Exception::EcallFromM => 11,
            Exception::InstrPageFault(_) => 12,
            Exception::LoadPageFault(_) => 13,
            Exception::StorePageFault(_) => 15,
        }
    }

    /// Value written to `xtval` on entry.
    pub fn tval(&self) -> u64 {
        match *self {
            Exception::InstrAddressMisaligned(v)
            | Exception::InstrAccessFault(v)
            | Exception::IllegalInstruction(v)
            | Exception::Breakpoint(v)
            | Exception::LoadAddressMisaligned(v)
            | Exception::LoadAccessFault(v)
            | Exception::StoreAddressMisaligned(v)
            | Exception::StoreAccessFault(v)
            | Exception::InstrPageFault(v)
            | Exception::LoadPageFault(v)
            | Exception::StorePageFault(v) => v,
            Exception::EcallFromU | Exception::EcallFromS | Exception::EcallFromM => 0,
        }
    }
}

/// Interrupt causes, numbered as in `mip`/`mie`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Interrupt {
    SupervisorSoft = 1,
    MachineSoft = 3,
    SupervisorTimer = 5,
    MachineTimer = 7,
    SupervisorExternal = 9,
    MachineExternal = 11,
}

impl Interrupt {
    pub fn cause(&self) -> u64 {
        *self as u64
    }

    pub fn bit(&self) -> u64 {
        1 << (*self as u64)
    }
}

/// Privilege a trap is routed to, per `medeleg`/`mideleg`.
///
/// Traps taken in M-mode never delegate downward.
pub fn route(csrs: &CsrFile, prv: Privilege, cause: u64, is_interrupt: bool) -> Privilege {
    if prv == Privilege::Machine {
        return Privilege::Machine;
    }
    let deleg = if is_interrupt {
        csrs.mideleg
    } else {
        csrs.medeleg
    };
    if cause < 64 && deleg & (1 << cause) != 0 {
        Privilege::Supervisor
    } else {
        Privilege::Machine
    }
}

/// Outcome of [`enter`]: the privilege the hart now runs at and the PC of
/// the trap vector.
pub struct TrapEntry {
    pub privilege: Privilege,
    pub pc: u64,
}

/// Perform trap entry: route, write `xepc`/`xcause`/`xtval`, stack
/// `xstatus` (xPIE<-xIE, xIE<-0, xPP<-previous privilege), and compute the
/// vector target. GPRs are never touched; the guest trampoline saves them.
pub fn enter(
    csrs: &mut CsrFile,
    prv: Privilege,
    epc: u64,
    cause: u64,
    tval: u64,
    is_interrupt: bool,
) -> TrapEntry {
    let target = route(csrs, prv, cause, is_interrupt);
    let cause_word = if is_interrupt {
        cause | 1 << 63
    } else {
        cause
    };

    let (tvec, privilege) = match target {
        Privilege::Supervisor => {
            csrs.sepc = epc;
            csrs.scause = cause_word;
            csrs.stval = tval;
            let sie = csrs.mstatus >> csr::MSTATUS_SIE_SHIFT & 1;
            csrs.mstatus &= !(csr::MSTATUS_SPIE | csr::MSTATUS_SIE | csr::MSTATUS_SPP);
            csrs.mstatus |= sie << csr::MSTATUS_SPIE_SHIFT;
            csrs.mstatus |= (prv as u64 & 1) << csr::MSTATUS_SPP_SHIFT;
            (csrs.stvec, Privilege::Supervisor)
        }
        _ => {
            csrs.mepc = epc;
            csrs.mcause = cause_word;
            csrs.mtval = tval;
            let mie = csrs.mstatus >> csr::MSTATUS_MIE_SHIFT & 1;
            csrs.mstatus &= !(csr::MSTATUS_MPIE | csr::MSTATUS_MIE | csr::MSTATUS_MPP);
            csrs.mstatus |= mie << csr::MSTATUS_MPIE_SHIFT;
            csrs.mstatus |= (prv as u64) << csr::MSTATUS_MPP_SHIFT;
            (csrs.mtvec, Privilege::Machine)
        }
    };

    // Vectored mode only redirects interrupts; exceptions always use base.
    let base = tvec & !3;
    let pc = if tvec & 3 == 1 && is_interrupt {
        base + 4 * cause
    } else {
        base
    };

    TrapEntry { privilege, pc }
}
