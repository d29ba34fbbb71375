//! One architectural RV64 core
//!
//! A `Hart` holds GPRs, PC, privilege, the CSR file, and the WFI flag; it
//! borrows the bus for exactly one instruction at a time. `step` performs
//! one of: retire an instruction, take a pending interrupt, idle in WFI,
//! or report a guest-initiated halt. It is re-entrant across harts (no
//! shared state outside the bus) so the same code runs in the
//! deterministic round-robin mode and on dedicated host threads.

mod compressed;
mod exec;

use crate::bus::SystemBus;
use crate::csr::{self, CsrFile};
use crate::mmu::{self, Access};
use crate::trap::{self, Exception, Interrupt, Privilege};
use serde::{Deserialize, Serialize};

/// Outcome of a single [`Hart::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// One instruction retired.
    Retired,
    /// Hart is idle in WFI with nothing pending.
    Wfi,
    /// An exception or interrupt redirected control flow.
    TrapTaken,
    /// The guest wrote the shutdown MMIO word.
    Halted(u16),
}

pub struct Hart {
    pub id: usize,
    /// x0..x31; x0 reads zero via the accessor.
    pub regs: [u64; 32],
    pub pc: u64,
    pub privilege: Privilege,
    pub csrs: CsrFile,
    /// Set by the WFI instruction, cleared when an interrupt pends.
    pub wfi: bool,
}

/// Serializable architectural state (snapshots).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HartState {
    pub regs: [u64; 32],
    pub pc: u64,
    pub privilege: Privilege,
    pub csrs: CsrFile,
    pub wfi: bool,
}

impl Hart {
    pub fn new(id: usize, entry_pc: u64) -> Self {
        Self {
            id,
            regs: [0; 32],
            pc: entry_pc,
            privilege: Privilege::Machine,
            csrs: CsrFile::new(id as u64),
            wfi: false,
        }
    }

    #[inline(always)]
    pub fn x(&self, r: u32) -> u64 {
        if r == 0 {
            0
        } else {
            self.regs[r as usize]
        }
    }

    #[inline(always)]
    pub fn set_x(&mut self, r: u32, v: u64) {
        if r != 0 {
            self.regs[r as usize] = v;
        }
    }

    /// Execute at most one instruction against the bus.
    ///
    /// Every call ticks the CLINT once, WFI and trap entry included, so
    /// guest time keeps moving while a hart idles waiting for the timer.
    pub fn step(&mut self, bus: &SystemBus) -> StepResult {
        bus.clint.tick(1);
        // Interrupts win over instruction issue; WFI wakes on any pending
        // enabled interrupt even when globally disabled.
        if self.wfi && self.raw_pending(bus) != 0 {
            self.wfi = false;
        }
        if let Some(irq) = self.pending_interrupt(bus) {
            self.take_interrupt(bus, irq);
            return StepResult::TrapTaken;
        }
        if self.wfi {
            return StepResult::Wfi;
        }

        match self.fetch_execute(bus) {
            Ok(()) => {
                self.csrs.mcycle = self.csrs.mcycle.wrapping_add(1);
                self.csrs.minstret = self.csrs.minstret.wrapping_add(1);
                if bus.finisher.halted() {
                    return StepResult::Halted(bus.finisher.halt_code());
                }
                StepResult::Retired
            }
            Err(e) => {
                self.take_exception(bus, e);
                StepResult::TrapTaken
            }
        }
    }

    fn fetch_execute(&mut self, bus: &SystemBus) -> Result<(), Exception> {
        let pc = self.pc;
        let (inst, len) = self.fetch(bus, pc)?;
        log::trace!(
            "hart{}: pc={:#x} inst={:#010x} prv={:?}",
            self.id,
            pc,
            inst,
            self.privilege
        );
        let next = exec::execute(self, bus, inst, pc, len)?;
        self.pc = next;
        Ok(())
    }

    /// Fetch one instruction, expanding compressed encodings. Returns the
    /// 32-bit instruction and its encoded length (2 or 4).
    fn fetch(&mut self, bus: &SystemBus, pc: u64) -> Result<(u32, u64), Exception> {
        if pc & 1 != 0 {
            return Err(Exception::InstrAddressMisaligned(pc));
        }
        let lo = self.fetch_half(bus, pc)?;
        if lo & 3 != 3 {
            let inst = compressed::decompress(lo)
                .map_err(|_| Exception::IllegalInstruction(lo as u64))?;
            return Ok((inst, 2));
        }
        // A 32-bit instruction may straddle a page boundary; the second
        // halfword translates on its own and faults with its own VA.
        let hi = self.fetch_half(bus, pc.wrapping_add(2))?;
        Ok(((hi as u32) << 16 | lo as u32, 4))
    }

    fn fetch_half(&mut self, bus: &SystemBus, va: u64) -> Result<u16, Exception> {
        let pa = mmu::translate(bus, &self.csrs, self.privilege, va, Access::Fetch)?;
        let v = bus
            .read(pa, 2)
            .map_err(|_| Exception::InstrAccessFault(pa))?;
        Ok(v as u16)
    }

    /// Translated data load. Misalignment faults before translation.
    pub(crate) fn load(&mut self, bus: &SystemBus, va: u64, size: u8) -> Result<u64, Exception> {
        if va % size as u64 != 0 {
            return Err(Exception::LoadAddressMisaligned(va));
        }
        let pa = mmu::translate(bus, &self.csrs, self.privilege, va, Access::Load)?;
        bus.read(pa, size)
    }

    /// Translated data store.
    pub(crate) fn store(
        &mut self,
        bus: &SystemBus,
        va: u64,
        size: u8,
        val: u64,
    ) -> Result<(), Exception> {
        if va % size as u64 != 0 {
            return Err(Exception::StoreAddressMisaligned(va));
        }
        let pa = mmu::translate(bus, &self.csrs, self.privilege, va, Access::Store)?;
        bus.write(pa, size, val)
    }

    /// Translate for an atomic; `store` selects the permission check and
    /// the misalignment flavor.
    pub(crate) fn translate_amo(
        &mut self,
        bus: &SystemBus,
        va: u64,
        size: u8,
        store: bool,
    ) -> Result<u64, Exception> {
        if va % size as u64 != 0 {
            return Err(if store {
                Exception::StoreAddressMisaligned(va)
            } else {
                Exception::LoadAddressMisaligned(va)
            });
        }
        let access = if store { Access::Store } else { Access::Load };
        mmu::translate(bus, &self.csrs, self.privilege, va, access)
    }

    /// mip with the device-driven lines OR-ed in.
    pub(crate) fn effective_mip(&self, bus: &SystemBus) -> u64 {
        let mut mip = self.csrs.mip;
        if bus.clint.msip(self.id) {
            mip |= csr::IRQ_MSIP;
        }
        if bus.clint.mtip(self.id) {
            mip |= csr::IRQ_MTIP;
        }
        let (meip, seip) = bus.external_lines(self.id);
        if meip {
            mip |= csr::IRQ_MEIP;
        }
        if seip {
            mip |= csr::IRQ_SEIP;
        }
        mip
    }

    fn raw_pending(&self, bus: &SystemBus) -> u64 {
        self.effective_mip(bus) & self.csrs.mie
    }

    /// Highest-priority interrupt deliverable right now, honoring global
    /// enables and delegation.
    fn pending_interrupt(&self, bus: &SystemBus) -> Option<Interrupt> {
        let pending = self.raw_pending(bus);
        if pending == 0 {
            return None;
        }

        let m_pending = pending & !self.csrs.mideleg;
        let m_enabled = self.privilege < Privilege::Machine
            || self.csrs.mstatus & csr::MSTATUS_MIE != 0;
        if m_enabled {
            if let Some(irq) = highest(m_pending, M_PRIORITY) {
                return Some(irq);
            }
        }

        let s_pending = pending & self.csrs.mideleg;
        let s_enabled = self.privilege < Privilege::Supervisor
            || (self.privilege == Privilege::Supervisor
                && self.csrs.mstatus & csr::MSTATUS_SIE != 0);
        if self.privilege <= Privilege::Supervisor && s_enabled {
            if let Some(irq) = highest(s_pending, S_PRIORITY) {
                return Some(irq);
            }
        }
        None
    }

    fn take_interrupt(&mut self, bus: &SystemBus, irq: Interrupt) {
        self.wfi = false;
        bus.clear_reservation(self.id);
        let entry = trap::enter(&mut self.csrs, self.privilege, self.pc, irq.cause(), 0, true);
        log::trace!(
            "hart{}: interrupt {:?} -> {:?} vector {:#x}",
            self.id,
            irq,
            entry.privilege,
            entry.pc
        );
        self.privilege = entry.privilege;
        self.pc = entry.pc;
    }

    fn take_exception(&mut self, bus: &SystemBus, e: Exception) {
        bus.clear_reservation(self.id);
        let entry = trap::enter(
            &mut self.csrs,
            self.privilege,
            self.pc,
            e.cause(),
            e.tval(),
            false,
        );
        log::trace!(
            "hart{}: exception {:?} at {:#x} -> {:?} vector {:#x}",
            self.id,
            e,
            self.pc,
            entry.privilege,
            entry.pc
        );
        self.privilege = entry.privilege;
        self.pc = entry.pc;
    }

    pub fn state(&self) -> HartState {
        HartState {
            regs: self.regs,
            pc: self.pc,
            privilege: self.privilege,
            csrs: self.csrs.clone(),
            wfi: self.wfi,
        }
    }

    pub fn restore(&mut self, s: &HartState) {
        self.regs = s.regs;
        self.pc = s.pc;
        self.privilege = s.privilege;
        self.csrs = s.csrs.clone();
        self.wfi = s.wfi;
    }

    pub fn reset(&mut self, entry_pc: u64) {
        *self = Hart::new(self.id, entry_pc);
    }
}

/// Machine-level interrupt priority order.
const M_PRIORITY: [Interrupt; 6] = [
    Interrupt::MachineExternal,
    Interrupt::MachineSoft,
    Interrupt::MachineTimer,
    Interrupt::SupervisorExternal,
    Interrupt::SupervisorSoft,
    Interrupt::SupervisorTimer,
];

/// Supervisor-level order (machine bits never appear in the delegated set).
const S_PRIORITY: [Interrupt; 6] = M_PRIORITY;

fn highest(pending: u64, order: [Interrupt; 6]) -> Option<Interrupt> {
    order.into_iter().find(|irq| pending & irq.bit() != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::DRAM_BASE;
    use crate::csr::{CSR_MIE, CSR_MSTATUS, CSR_MTVEC};

    fn bus() -> SystemBus {
        SystemBus::new(1 << 20, 1, None, None, None)
    }

    fn put_inst(b: &SystemBus, addr: u64, inst: u32) {
        b.write(addr, 4, inst as u64).unwrap();
    }

    #[test]
    fn test_x0_wired_zero() {
        let mut h = Hart::new(0, DRAM_BASE);
        h.set_x(0, 0xDEAD);
        assert_eq!(h.x(0), 0);
        h.set_x(5, 7);
        assert_eq!(h.x(5), 7);
    }

    #[test]
    fn test_retires_addi() {
        let b = bus();
        // addi x5, x0, 42
        put_inst(&b, DRAM_BASE, 42 << 20 | 5 << 7 | 0x13);
        let mut h = Hart::new(0, DRAM_BASE);
        assert_eq!(h.step(&b), StepResult::Retired);
        assert_eq!(h.x(5), 42);
        assert_eq!(h.pc, DRAM_BASE + 4);
        assert_eq!(h.csrs.minstret, 1);
    }

    #[test]
    fn test_illegal_instruction_traps_with_bits() {
        let b = bus();
        put_inst(&b, DRAM_BASE, 0xFFFF_FFFF);
        let mut h = Hart::new(0, DRAM_BASE);
        h.csrs.mtvec = DRAM_BASE + 0x100;
        assert_eq!(h.step(&b), StepResult::TrapTaken);
        assert_eq!(h.csrs.mcause, 2);
        assert_eq!(h.csrs.mtval, 0xFFFF_FFFF);
        assert_eq!(h.csrs.mepc, DRAM_BASE);
        assert_eq!(h.pc, DRAM_BASE + 0x100);
    }

    #[test]
    fn test_wfi_then_timer_interrupt() {
        let b = bus();
        // wfi
        put_inst(&b, DRAM_BASE, 0x1050_0073);
        let mut h = Hart::new(0, DRAM_BASE);
        h.csrs.write(CSR_MTVEC, DRAM_BASE + 0x80).unwrap();
        h.csrs.write(CSR_MIE, csr::IRQ_MTIP).unwrap();
        h.csrs.write(CSR_MSTATUS, csr::MSTATUS_MIE).unwrap();

        assert_eq!(h.step(&b), StepResult::Retired);
        assert!(h.wfi);
        assert_eq!(h.step(&b), StepResult::Wfi);

        // Arm the timer at the current mtime: line goes high.
        b.clint.write(0x4000, 8, b.clint.mtime()).unwrap();
        assert_eq!(h.step(&b), StepResult::TrapTaken);
        assert!(!h.wfi);
        assert_eq!(h.csrs.mcause, 1 << 63 | 7);
        assert_eq!(h.pc, DRAM_BASE + 0x80);
        assert_eq!(h.csrs.mepc, DRAM_BASE + 4, "resume after the wfi");
    }

    #[test]
    fn test_interrupt_disabled_by_mie() {
        let b = bus();
        put_inst(&b, DRAM_BASE, 42 << 20 | 5 << 7 | 0x13);
        let mut h = Hart::new(0, DRAM_BASE);
        h.csrs.write(CSR_MIE, csr::IRQ_MSIP).unwrap();
        b.clint.write(0, 4, 1).unwrap(); // msip[0]
        // MIE clear in M-mode: the interrupt stays pending, not taken.
        assert_eq!(h.step(&b), StepResult::Retired);
        h.csrs.write(CSR_MSTATUS, csr::MSTATUS_MIE).unwrap();
        assert_eq!(h.step(&b), StepResult::TrapTaken);
        assert_eq!(h.csrs.mcause, 1 << 63 | 3);
    }

    #[test]
    fn test_halt_reported_after_finisher_store() {
        let b = bus();
        // lui x1, 0x100       (x1 = 0x0010_0000)
        put_inst(&b, DRAM_BASE, 0x100 << 12 | 1 << 7 | 0x37);
        // addi x2, x0, 0x555
        put_inst(&b, DRAM_BASE + 4, 0x555 << 20 | 2 << 7 | 0x13);
        // slli x2, x2, 4      (0x5550)
        put_inst(&b, DRAM_BASE + 8, 4 << 20 | 2 << 15 | 1 << 12 | 2 << 7 | 0x13);
        // addi x2, x2, 5      (0x5555)
        put_inst(&b, DRAM_BASE + 12, 5 << 20 | 2 << 15 | 2 << 7 | 0x13);
        // sw x2, 0(x1)
        put_inst(&b, DRAM_BASE + 16, 2 << 20 | 1 << 15 | 2 << 12 | 0x23);
        let mut h = Hart::new(0, DRAM_BASE);
        for _ in 0..4 {
            assert_eq!(h.step(&b), StepResult::Retired);
        }
        assert_eq!(h.step(&b), StepResult::Halted(0x5555));
    }
}
