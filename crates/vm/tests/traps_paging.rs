//! Privilege, trap delivery, and Sv39 behavior driven through real
//! instruction execution.

mod common;

use common::*;
use rv64vm::bus::DRAM_BASE;
use rv64vm::csr::{
    CSR_MEDELEG, CSR_MEPC, CSR_MSTATUS, CSR_SATP, CSR_STVEC, MSTATUS_MPP_SHIFT, MSTATUS_SIE,
    SATP_MODE_SV39,
};
use rv64vm::hart::StepResult;
use rv64vm::{Machine, MachineConfig, Privilege};

fn machine_with(insts: &[u32]) -> Machine {
    Machine::new(MachineConfig {
        image: assemble(insts),
        ram_size: 4 << 20,
        ..MachineConfig::default()
    })
    .unwrap()
}

#[test]
fn test_umode_ecall_reaches_supervisor_trampoline() {
    // li a0, 0 ; li a7, 93 ; ecall -- the exit(0) idiom.
    let prog = [addi(10, 0, 0), addi(17, 0, 93), ecall(), jal(0, 0)];
    let mut m = machine_with(&prog);
    let ecall_addr = DRAM_BASE + 8;
    let stvec = DRAM_BASE + 0x200;
    {
        let h = m.hart_mut(0);
        h.csrs.write(CSR_MEDELEG, 1 << 8).unwrap(); // delegate EcallFromU
        h.csrs.write(CSR_STVEC, stvec).unwrap();
        h.privilege = Privilege::User;
    }

    assert_eq!(m.step()[0], StepResult::Retired);
    assert_eq!(m.step()[0], StepResult::Retired);
    assert_eq!(m.step()[0], StepResult::TrapTaken);

    let h = m.hart(0);
    assert_eq!(h.csrs.scause, 8, "EcallFromU");
    assert_eq!(h.csrs.sepc, ecall_addr);
    assert_eq!(h.privilege, Privilege::Supervisor);
    assert_eq!(h.pc, stvec);
    assert_eq!(h.x(10), 0);
    assert_eq!(h.x(17), 93);
    // SPP records U; the trampoline can sret back.
    assert_eq!(h.csrs.mstatus >> 8 & 1, 0);
}

#[test]
fn test_mret_into_user_then_ecall_round_trip() {
    // M-mode: mepc <- user code, MPP <- U, mret. User code ecalls straight
    // back to M (no delegation).
    let user = DRAM_BASE + 0x100;
    let mtvec = DRAM_BASE + 0x200;
    let mut prog: Vec<u32> = Vec::new();
    li64(1, user, &mut prog);
    prog.push(csrrw(0, CSR_MEPC, 1));
    prog.push(csrrw(0, CSR_MSTATUS, 0)); // MPP = U
    prog.push(mret());
    let mut m = machine_with(&prog);
    m.bus()
        .write(user, 4, ecall() as u64)
        .unwrap();
    m.hart_mut(0).csrs.write(rv64vm::csr::CSR_MTVEC, mtvec).unwrap();

    let setup = prog.len() as u64;
    m.run_batch(setup); // through the mret
    assert_eq!(m.hart(0).privilege, Privilege::User);
    assert_eq!(m.hart(0).pc, user);

    assert_eq!(m.step()[0], StepResult::TrapTaken);
    let h = m.hart(0);
    assert_eq!(h.privilege, Privilege::Machine);
    assert_eq!(h.csrs.mcause, 8);
    assert_eq!(h.csrs.mepc, user);
    assert_eq!(h.pc, mtvec);
    assert_eq!(h.csrs.mstatus >> MSTATUS_MPP_SHIFT & 3, 0, "MPP stacked U");
}

#[test]
fn test_delegated_software_interrupt_to_smode() {
    // S-mode with SSIP delegated and enabled; setting sip.SSIP vectors to
    // the supervisor handler.
    let prog = [nop(), jal(0, 0)];
    let stvec = DRAM_BASE + 0x300;
    let mut m = machine_with(&prog);
    {
        let h = m.hart_mut(0);
        h.csrs.mideleg = 1 << 1; // SSIP
        h.csrs.mie = 1 << 1;
        h.csrs.stvec = stvec;
        h.csrs.mstatus |= MSTATUS_SIE;
        h.privilege = Privilege::Supervisor;
        h.csrs.mip = 1 << 1; // software-set SSIP
    }
    assert_eq!(m.step()[0], StepResult::TrapTaken);
    let h = m.hart(0);
    assert_eq!(h.csrs.scause, 1 << 63 | 1);
    assert_eq!(h.pc, stvec);
    assert_eq!(h.privilege, Privilege::Supervisor);
    assert_eq!(h.csrs.mstatus & MSTATUS_SIE, 0, "SIE stacked into SPIE");
}

/// Build the three-level table for one executable S-mode page and point
/// satp at it. Returns the satp value used.
fn map_exec_page(m: &Machine, root: u64, va: u64, pa: u64) -> u64 {
    let l1 = root + 0x1000;
    let l0 = root + 0x2000;
    let pte = |target: u64, flags: u64| (target >> 12) << 10 | flags;
    const V: u64 = 1;
    const R: u64 = 2;
    const X: u64 = 8;
    const A: u64 = 1 << 6;
    let vpn2 = va >> 30 & 0x1FF;
    let vpn1 = va >> 21 & 0x1FF;
    let vpn0 = va >> 12 & 0x1FF;
    m.bus().write(root + vpn2 * 8, 8, pte(l1, V)).unwrap();
    m.bus().write(l1 + vpn1 * 8, 8, pte(l0, V)).unwrap();
    m.bus().write(l0 + vpn0 * 8, 8, pte(pa, V | R | X | A)).unwrap();
    SATP_MODE_SV39 << 60 | root >> 12
}

#[test]
fn test_fetch_across_page_boundary_faults_on_second_half() {
    // A 32-bit instruction whose first halfword sits in the last two
    // bytes of a mapped page; the next page is unmapped. stval must point
    // at the second halfword's VA.
    let mut m = machine_with(&[jal(0, 0)]);
    let root = DRAM_BASE + 0x10_0000;
    let code_pa = DRAM_BASE + 0x20_0000;
    let va = 0x40_0000u64;
    let satp = map_exec_page(&m, root, va, code_pa);

    // First half of `nop` (opcode bits 11: treated as 32-bit).
    m.bus().write(code_pa + 0xFFE, 2, (nop() & 0xFFFF) as u64).unwrap();
    {
        let h = m.hart_mut(0);
        h.csrs.write(CSR_SATP, satp).unwrap();
        h.csrs.stvec = DRAM_BASE;
        h.csrs.mideleg = 0;
        h.csrs.mtvec = DRAM_BASE;
        h.privilege = Privilege::Supervisor;
        h.pc = va + 0xFFE;
    }
    assert_eq!(m.step()[0], StepResult::TrapTaken);
    let h = m.hart(0);
    assert_eq!(h.csrs.mcause, 12, "instruction page fault");
    assert_eq!(h.csrs.mtval, va + 0x1000, "VA of the second halfword");
}

#[test]
fn test_smode_executes_from_mapped_page() {
    let mut m = machine_with(&[jal(0, 0)]);
    let root = DRAM_BASE + 0x10_0000;
    let code_pa = DRAM_BASE + 0x20_0000;
    let va = 0x40_0000u64;
    let satp = map_exec_page(&m, root, va, code_pa);

    // addi x5, x0, 9 ; self-loop
    m.bus().write(code_pa, 4, addi(5, 0, 9) as u64).unwrap();
    m.bus().write(code_pa + 4, 4, jal(0, 0) as u64).unwrap();
    {
        let h = m.hart_mut(0);
        h.csrs.write(CSR_SATP, satp).unwrap();
        h.privilege = Privilege::Supervisor;
        h.pc = va;
    }
    assert_eq!(m.step()[0], StepResult::Retired);
    assert_eq!(m.hart(0).x(5), 9);
    assert_eq!(m.hart(0).pc, va + 4);
}

#[test]
fn test_store_to_readonly_page_faults_with_va() {
    let mut m = machine_with(&[jal(0, 0)]);
    let root = DRAM_BASE + 0x10_0000;
    let code_pa = DRAM_BASE + 0x20_0000;
    let va = 0x40_0000u64;
    let satp = map_exec_page(&m, root, va, code_pa); // R+X, no W

    // sd x0, 16(x... use va in x1): store into the same (read-only) page.
    let mut prog: Vec<u32> = Vec::new();
    li64(1, va, &mut prog);
    prog.push(sd(0, 1, 16));
    for (i, inst) in prog.iter().enumerate() {
        m.bus().write(code_pa + 4 * i as u64, 4, *inst as u64).unwrap();
    }
    {
        let h = m.hart_mut(0);
        h.csrs.write(CSR_SATP, satp).unwrap();
        h.csrs.mtvec = DRAM_BASE;
        h.privilege = Privilege::Supervisor;
        h.pc = va;
    }
    let setup = prog.len() - 1;
    for _ in 0..setup {
        assert_eq!(m.step()[0], StepResult::Retired);
    }
    assert_eq!(m.step()[0], StepResult::TrapTaken);
    let h = m.hart(0);
    assert_eq!(h.csrs.mcause, 15, "store page fault");
    assert_eq!(h.csrs.mtval, va + 16);
}
