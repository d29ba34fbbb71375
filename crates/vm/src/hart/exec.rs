//! RV64IMA + Zicsr + Zifencei execution
//!
//! One flat decode over the 32-bit encoding (compressed instructions were
//! expanded by the fetcher). Each handler computes the architectural
//! effect against `(hart, bus)` and returns the next PC; anything
//! undecodable falls through to IllegalInstruction with the raw bits.

use super::Hart;
use crate::bus::SystemBus;
use crate::csr::{self, CsrFile};
use crate::trap::{Exception, Privilege};
use std::sync::atomic::{fence, Ordering};

// Field accessors.
#[inline(always)]
fn rd(inst: u32) -> u32 {
    inst >> 7 & 0x1F
}

#[inline(always)]
fn rs1(inst: u32) -> u32 {
    inst >> 15 & 0x1F
}

#[inline(always)]
fn rs2(inst: u32) -> u32 {
    inst >> 20 & 0x1F
}

#[inline(always)]
fn funct3(inst: u32) -> u32 {
    inst >> 12 & 7
}

#[inline(always)]
fn funct7(inst: u32) -> u32 {
    inst >> 25
}

#[inline(always)]
fn imm_i(inst: u32) -> u64 {
    (inst as i32 >> 20) as i64 as u64
}

#[inline(always)]
fn imm_s(inst: u32) -> u64 {
    let v = (inst >> 25 << 5 | inst >> 7 & 0x1F) as i32;
    (v << 20 >> 20) as i64 as u64
}

#[inline(always)]
fn imm_b(inst: u32) -> u64 {
    let v = (inst >> 31 & 1) << 12
        | (inst >> 7 & 1) << 11
        | (inst >> 25 & 0x3F) << 5
        | (inst >> 8 & 0xF) << 1;
    ((v as i32) << 19 >> 19) as i64 as u64
}

#[inline(always)]
fn imm_u(inst: u32) -> u64 {
    (inst & 0xFFFF_F000) as i32 as i64 as u64
}

#[inline(always)]
fn imm_j(inst: u32) -> u64 {
    let v = (inst >> 31 & 1) << 20
        | (inst >> 12 & 0xFF) << 12
        | (inst >> 20 & 1) << 11
        | (inst >> 21 & 0x3FF) << 1;
    ((v as i32) << 11 >> 11) as i64 as u64
}

/// Execute one decoded instruction; returns the next PC.
pub fn execute(
    hart: &mut Hart,
    bus: &SystemBus,
    inst: u32,
    pc: u64,
    len: u64,
) -> Result<u64, Exception> {
    let next = pc.wrapping_add(len);
    let illegal = Err(Exception::IllegalInstruction(inst as u64));

    match inst & 0x7F {
        // lui
        0x37 => {
            hart.set_x(rd(inst), imm_u(inst));
            Ok(next)
        }
        // auipc
        0x17 => {
            hart.set_x(rd(inst), pc.wrapping_add(imm_u(inst)));
            Ok(next)
        }
        // jal
        0x6F => {
            hart.set_x(rd(inst), next);
            Ok(pc.wrapping_add(imm_j(inst)))
        }
        // jalr
        0x67 => {
            if funct3(inst) != 0 {
                return illegal;
            }
            let target = hart.x(rs1(inst)).wrapping_add(imm_i(inst)) & !1;
            hart.set_x(rd(inst), next);
            Ok(target)
        }
        0x63 => branch(hart, inst, pc, next),
        0x03 => load(hart, bus, inst, next),
        0x23 => store(hart, bus, inst, next),
        // op-imm
        0x13 => {
            let v = alu_imm(hart, inst)?;
            hart.set_x(rd(inst), v);
            Ok(next)
        }
        // op-imm-32
        0x1B => {
            let v = alu_imm32(hart, inst)?;
            hart.set_x(rd(inst), v);
            Ok(next)
        }
        // op
        0x33 => {
            let a = hart.x(rs1(inst));
            let b = hart.x(rs2(inst));
            let v = match funct7(inst) {
                0x00 | 0x20 => alu_reg(inst, a, b)?,
                0x01 => mul_div(inst, a, b)?,
                _ => return illegal,
            };
            hart.set_x(rd(inst), v);
            Ok(next)
        }
        // op-32
        0x3B => {
            let a = hart.x(rs1(inst));
            let b = hart.x(rs2(inst));
            let v = match funct7(inst) {
                0x00 | 0x20 => alu_reg32(inst, a, b)?,
                0x01 => mul_div32(inst, a, b)?,
                _ => return illegal,
            };
            hart.set_x(rd(inst), v);
            Ok(next)
        }
        // misc-mem
        0x0F => {
            match funct3(inst) {
                // fence: full fence against the bus.
                0 => fence(Ordering::SeqCst),
                // fence.i: no decoded-op cache, so ordering is all that
                // remains.
                1 => fence(Ordering::SeqCst),
                _ => return illegal,
            }
            Ok(next)
        }
        0x2F => amo(hart, bus, inst, next),
        0x73 => system(hart, bus, inst, pc, next),
        _ => illegal,
    }
}

fn branch(hart: &mut Hart, inst: u32, pc: u64, next: u64) -> Result<u64, Exception> {
    let a = hart.x(rs1(inst));
    let b = hart.x(rs2(inst));
    let taken = match funct3(inst) {
        0 => a == b,
        1 => a != b,
        4 => (a as i64) < b as i64,
        5 => a as i64 >= b as i64,
        6 => a < b,
        7 => a >= b,
        _ => return Err(Exception::IllegalInstruction(inst as u64)),
    };
    Ok(if taken { pc.wrapping_add(imm_b(inst)) } else { next })
}

fn load(hart: &mut Hart, bus: &SystemBus, inst: u32, next: u64) -> Result<u64, Exception> {
    let va = hart.x(rs1(inst)).wrapping_add(imm_i(inst));
    let v = match funct3(inst) {
        0 => hart.load(bus, va, 1)? as i8 as i64 as u64,
        1 => hart.load(bus, va, 2)? as i16 as i64 as u64,
        2 => hart.load(bus, va, 4)? as i32 as i64 as u64,
        3 => hart.load(bus, va, 8)?,
        4 => hart.load(bus, va, 1)?,
        5 => hart.load(bus, va, 2)?,
        6 => hart.load(bus, va, 4)?,
        _ => return Err(Exception::IllegalInstruction(inst as u64)),
    };
    hart.set_x(rd(inst), v);
    Ok(next)
}

fn store(hart: &mut Hart, bus: &SystemBus, inst: u32, next: u64) -> Result<u64, Exception> {
    let va = hart.x(rs1(inst)).wrapping_add(imm_s(inst));
    let v = hart.x(rs2(inst));
    match funct3(inst) {
        0 => hart.store(bus, va, 1, v)?,
        1 => hart.store(bus, va, 2, v)?,
        2 => hart.store(bus, va, 4, v)?,
        3 => hart.store(bus, va, 8, v)?,
        _ => return Err(Exception::IllegalInstruction(inst as u64)),
    }
    Ok(next)
}

fn alu_imm(hart: &Hart, inst: u32) -> Result<u64, Exception> {
    let a = hart.x(rs1(inst));
    let imm = imm_i(inst);
    let shamt = (inst >> 20 & 0x3F) as u32;
    Ok(match funct3(inst) {
        0 => a.wrapping_add(imm),
        1 => {
            if funct7(inst) & 0x3E != 0 {
                return Err(Exception::IllegalInstruction(inst as u64));
            }
            a << shamt
        }
        2 => ((a as i64) < imm as i64) as u64,
        3 => (a < imm) as u64,
        4 => a ^ imm,
        5 => match funct7(inst) & 0x3E {
            0x00 => a >> shamt,
            0x20 => (a as i64 >> shamt) as u64,
            _ => return Err(Exception::IllegalInstruction(inst as u64)),
        },
        6 => a | imm,
        _ => a & imm,
    })
}

fn alu_imm32(hart: &Hart, inst: u32) -> Result<u64, Exception> {
    let a = hart.x(rs1(inst));
    let imm = imm_i(inst);
    // Word shifts use the low 5 bits only.
    let shamt = (inst >> 20 & 0x1F) as u32;
    Ok(match funct3(inst) {
        0 => (a.wrapping_add(imm) as i32) as i64 as u64,
        1 => {
            if funct7(inst) != 0 {
                return Err(Exception::IllegalInstruction(inst as u64));
            }
            ((a as u32) << shamt) as i32 as i64 as u64
        }
        5 => match funct7(inst) {
            0x00 => (a as u32 >> shamt) as i32 as i64 as u64,
            0x20 => (a as i32 >> shamt) as i64 as u64,
            _ => return Err(Exception::IllegalInstruction(inst as u64)),
        },
        _ => return Err(Exception::IllegalInstruction(inst as u64)),
    })
}

fn alu_reg(inst: u32, a: u64, b: u64) -> Result<u64, Exception> {
    let sub = funct7(inst) == 0x20;
    Ok(match (funct3(inst), sub) {
        (0, false) => a.wrapping_add(b),
        (0, true) => a.wrapping_sub(b),
        (1, false) => a << (b & 0x3F),
        (2, false) => ((a as i64) < b as i64) as u64,
        (3, false) => (a < b) as u64,
        (4, false) => a ^ b,
        (5, false) => a >> (b & 0x3F),
        (5, true) => (a as i64 >> (b & 0x3F)) as u64,
        (6, false) => a | b,
        (7, false) => a & b,
        _ => return Err(Exception::IllegalInstruction(inst as u64)),
    })
}

fn alu_reg32(inst: u32, a: u64, b: u64) -> Result<u64, Exception> {
    let sub = funct7(inst) == 0x20;
    let sh = b as u32 & 0x1F;
    Ok(match (funct3(inst), sub) {
        (0, false) => (a.wrapping_add(b) as i32) as i64 as u64,
        (0, true) => (a.wrapping_sub(b) as i32) as i64 as u64,
        (1, false) => ((a as u32) << sh) as i32 as i64 as u64,
        (5, false) => (a as u32 >> sh) as i32 as i64 as u64,
        (5, true) => (a as i32 >> sh) as i64 as u64,
        _ => return Err(Exception::IllegalInstruction(inst as u64)),
    })
}

fn mul_div(inst: u32, a: u64, b: u64) -> Result<u64, Exception> {
    Ok(match funct3(inst) {
        0 => a.wrapping_mul(b),
        1 => ((a as i64 as i128).wrapping_mul(b as i64 as i128) >> 64) as u64,
        2 => ((a as i64 as i128).wrapping_mul(b as i128) >> 64) as u64,
        3 => ((a as u128 * b as u128) >> 64) as u64,
        4 => {
            // div: /0 -> -1, overflow -> dividend.
            if b == 0 {
                u64::MAX
            } else if a as i64 == i64::MIN && b as i64 == -1 {
                a
            } else {
                (a as i64 / b as i64) as u64
            }
        }
        5 => {
            if b == 0 {
                u64::MAX
            } else {
                a / b
            }
        }
        6 => {
            // rem: /0 -> dividend, overflow -> 0.
            if b == 0 {
                a
            } else if a as i64 == i64::MIN && b as i64 == -1 {
                0
            } else {
                (a as i64 % b as i64) as u64
            }
        }
        _ => {
            if b == 0 {
                a
            } else {
                a % b
            }
        }
    })
}

fn mul_div32(inst: u32, a: u64, b: u64) -> Result<u64, Exception> {
    let aw = a as i32;
    let bw = b as i32;
    Ok(match funct3(inst) {
        0 => aw.wrapping_mul(bw) as i64 as u64,
        4 => {
            if bw == 0 {
                u64::MAX
            } else if aw == i32::MIN && bw == -1 {
                aw as i64 as u64
            } else {
                (aw / bw) as i64 as u64
            }
        }
        5 => {
            if bw == 0 {
                u64::MAX
            } else {
                (a as u32 / b as u32) as i32 as i64 as u64
            }
        }
        6 => {
            if bw == 0 {
                aw as i64 as u64
            } else if aw == i32::MIN && bw == -1 {
                0
            } else {
                (aw % bw) as i64 as u64
            }
        }
        7 => {
            if bw == 0 {
                (a as u32) as i32 as i64 as u64
            } else {
                (a as u32 % b as u32) as i32 as i64 as u64
            }
        }
        _ => return Err(Exception::IllegalInstruction(inst as u64)),
    })
}

fn amo(hart: &mut Hart, bus: &SystemBus, inst: u32, next: u64) -> Result<u64, Exception> {
    let size = match funct3(inst) {
        2 => 4u8,
        3 => 8u8,
        _ => return Err(Exception::IllegalInstruction(inst as u64)),
    };
    let va = hart.x(rs1(inst));
    let src = hart.x(rs2(inst));
    let funct5 = funct7(inst) >> 2;

    // lr/sc first: they use the reservation table rather than an RMW.
    match funct5 {
        0x02 => {
            if rs2(inst) != 0 {
                return Err(Exception::IllegalInstruction(inst as u64));
            }
            let pa = hart.translate_amo(bus, va, size, false)?;
            let v = bus.load_reserved(hart.id, pa, size)?;
            let v = if size == 4 { v as i32 as i64 as u64 } else { v };
            hart.set_x(rd(inst), v);
            return Ok(next);
        }
        0x03 => {
            let pa = hart.translate_amo(bus, va, size, true)?;
            let r = bus.store_conditional(hart.id, pa, size, src)?;
            hart.set_x(rd(inst), r);
            return Ok(next);
        }
        _ => {}
    }

    let pa = hart.translate_amo(bus, va, size, true)?;
    let old = match funct5 {
        0x01 => bus.amo(pa, size, |_| src)?, // amoswap
        0x00 => bus.amo(pa, size, |v| v.wrapping_add(src))?,
        0x04 => bus.amo(pa, size, |v| v ^ src)?,
        0x0C => bus.amo(pa, size, |v| v & src)?,
        0x08 => bus.amo(pa, size, |v| v | src)?,
        0x10 => {
            // amomin (signed)
            if size == 4 {
                bus.amo(pa, size, |v| (v as i32).min(src as i32) as u32 as u64)?
            } else {
                bus.amo(pa, size, |v| (v as i64).min(src as i64) as u64)?
            }
        }
        0x14 => {
            if size == 4 {
                bus.amo(pa, size, |v| (v as i32).max(src as i32) as u32 as u64)?
            } else {
                bus.amo(pa, size, |v| (v as i64).max(src as i64) as u64)?
            }
        }
        0x18 => {
            if size == 4 {
                bus.amo(pa, size, |v| (v as u32).min(src as u32) as u64)?
            } else {
                bus.amo(pa, size, |v| v.min(src))?
            }
        }
        0x1C => {
            if size == 4 {
                bus.amo(pa, size, |v| (v as u32).max(src as u32) as u64)?
            } else {
                bus.amo(pa, size, |v| v.max(src))?
            }
        }
        _ => return Err(Exception::IllegalInstruction(inst as u64)),
    };
    let old = if size == 4 { old as i32 as i64 as u64 } else { old };
    hart.set_x(rd(inst), old);
    Ok(next)
}

fn system(
    hart: &mut Hart,
    bus: &SystemBus,
    inst: u32,
    pc: u64,
    next: u64,
) -> Result<u64, Exception> {
    let illegal = Err(Exception::IllegalInstruction(inst as u64));
    if funct3(inst) == 0 {
        return match inst >> 20 {
            // ecall
            0x000 if rs1(inst) == 0 && rd(inst) == 0 => Err(match hart.privilege {
                Privilege::User => Exception::EcallFromU,
                Privilege::Supervisor => Exception::EcallFromS,
                Privilege::Machine => Exception::EcallFromM,
            }),
            // ebreak
            0x001 if rs1(inst) == 0 && rd(inst) == 0 => Err(Exception::Breakpoint(pc)),
            // sret
            0x102 if rs1(inst) == 0 && rd(inst) == 0 => sret(hart, inst),
            // mret
            0x302 if rs1(inst) == 0 && rd(inst) == 0 => mret(hart, inst),
            // wfi
            0x105 if rs1(inst) == 0 && rd(inst) == 0 => {
                if hart.privilege < Privilege::Machine
                    && hart.csrs.mstatus & csr::MSTATUS_TW != 0
                {
                    return illegal;
                }
                hart.wfi = true;
                Ok(next)
            }
            _ if funct7(inst) == 0x09 && rd(inst) == 0 => {
                // sfence.vma: no translation cache, so only ordering.
                if hart.privilege == Privilege::Supervisor
                    && hart.csrs.mstatus & csr::MSTATUS_TVM != 0
                {
                    return illegal;
                }
                if hart.privilege == Privilege::User {
                    return illegal;
                }
                fence(Ordering::SeqCst);
                Ok(next)
            }
            _ => illegal,
        };
    }
    csr_op(hart, bus, inst, next)
}

fn sret(hart: &mut Hart, inst: u32) -> Result<u64, Exception> {
    if hart.privilege < Privilege::Supervisor
        || (hart.privilege == Privilege::Supervisor
            && hart.csrs.mstatus & csr::MSTATUS_TSR != 0)
    {
        return Err(Exception::IllegalInstruction(inst as u64));
    }
    let c = &mut hart.csrs;
    let spie = c.mstatus >> csr::MSTATUS_SPIE_SHIFT & 1;
    let spp = c.mstatus >> csr::MSTATUS_SPP_SHIFT & 1;
    c.mstatus &= !(csr::MSTATUS_SIE | csr::MSTATUS_SPIE | csr::MSTATUS_SPP);
    c.mstatus |= spie << csr::MSTATUS_SIE_SHIFT;
    c.mstatus |= csr::MSTATUS_SPIE;
    let new_prv = Privilege::from_bits(spp);
    if new_prv != Privilege::Machine {
        c.mstatus &= !csr::MSTATUS_MPRV;
    }
    hart.privilege = new_prv;
    Ok(hart.csrs.sepc)
}

fn mret(hart: &mut Hart, inst: u32) -> Result<u64, Exception> {
    if hart.privilege < Privilege::Machine {
        return Err(Exception::IllegalInstruction(inst as u64));
    }
    let c = &mut hart.csrs;
    let mpie = c.mstatus >> csr::MSTATUS_MPIE_SHIFT & 1;
    let mpp = c.mstatus >> csr::MSTATUS_MPP_SHIFT & 3;
    c.mstatus &= !(csr::MSTATUS_MIE | csr::MSTATUS_MPIE | csr::MSTATUS_MPP);
    c.mstatus |= mpie << csr::MSTATUS_MIE_SHIFT;
    c.mstatus |= csr::MSTATUS_MPIE;
    let new_prv = Privilege::from_bits(mpp);
    if new_prv != Privilege::Machine {
        c.mstatus &= !csr::MSTATUS_MPRV;
    }
    hart.privilege = new_prv;
    Ok(hart.csrs.mepc)
}

fn csr_op(
    hart: &mut Hart,
    bus: &SystemBus,
    inst: u32,
    next: u64,
) -> Result<u64, Exception> {
    let illegal = Err(Exception::IllegalInstruction(inst as u64));
    let addr = (inst >> 20) as u16;
    let f3 = funct3(inst);
    if f3 == 4 {
        return illegal;
    }
    let src = if f3 >= 5 {
        rs1(inst) as u64 // immediate forms
    } else {
        hart.x(rs1(inst))
    };
    // csrrs/csrrc with a zero source never write.
    let is_write = matches!(f3 & 3, 1) || rs1(inst) != 0;

    if hart
        .csrs
        .check_access(addr, hart.privilege, is_write)
        .is_err()
    {
        return illegal;
    }
    // TVM traps S-mode satp access.
    if addr == csr::CSR_SATP
        && hart.privilege == Privilege::Supervisor
        && hart.csrs.mstatus & csr::MSTATUS_TVM != 0
    {
        return illegal;
    }

    let old = match csr_read(hart, bus, addr) {
        Ok(v) => v,
        Err(()) => return illegal,
    };
    if is_write {
        let new = match f3 & 3 {
            1 => src,
            2 => old | src,
            _ => old & !src,
        };
        if hart.csrs.write(addr, new).is_err() {
            return illegal;
        }
    }
    hart.set_x(rd(inst), old);
    Ok(next)
}

/// CSR read with the dynamic values composed in.
fn csr_read(hart: &Hart, bus: &SystemBus, addr: u16) -> Result<u64, ()> {
    match addr {
        csr::CSR_MIP => Ok(hart.effective_mip(bus)),
        csr::CSR_SIP => Ok(hart.effective_mip(bus) & hart.csrs.mideleg),
        csr::CSR_CYCLE => {
            counter_allowed(&hart.csrs, hart.privilege, 0)?;
            Ok(hart.csrs.mcycle)
        }
        csr::CSR_TIME => {
            counter_allowed(&hart.csrs, hart.privilege, 1)?;
            Ok(bus.clint.mtime())
        }
        csr::CSR_INSTRET => {
            counter_allowed(&hart.csrs, hart.privilege, 2)?;
            Ok(hart.csrs.minstret)
        }
        _ => hart.csrs.read(addr),
    }
}

/// mcounteren/scounteren gate the unprivileged counter views.
fn counter_allowed(csrs: &CsrFile, prv: Privilege, bit: u32) -> Result<(), ()> {
    let m_ok = csrs.mcounteren & 1 << bit != 0;
    match prv {
        Privilege::Machine => Ok(()),
        Privilege::Supervisor => {
            if m_ok {
                Ok(())
            } else {
                Err(())
            }
        }
        Privilege::User => {
            if m_ok && csrs.scounteren & 1 << bit != 0 {
                Ok(())
            } else {
                Err(())
            }
        }
    }
}
