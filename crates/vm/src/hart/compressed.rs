//! RVC expansion
//!
//! Every 16-bit instruction expands to exactly one 32-bit base
//! instruction, so the executor only ever sees the base encoding. The
//! float-point quadrant-0/2 slots (c.fld/c.fsd/c.fldsp/c.fsdsp) decode as
//! illegal since F/D are not implemented.

/// Expand a compressed instruction, or `Err(())` for reserved/unsupported
/// encodings (the caller raises IllegalInstruction with the raw bits).
pub fn decompress(inst: u16) -> Result<u32, ()> {
    let inst = inst as u32;
    match inst & 3 {
        0 => quadrant0(inst),
        1 => quadrant1(inst),
        2 => quadrant2(inst),
        _ => Err(()),
    }
}

// 32-bit encoders.

fn enc_r(funct7: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32, op: u32) -> u32 {
    funct7 << 25 | rs2 << 20 | rs1 << 15 | funct3 << 12 | rd << 7 | op
}

fn enc_i(imm: u32, rs1: u32, funct3: u32, rd: u32, op: u32) -> u32 {
    (imm & 0xFFF) << 20 | rs1 << 15 | funct3 << 12 | rd << 7 | op
}

fn enc_s(imm: u32, rs2: u32, rs1: u32, funct3: u32, op: u32) -> u32 {
    (imm >> 5 & 0x7F) << 25 | rs2 << 20 | rs1 << 15 | funct3 << 12 | (imm & 0x1F) << 7 | op
}

fn enc_b(imm: u32, rs2: u32, rs1: u32, funct3: u32, op: u32) -> u32 {
    (imm >> 12 & 1) << 31
        | (imm >> 5 & 0x3F) << 25
        | rs2 << 20
        | rs1 << 15
        | funct3 << 12
        | (imm >> 1 & 0xF) << 8
        | (imm >> 11 & 1) << 7
        | op
}

fn enc_j(imm: u32, rd: u32, op: u32) -> u32 {
    (imm >> 20 & 1) << 31
        | (imm >> 1 & 0x3FF) << 21
        | (imm >> 11 & 1) << 20
        | (imm >> 12 & 0xFF) << 12
        | rd << 7
        | op
}

/// rd'/rs' fields address x8..x15.
fn creg(bits: u32) -> u32 {
    (bits & 7) + 8
}

/// Sign-extend `val` from `bits` bits into an i32 immediate.
fn sext(val: u32, bits: u32) -> u32 {
    let shift = 32 - bits;
    ((val << shift) as i32 >> shift) as u32
}

fn quadrant0(inst: u32) -> Result<u32, ()> {
    let funct3 = inst >> 13 & 7;
    let rd = creg(inst >> 2);
    let rs1 = creg(inst >> 7);
    match funct3 {
        0b000 => {
            // c.addi4spn: addi rd', x2, nzuimm[9:2]
            let imm = (inst >> 7 & 0x30) | (inst >> 1 & 0x3C0) | (inst >> 4 & 4) | (inst >> 2 & 8);
            if imm == 0 {
                return Err(());
            }
            Ok(enc_i(imm, 2, 0, rd, 0x13))
        }
        0b010 => {
            // c.lw: lw rd', uimm(rs1')
            let imm = (inst >> 7 & 0x38) | (inst >> 4 & 4) | (inst << 1 & 0x40);
            Ok(enc_i(imm, rs1, 2, rd, 0x03))
        }
        0b011 => {
            // c.ld: ld rd', uimm(rs1')
            let imm = (inst >> 7 & 0x38) | (inst << 1 & 0xC0);
            Ok(enc_i(imm, rs1, 3, rd, 0x03))
        }
        0b110 => {
            // c.sw: sw rs2', uimm(rs1')
            let imm = (inst >> 7 & 0x38) | (inst >> 4 & 4) | (inst << 1 & 0x40);
            Ok(enc_s(imm, rd, rs1, 2, 0x23))
        }
        0b111 => {
            // c.sd: sd rs2', uimm(rs1')
            let imm = (inst >> 7 & 0x38) | (inst << 1 & 0xC0);
            Ok(enc_s(imm, rd, rs1, 3, 0x23))
        }
        _ => Err(()), // c.fld/c.fsd (no FP) and reserved
    }
}

fn quadrant1(inst: u32) -> Result<u32, ()> {
    let funct3 = inst >> 13 & 7;
    let rd = inst >> 7 & 0x1F;
    let imm6 = sext((inst >> 7 & 0x20) | (inst >> 2 & 0x1F), 6);
    match funct3 {
        // c.addi / c.nop
        0b000 => Ok(enc_i(imm6, rd, 0, rd, 0x13)),
        // c.addiw (rd=0 reserved)
        0b001 => {
            if rd == 0 {
                return Err(());
            }
            Ok(enc_i(imm6, rd, 0, rd, 0x1B))
        }
        // c.li
        0b010 => Ok(enc_i(imm6, 0, 0, rd, 0x13)),
        0b011 => {
            if rd == 2 {
                // c.addi16sp: addi x2, x2, nzimm[9:4]
                let imm = sext(
                    (inst >> 3 & 0x200)
                        | (inst >> 2 & 0x10)
                        | (inst << 1 & 0x40)
                        | (inst << 4 & 0x180)
                        | (inst << 3 & 0x20),
                    10,
                );
                if imm == 0 {
                    return Err(());
                }
                Ok(enc_i(imm, 2, 0, 2, 0x13))
            } else {
                // c.lui: rd != 0, imm != 0
                if imm6 == 0 {
                    return Err(());
                }
                Ok((imm6 & 0xFFFFF) << 12 | rd << 7 | 0x37)
            }
        }
        0b100 => {
            let rs1 = creg(inst >> 7);
            let rs2 = creg(inst >> 2);
            match inst >> 10 & 3 {
                0b00 => {
                    // c.srli
                    let shamt = (inst >> 7 & 0x20) | (inst >> 2 & 0x1F);
                    Ok(enc_i(shamt, rs1, 5, rs1, 0x13))
                }
                0b01 => {
                    // c.srai
                    let shamt = (inst >> 7 & 0x20) | (inst >> 2 & 0x1F);
                    Ok(enc_i(0x400 | shamt, rs1, 5, rs1, 0x13))
                }
                0b10 => Ok(enc_i(imm6, rs1, 7, rs1, 0x13)), // c.andi
                _ => {
                    let word = inst >> 12 & 1 != 0;
                    match (word, inst >> 5 & 3) {
                        (false, 0b00) => Ok(enc_r(0x20, rs2, rs1, 0, rs1, 0x33)), // c.sub
                        (false, 0b01) => Ok(enc_r(0, rs2, rs1, 4, rs1, 0x33)),    // c.xor
                        (false, 0b10) => Ok(enc_r(0, rs2, rs1, 6, rs1, 0x33)),    // c.or
                        (false, 0b11) => Ok(enc_r(0, rs2, rs1, 7, rs1, 0x33)),    // c.and
                        (true, 0b00) => Ok(enc_r(0x20, rs2, rs1, 0, rs1, 0x3B)),  // c.subw
                        (true, 0b01) => Ok(enc_r(0, rs2, rs1, 0, rs1, 0x3B)),     // c.addw
                        _ => Err(()),
                    }
                }
            }
        }
        0b101 => {
            // c.j: jal x0, imm[11:1]
            let imm = sext(
                (inst >> 1 & 0x800)
                    | (inst >> 7 & 0x10)
                    | (inst >> 1 & 0x300)
                    | (inst << 2 & 0x400)
                    | (inst >> 1 & 0x40)
                    | (inst << 1 & 0x80)
                    | (inst >> 2 & 0xE)
                    | (inst << 3 & 0x20),
                12,
            );
            Ok(enc_j(imm, 0, 0x6F))
        }
        0b110 | 0b111 => {
            // c.beqz / c.bnez: b{eq,ne} rs1', x0, imm[8:1]
            let rs1 = creg(inst >> 7);
            let imm = sext(
                (inst >> 4 & 0x100)
                    | (inst >> 7 & 0x18)
                    | (inst << 1 & 0xC0)
                    | (inst >> 2 & 6)
                    | (inst << 3 & 0x20),
                9,
            );
            let funct3 = if funct3 == 0b110 { 0 } else { 1 };
            Ok(enc_b(imm, 0, rs1, funct3, 0x63))
        }
        _ => Err(()),
    }
}

fn quadrant2(inst: u32) -> Result<u32, ()> {
    let funct3 = inst >> 13 & 7;
    let rd = inst >> 7 & 0x1F;
    let rs2 = inst >> 2 & 0x1F;
    match funct3 {
        0b000 => {
            // c.slli
            let shamt = (inst >> 7 & 0x20) | (inst >> 2 & 0x1F);
            Ok(enc_i(shamt, rd, 1, rd, 0x13))
        }
        0b010 => {
            // c.lwsp (rd != 0)
            if rd == 0 {
                return Err(());
            }
            let imm = (inst >> 7 & 0x20) | (inst >> 2 & 0x1C) | (inst << 4 & 0xC0);
            Ok(enc_i(imm, 2, 2, rd, 0x03))
        }
        0b011 => {
            // c.ldsp (rd != 0)
            if rd == 0 {
                return Err(());
            }
            let imm = (inst >> 7 & 0x20) | (inst >> 2 & 0x18) | (inst << 4 & 0x1C0);
            Ok(enc_i(imm, 2, 3, rd, 0x03))
        }
        0b100 => {
            let bit12 = inst >> 12 & 1 != 0;
            match (bit12, rd, rs2) {
                (false, 0, _) => Err(()),
                // c.jr: jalr x0, 0(rs1)
                (false, _, 0) => Ok(enc_i(0, rd, 0, 0, 0x67)),
                // c.mv: add rd, x0, rs2
                (false, _, _) => Ok(enc_r(0, rs2, 0, 0, rd, 0x33)),
                // c.ebreak
                (true, 0, 0) => Ok(0x0010_0073),
                // c.jalr: jalr x1, 0(rs1)
                (true, _, 0) => Ok(enc_i(0, rd, 0, 1, 0x67)),
                // c.add: add rd, rd, rs2
                (true, _, _) => Ok(enc_r(0, rs2, rd, 0, rd, 0x33)),
            }
        }
        0b110 => {
            // c.swsp: sw rs2, uimm(x2)
            let imm = (inst >> 7 & 0x3C) | (inst >> 1 & 0xC0);
            Ok(enc_s(imm, rs2, 2, 2, 0x23))
        }
        0b111 => {
            // c.sdsp: sd rs2, uimm(x2)
            let imm = (inst >> 7 & 0x38) | (inst >> 1 & 0x1C0);
            Ok(enc_s(imm, rs2, 2, 3, 0x23))
        }
        _ => Err(()), // c.fldsp/c.fsdsp (no FP)
    }
}
