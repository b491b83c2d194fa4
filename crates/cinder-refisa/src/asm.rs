//! Instruction encoders for building test and demo programs.
//!
//! Branch offsets are in bytes relative to the branch instruction itself.

use cinder_dbt::RegId;

use crate::isa::{opcode, INSN_LEN};

pub const R0: RegId = RegId(0);
pub const R1: RegId = RegId(1);
pub const R2: RegId = RegId(2);
pub const R3: RegId = RegId(3);
pub const R4: RegId = RegId(4);
pub const R5: RegId = RegId(5);
pub const R6: RegId = RegId(6);
pub const R7: RegId = RegId(7);

fn r(reg: RegId) -> u8 {
    reg.0 as u8
}

fn imm16(op: u8, a: u8, v: i16) -> [u8; INSN_LEN] {
    let [lo, hi] = v.to_le_bytes();
    [op, a, lo, hi]
}

pub fn nop() -> [u8; INSN_LEN] {
    [opcode::NOP, 0, 0, 0]
}

pub fn movi(rd: RegId, imm: i16) -> [u8; INSN_LEN] {
    imm16(opcode::MOVI, r(rd), imm)
}

pub fn mov(rd: RegId, rs: RegId) -> [u8; INSN_LEN] {
    [opcode::MOV, r(rd), r(rs), 0]
}

pub fn add(rd: RegId, rs: RegId, rt: RegId) -> [u8; INSN_LEN] {
    [opcode::ADD, r(rd), r(rs), r(rt)]
}

pub fn addi(rd: RegId, rs: RegId, imm: i8) -> [u8; INSN_LEN] {
    [opcode::ADDI, r(rd), r(rs), imm as u8]
}

pub fn sub(rd: RegId, rs: RegId, rt: RegId) -> [u8; INSN_LEN] {
    [opcode::SUB, r(rd), r(rs), r(rt)]
}

pub fn movw(rd: RegId, imm: u16) -> [u8; INSN_LEN] {
    imm16(opcode::MOVW, r(rd), imm as i16)
}

pub fn movb(rd: RegId, imm: u8) -> [u8; INSN_LEN] {
    [opcode::MOVB, r(rd), imm, 0]
}

pub fn addw(rd: RegId, rs: RegId) -> [u8; INSN_LEN] {
    [opcode::ADDW, r(rd), r(rs), 0]
}

pub fn cmpi(rs: RegId, imm: i8) -> [u8; INSN_LEN] {
    [opcode::CMPI, r(rs), imm as u8, 0]
}

pub fn ldw(rd: RegId, base: RegId, off: i8) -> [u8; INSN_LEN] {
    [opcode::LDW, r(rd), r(base), off as u8]
}

pub fn stw(rs: RegId, base: RegId, off: i8) -> [u8; INSN_LEN] {
    [opcode::STW, r(rs), r(base), off as u8]
}

pub fn b(off: i16) -> [u8; INSN_LEN] {
    imm16(opcode::B, 0, off)
}

pub fn bz(off: i16) -> [u8; INSN_LEN] {
    imm16(opcode::BZ, 0, off)
}

pub fn bnz(off: i16) -> [u8; INSN_LEN] {
    imm16(opcode::BNZ, 0, off)
}

pub fn call(off: i16) -> [u8; INSN_LEN] {
    imm16(opcode::CALL, 0, off)
}

pub fn callr(rs: RegId) -> [u8; INSN_LEN] {
    [opcode::CALLR, r(rs), 0, 0]
}

pub fn jr(rs: RegId) -> [u8; INSN_LEN] {
    [opcode::JR, r(rs), 0, 0]
}

pub fn ret() -> [u8; INSN_LEN] {
    [opcode::RET, 0, 0, 0]
}

pub fn syscall() -> [u8; INSN_LEN] {
    [opcode::SYSCALL, 0, 0, 0]
}

pub fn isync() -> [u8; INSN_LEN] {
    [opcode::ISYNC, 0, 0, 0]
}

/// Concatenate encoded instructions into a code image.
pub fn assemble(insns: &[[u8; INSN_LEN]]) -> Vec<u8> {
    insns.concat()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::{decode, Insn};

    #[test]
    fn encodings_decode_back() {
        assert_eq!(
            decode(movi(R3, -2)),
            Some(Insn::Movi {
                rd: R3,
                imm: 0xffff_fffe
            })
        );
        assert_eq!(decode(bnz(-8)), Some(Insn::Bnz { off: (-8i32) as u32 }));
        assert_eq!(decode(movw(R1, 0xbeef)), Some(Insn::Movw { rd: R1, imm: 0xbeef }));
        assert_eq!(decode(stw(R2, R5, -4)).map(|i| i.is_control_transfer()), Some(false));
    }
}
