//! Instruction set definition and decoder.
//!
//! Every instruction is four bytes, `[opcode, a, b, c]`. Sixteen-bit immediates and branch offsets
//! are little-endian in `b | c << 8`; branch offsets are relative to the branch itself.

use cinder_dbt::{GuestAddr, RegClass, RegId, RegisterDesc, Width};

pub const INSN_LEN: usize = 4;

pub const GPR_COUNT: u8 = 8;
/// Link register written by `call` and read by `ret`.
pub const LINK: RegId = RegId(7);
pub const FLAGS: RegId = RegId(8);

pub const FLAG_Z: u32 = 1 << 0;
pub const FLAG_N: u32 = 1 << 1;

pub const MASK32: u64 = 0xffff_ffff;

/// `r0..r7` plus `flags`.
pub const REG_COUNT: usize = 9;

pub static REGISTERS: [RegisterDesc; REG_COUNT] = [
    RegisterDesc::new("r0", RegClass::General, Width::W32),
    RegisterDesc::new("r1", RegClass::General, Width::W32),
    RegisterDesc::new("r2", RegClass::General, Width::W32),
    RegisterDesc::new("r3", RegClass::General, Width::W32),
    RegisterDesc::new("r4", RegClass::General, Width::W32),
    RegisterDesc::new("r5", RegClass::General, Width::W32),
    RegisterDesc::new("r6", RegClass::General, Width::W32),
    RegisterDesc::new("r7", RegClass::Special, Width::W32),
    RegisterDesc::new("flags", RegClass::Flags, Width::W32),
];

pub mod opcode {
    pub const NOP: u8 = 0x00;
    pub const MOVI: u8 = 0x01;
    pub const MOV: u8 = 0x02;
    pub const ADD: u8 = 0x03;
    pub const ADDI: u8 = 0x04;
    pub const SUB: u8 = 0x05;
    pub const MOVW: u8 = 0x06;
    pub const MOVB: u8 = 0x07;
    pub const LDW: u8 = 0x08;
    pub const STW: u8 = 0x09;
    pub const B: u8 = 0x0a;
    pub const BZ: u8 = 0x0b;
    pub const BNZ: u8 = 0x0c;
    pub const CALL: u8 = 0x0d;
    pub const JR: u8 = 0x0e;
    pub const RET: u8 = 0x0f;
    pub const SYSCALL: u8 = 0x10;
    pub const ADDW: u8 = 0x12;
    pub const CMPI: u8 = 0x13;
    pub const CALLR: u8 = 0x14;
    pub const ISYNC: u8 = 0x15;
}

/// A decoded instruction. Register operands are guaranteed to name a general-purpose register;
/// immediates are already sign-extended to 32 bits where the encoding says so.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Insn {
    Nop,
    Movi { rd: RegId, imm: u32 },
    Mov { rd: RegId, rs: RegId },
    Add { rd: RegId, rs: RegId, rt: RegId },
    Addi { rd: RegId, rs: RegId, imm: u32 },
    Sub { rd: RegId, rs: RegId, rt: RegId },
    /// Write the low 16 bits of `rd`.
    Movw { rd: RegId, imm: u16 },
    /// Write the low 8 bits of `rd`.
    Movb { rd: RegId, imm: u8 },
    /// 16-bit add of the low halves; the high half of `rd` is preserved. Flags are unchanged.
    Addw { rd: RegId, rs: RegId },
    /// Set flags from `rs - imm`.
    Cmpi { rs: RegId, imm: u32 },
    Ldw { rd: RegId, base: RegId, off: u32 },
    Stw { rs: RegId, base: RegId, off: u32 },
    B { off: u32 },
    Bz { off: u32 },
    Bnz { off: u32 },
    Call { off: u32 },
    /// Call the address held in `rs`.
    Callr { rs: RegId },
    Jr { rs: RegId },
    Ret,
    Syscall,
    /// Instruction barrier: code after it may have changed, so translation must not continue
    /// past it.
    Isync,
}

impl Insn {
    /// Absolute target of a pc-relative branch at `pc`.
    pub fn branch_target(pc: GuestAddr, off: u32) -> GuestAddr {
        pc.wrapping_add(u64::from(off)) & MASK32
    }

    pub fn fallthrough(pc: GuestAddr) -> GuestAddr {
        pc.wrapping_add(INSN_LEN as u64) & MASK32
    }

    /// Whether control can continue anywhere other than the next instruction.
    pub fn is_control_transfer(&self) -> bool {
        matches!(
            self,
            Insn::B { .. }
                | Insn::Bz { .. }
                | Insn::Bnz { .. }
                | Insn::Call { .. }
                | Insn::Callr { .. }
                | Insn::Jr { .. }
                | Insn::Ret
        )
    }
}

fn gpr(byte: u8) -> Option<RegId> {
    (byte < GPR_COUNT).then_some(RegId(u16::from(byte)))
}

fn sext8(v: u8) -> u32 {
    v as i8 as i32 as u32
}

fn sext16(v: u16) -> u32 {
    v as i16 as i32 as u32
}

/// Decode one instruction. `None` for unknown opcodes and out-of-range register fields.
pub fn decode(bytes: [u8; INSN_LEN]) -> Option<Insn> {
    let [op, a, b, c] = bytes;
    let imm16 = u16::from_le_bytes([b, c]);
    let insn = match op {
        opcode::NOP => Insn::Nop,
        opcode::MOVI => Insn::Movi {
            rd: gpr(a)?,
            imm: sext16(imm16),
        },
        opcode::MOV => Insn::Mov {
            rd: gpr(a)?,
            rs: gpr(b)?,
        },
        opcode::ADD => Insn::Add {
            rd: gpr(a)?,
            rs: gpr(b)?,
            rt: gpr(c)?,
        },
        opcode::ADDI => Insn::Addi {
            rd: gpr(a)?,
            rs: gpr(b)?,
            imm: sext8(c),
        },
        opcode::SUB => Insn::Sub {
            rd: gpr(a)?,
            rs: gpr(b)?,
            rt: gpr(c)?,
        },
        opcode::MOVW => Insn::Movw {
            rd: gpr(a)?,
            imm: imm16,
        },
        opcode::MOVB => Insn::Movb { rd: gpr(a)?, imm: b },
        opcode::LDW => Insn::Ldw {
            rd: gpr(a)?,
            base: gpr(b)?,
            off: sext8(c),
        },
        opcode::STW => Insn::Stw {
            rs: gpr(a)?,
            base: gpr(b)?,
            off: sext8(c),
        },
        opcode::B => Insn::B { off: sext16(imm16) },
        opcode::BZ => Insn::Bz { off: sext16(imm16) },
        opcode::BNZ => Insn::Bnz { off: sext16(imm16) },
        opcode::CALL => Insn::Call { off: sext16(imm16) },
        opcode::CALLR => Insn::Callr { rs: gpr(a)? },
        opcode::JR => Insn::Jr { rs: gpr(a)? },
        opcode::RET => Insn::Ret,
        opcode::SYSCALL => Insn::Syscall,
        opcode::ISYNC => Insn::Isync,
        opcode::ADDW => Insn::Addw {
            rd: gpr(a)?,
            rs: gpr(b)?,
        },
        opcode::CMPI => Insn::Cmpi {
            rs: gpr(a)?,
            imm: sext8(b),
        },
        _ => return None,
    };
    Some(insn)
}

/// Flags produced by a 32-bit result.
pub fn flags_for(result: u32) -> u32 {
    let mut flags = 0;
    if result == 0 {
        flags |= FLAG_Z;
    }
    if result & 0x8000_0000 != 0 {
        flags |= FLAG_N;
    }
    flags
}
