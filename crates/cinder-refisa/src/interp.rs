//! Direct interpreter for the reference ISA. Flags are computed eagerly.

use cinder_dbt::exec::{DecodedInsn, Interpreter};
use cinder_dbt::{BranchKind, CodeSource, GuestAddr, GuestFault, ProcessState, RegId};

use crate::isa::{decode, flags_for, Insn, FLAGS, FLAG_Z, INSN_LEN, LINK, MASK32};
use crate::machine::RefMachine;

#[derive(Clone, Copy, Debug, Default)]
pub struct RefInterpreter;

impl Interpreter<RefMachine> for RefInterpreter {
    type Insn = Insn;

    fn decode(&self, state: &RefMachine, pc: GuestAddr) -> Result<Insn, GuestFault> {
        let mut bytes = [0u8; INSN_LEN];
        let n = state.fetch(pc, &mut bytes);
        if n < INSN_LEN {
            return Err(GuestFault::bad_instruction(pc, &bytes[..n]));
        }
        decode(bytes).ok_or_else(|| GuestFault::bad_instruction(pc, &bytes))
    }
}

fn r(m: &RefMachine, reg: RegId) -> u64 {
    u64::from(m.reg(reg))
}

fn alu(m: &mut RefMachine, rd: Option<RegId>, result: u64) {
    let result = (result & MASK32) as u32;
    if let Some(rd) = rd {
        m.set_reg(rd, result);
    }
    m.set_reg(FLAGS, flags_for(result));
}

impl DecodedInsn<RefMachine> for Insn {
    fn execute(&self, m: &mut RefMachine) -> Result<(), GuestFault> {
        let pc = m.pc();
        let mut next = Insn::fallthrough(pc);
        match *self {
            Insn::Nop => {}
            Insn::Movi { rd, imm } => m.set_reg(rd, imm),
            Insn::Mov { rd, rs } => m.set_reg(rd, m.reg(rs)),
            Insn::Add { rd, rs, rt } => {
                let v = r(m, rs).wrapping_add(r(m, rt));
                alu(m, Some(rd), v);
            }
            Insn::Sub { rd, rs, rt } => {
                let v = r(m, rs).wrapping_sub(r(m, rt));
                alu(m, Some(rd), v);
            }
            Insn::Addi { rd, rs, imm } => {
                let v = r(m, rs).wrapping_add(u64::from(imm));
                alu(m, Some(rd), v);
            }
            Insn::Cmpi { rs, imm } => {
                let v = r(m, rs).wrapping_sub(u64::from(imm));
                alu(m, None, v);
            }
            Insn::Movw { rd, imm } => m.set_reg(rd, (m.reg(rd) & !0xffff) | u32::from(imm)),
            Insn::Movb { rd, imm } => m.set_reg(rd, (m.reg(rd) & !0xff) | u32::from(imm)),
            Insn::Addw { rd, rs } => {
                let low = (m.reg(rd) as u16).wrapping_add(m.reg(rs) as u16);
                m.set_reg(rd, (m.reg(rd) & !0xffff) | u32::from(low));
            }
            Insn::Ldw { rd, base, off } => {
                let addr = r(m, base).wrapping_add(u64::from(off)) & MASK32;
                let value = m.load_u32(addr)?;
                m.set_reg(rd, value);
            }
            Insn::Stw { rs, base, off } => {
                let addr = r(m, base).wrapping_add(u64::from(off)) & MASK32;
                m.store_u32(addr, m.reg(rs))?;
            }
            Insn::B { off } => next = Insn::branch_target(pc, off),
            Insn::Bz { off } => {
                if m.flags() & FLAG_Z != 0 {
                    next = Insn::branch_target(pc, off);
                }
            }
            Insn::Bnz { off } => {
                if m.flags() & FLAG_Z == 0 {
                    next = Insn::branch_target(pc, off);
                }
            }
            Insn::Call { off } => {
                m.set_reg(LINK, next as u32);
                next = Insn::branch_target(pc, off);
            }
            Insn::Callr { rs } => {
                let target = r(m, rs);
                m.set_reg(LINK, next as u32);
                next = target;
            }
            Insn::Jr { rs } => next = r(m, rs),
            Insn::Ret => next = r(m, LINK),
            Insn::Syscall => m.system_call(),
            Insn::Isync => {}
        }
        m.set_pc(next);
        Ok(())
    }

    fn successor(&self, pc: GuestAddr) -> Option<GuestAddr> {
        (!self.is_control_transfer() && *self != Insn::Isync).then(|| Insn::fallthrough(pc))
    }

    fn branch_kind(&self) -> Option<BranchKind> {
        match self {
            Insn::Callr { .. } => Some(BranchKind::Call),
            Insn::Jr { .. } => Some(BranchKind::DynamicIndirect),
            Insn::Ret => Some(BranchKind::Return),
            _ => None,
        }
    }

    fn return_pc(&self, pc: GuestAddr) -> Option<GuestAddr> {
        matches!(self, Insn::Call { .. } | Insn::Callr { .. }).then(|| Insn::fallthrough(pc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::{self, assemble, R1, R2};

    fn run(image: &[u8], steps: usize) -> RefMachine {
        let mut m = RefMachine::with_image(256, 0, image).unwrap();
        for _ in 0..steps {
            let insn = RefInterpreter.decode(&m, m.pc()).unwrap();
            insn.execute(&mut m).unwrap();
        }
        m
    }

    #[test]
    fn narrow_writes_preserve_high_bits() {
        let image = assemble(&[
            asm::movi(R1, -1),
            asm::movw(R1, 0x1234),
            asm::movb(R1, 0x56),
            asm::movi(R2, 0x7fff),
            asm::addw(R1, R2),
        ]);
        let m = run(&image, 5);
        assert_eq!(m.reg(R1), 0xffff_9255);
    }

    #[test]
    fn compare_sets_flags_without_writing() {
        let image = assemble(&[asm::movi(R1, 3), asm::cmpi(R1, 3), asm::bz(8)]);
        let m = run(&image, 3);
        assert_eq!(m.reg(R1), 3);
        assert_eq!(m.flags(), FLAG_Z);
        assert_eq!(m.pc(), 16);
    }

    #[test]
    fn call_links_and_ret_returns() {
        let image = assemble(&[asm::call(8), asm::nop(), asm::ret()]);
        let m = run(&image, 2);
        assert_eq!(m.reg(LINK), 4);
        assert_eq!(m.pc(), 4);
    }

    #[test]
    fn undecodable_bytes_fault_with_their_encoding() {
        let m = RefMachine::with_image(8, 0, &[0x11, 1, 2, 3]).unwrap();
        assert_eq!(
            RefInterpreter.decode(&m, 0).unwrap_err(),
            GuestFault::bad_instruction(0, &[0x11, 1, 2, 3])
        );
        assert_eq!(
            RefInterpreter.decode(&m, 6).unwrap_err(),
            GuestFault::bad_instruction(6, &[0, 0])
        );
    }

    #[test]
    fn indirect_transfers_are_profiled_kinds() {
        assert_eq!(
            Insn::Jr { rs: RegId(1) }.branch_kind(),
            Some(BranchKind::DynamicIndirect)
        );
        assert_eq!(Insn::Ret.branch_kind(), Some(BranchKind::Return));
        assert_eq!(Insn::B { off: 4 }.branch_kind(), None);
        assert_eq!(Insn::Nop.successor(8), Some(12));
        assert_eq!(Insn::Ret.successor(8), None);
        assert_eq!(
            Insn::Callr { rs: RegId(2) }.branch_kind(),
            Some(BranchKind::Call)
        );
        assert_eq!(Insn::Isync.successor(8), None);
        assert_eq!(Insn::Callr { rs: RegId(2) }.return_pc(8), Some(12));
        assert_eq!(Insn::Jr { rs: RegId(2) }.return_pc(8), None);
    }

    #[test]
    fn callr_through_link_jumps_to_the_old_value() {
        let image = assemble(&[asm::movi(LINK, 12), asm::callr(LINK), asm::nop(), asm::nop()]);
        let m = run(&image, 2);
        assert_eq!(m.pc(), 12);
        assert_eq!(m.reg(LINK), 8);
    }
}
