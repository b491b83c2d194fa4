//! Translation of reference-ISA instructions into trace IR.
//!
//! Flag-setting instructions do not compute `flags` inline. They park their 32-bit result in a
//! trace-wide scratch variable and defer the flags register; [`RefIsa::materialize`] derives the
//! flags from that result only when a conditional branch or a trace exit needs them.

use std::sync::atomic::{AtomicUsize, Ordering};

use cinder_dbt::ir::{BinOp, CmpOp, Instr, MemSize, Operand, Var};
use cinder_dbt::{GuestAddr, GuestArchitecture, LazyState, RegId, RegisterDesc, TraceEmitter, Width};
use tracing::debug;

use crate::isa::{decode, Insn, FLAGS, FLAG_N, INSN_LEN, LINK, MASK32, REGISTERS};

/// Scratch slot holding the result the deferred flags are derived from.
const FLAG_SOURCE: u32 = 0;

#[derive(Debug, Default)]
pub struct RefIsa {
    decoded: AtomicUsize,
}

impl RefIsa {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instructions translated so far, across all traces built with this architecture.
    pub fn decode_count(&self) -> usize {
        self.decoded.load(Ordering::Relaxed)
    }
}

fn imm(v: u64) -> Operand {
    Operand::Imm(v)
}

fn var(v: Var) -> Operand {
    Operand::Var(v)
}

/// `(lhs op rhs) & 0xffff_ffff`.
fn alu32(tx: &mut TraceEmitter<'_>, op: BinOp, lhs: Operand, rhs: Operand) -> Var {
    let raw = tx.bin(op, lhs, rhs);
    tx.bin(BinOp::And, var(raw), imm(MASK32))
}

/// Record `result` as the source of the flags and leave them deferred.
fn set_flags_lazily(tx: &mut TraceEmitter<'_>, lazy: &mut LazyState, result: Var) {
    let source = tx.scratch(FLAG_SOURCE);
    tx.mov(source, var(result));
    tx.defer(FLAGS, lazy);
}

fn read32(tx: &mut TraceEmitter<'_>, lazy: &mut LazyState, reg: RegId) -> Var {
    tx.read_reg(reg, Width::W32, lazy)
}

fn effective_address(tx: &mut TraceEmitter<'_>, lazy: &mut LazyState, base: RegId, off: u32) -> Var {
    let base = read32(tx, lazy, base);
    alu32(tx, BinOp::Add, var(base), imm(u64::from(off)))
}

impl GuestArchitecture for RefIsa {
    fn name(&self) -> &'static str {
        "refisa"
    }

    fn registers(&self) -> &[RegisterDesc] {
        &REGISTERS
    }

    fn max_instruction_len(&self) -> usize {
        INSN_LEN
    }

    fn translate(
        &self,
        tx: &mut TraceEmitter<'_>,
        lazy: &mut LazyState,
        pc: GuestAddr,
    ) -> Option<GuestAddr> {
        self.decoded.fetch_add(1, Ordering::Relaxed);

        let mut bytes = [0u8; INSN_LEN];
        let insn = match tx.code().fetch(pc, &mut bytes) {
            INSN_LEN => decode(bytes),
            _ => None,
        };
        let Some(insn) = insn else {
            debug!(target: "cinder_refisa::translate", "undecodable instruction at {pc:#x}");
            tx.bad_instruction(lazy);
            return None;
        };

        let next = Insn::fallthrough(pc);
        match insn {
            Insn::Nop => {}
            Insn::Movi { rd, imm: value } => {
                tx.set_reg(rd, Width::W32, imm(u64::from(value)), lazy);
            }
            Insn::Mov { rd, rs } => {
                let v = read32(tx, lazy, rs);
                tx.set_reg(rd, Width::W32, var(v), lazy);
            }
            Insn::Add { rd, rs, rt } | Insn::Sub { rd, rs, rt } => {
                let op = if matches!(insn, Insn::Add { .. }) {
                    BinOp::Add
                } else {
                    BinOp::Sub
                };
                let a = read32(tx, lazy, rs);
                let b = read32(tx, lazy, rt);
                let r = alu32(tx, op, var(a), var(b));
                tx.set_reg(rd, Width::W32, var(r), lazy);
                set_flags_lazily(tx, lazy, r);
            }
            Insn::Addi { rd, rs, imm: value } => {
                let a = read32(tx, lazy, rs);
                let r = alu32(tx, BinOp::Add, var(a), imm(u64::from(value)));
                tx.set_reg(rd, Width::W32, var(r), lazy);
                set_flags_lazily(tx, lazy, r);
            }
            Insn::Cmpi { rs, imm: value } => {
                let a = read32(tx, lazy, rs);
                let r = alu32(tx, BinOp::Sub, var(a), imm(u64::from(value)));
                set_flags_lazily(tx, lazy, r);
            }
            Insn::Movw { rd, imm: value } => {
                tx.set_reg(rd, Width::W16, imm(u64::from(value)), lazy);
            }
            Insn::Movb { rd, imm: value } => {
                tx.set_reg(rd, Width::W8, imm(u64::from(value)), lazy);
            }
            Insn::Addw { rd, rs } => {
                let a = tx.read_reg(rd, Width::W16, lazy);
                let b = tx.read_reg(rs, Width::W16, lazy);
                let sum = tx.bin(BinOp::Add, var(a), var(b));
                let low = tx.bin(BinOp::And, var(sum), imm(Width::W16.mask()));
                tx.set_reg(rd, Width::W16, var(low), lazy);
            }
            Insn::Ldw { rd, base, off } => {
                let addr = effective_address(tx, lazy, base, off);
                let loaded = tx.load(var(addr), MemSize::U32, lazy);
                tx.set_reg(rd, Width::W32, var(loaded), lazy);
            }
            Insn::Stw { rs, base, off } => {
                let addr = effective_address(tx, lazy, base, off);
                let value = read32(tx, lazy, rs);
                tx.store(var(addr), var(value), MemSize::U32, lazy);
            }
            Insn::B { off } => {
                tx.branch(Insn::branch_target(pc, off), lazy);
                return None;
            }
            Insn::Bz { off } => {
                let flags = read32(tx, lazy, FLAGS);
                let z = tx.bin(BinOp::And, var(flags), imm(1));
                tx.conditional_branch(var(z), Insn::branch_target(pc, off), lazy);
            }
            Insn::Bnz { off } => {
                let flags = read32(tx, lazy, FLAGS);
                let z = tx.bin(BinOp::And, var(flags), imm(1));
                let clear = tx.cmp(CmpOp::Eq, var(z), imm(0));
                tx.conditional_branch(var(clear), Insn::branch_target(pc, off), lazy);
            }
            Insn::Call { off } => {
                tx.set_reg(LINK, Width::W32, imm(next), lazy);
                tx.call(Insn::branch_target(pc, off), next, lazy);
                return None;
            }
            Insn::Callr { rs } => {
                // `rs` may be the link register itself.
                let target = tx.new_var();
                let live = read32(tx, lazy, rs);
                tx.mov(target, var(live));
                tx.set_reg(LINK, Width::W32, imm(next), lazy);
                tx.indirect_call(var(target), next, lazy);
                return None;
            }
            Insn::Jr { rs } => {
                let target = read32(tx, lazy, rs);
                tx.indirect_jump(var(target), lazy);
                return None;
            }
            Insn::Ret => {
                let target = read32(tx, lazy, LINK);
                tx.return_via(var(target), lazy);
                return None;
            }
            Insn::Syscall => tx.system_call(next, lazy),
            Insn::Isync => {
                tx.exit_to(next, lazy);
                return None;
            }
        }
        Some(next)
    }

    /// `flags = (result == 0) | (result < 0 ? FLAG_N : 0)`.
    fn materialize(&self, tx: &mut TraceEmitter<'_>, reg: RegId, lazy: &mut LazyState) {
        assert_eq!(reg, FLAGS, "refisa only defers the flags register");
        let source = tx.scratch(FLAG_SOURCE);
        let z = tx.cmp(CmpOp::Eq, var(source), imm(0));
        let sign = tx.bin(BinOp::And, var(source), imm(0x8000_0000));
        let n = tx.new_var();
        tx.emit(Instr::Select {
            dst: n,
            cond: var(sign),
            if_true: imm(u64::from(FLAG_N)),
            if_false: imm(0),
        });
        let flags = tx.materialized_var(reg, lazy);
        tx.emit(Instr::Bin {
            dst: flags,
            op: BinOp::Or,
            lhs: var(z),
            rhs: var(n),
        });
    }
}
