//! Host code generation seam and the guest process contract seen by generated code.
//!
//! A real backend would lower a [`BuiltTrace`] to machine code. [`IrEvaluator`] is the reference
//! backend: it keeps the block graph and walks it against the process state, which is enough to
//! check translated code against an interpreter and to run guest programs end to end.

use std::fmt;
use std::sync::Arc;

use crate::arch::{CodeSource, GuestAddr, RegId};
use crate::builder::BuiltTrace;
use crate::error::{CodegenError, GuestFault};
use crate::ir::{BinOp, BlockGraph, CmpOp, Instr, MemSize, Operand, Terminator, Var};
use crate::profile::{BranchKind, BranchTargetProfile};

/// Persistent guest state that translated code and interpreters operate on.
pub trait ProcessState: CodeSource {
    fn pc(&self) -> GuestAddr;

    fn set_pc(&mut self, pc: GuestAddr);

    /// The guest program has exited; controllers stop running it.
    fn finished(&self) -> bool;

    fn read_reg(&self, reg: RegId) -> u64;

    fn write_reg(&mut self, reg: RegId, value: u64);

    fn load(&self, addr: GuestAddr, size: MemSize) -> Result<u64, GuestFault>;

    fn store(&mut self, addr: GuestAddr, value: u64, size: MemSize) -> Result<(), GuestFault>;

    /// Perform the guest system call described by the current register state.
    fn system_call(&mut self);
}

/// How control left a compiled trace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TraceExit {
    /// Continue at the given pc (already stored in the process state).
    Continue(GuestAddr),
    Fault(GuestFault),
}

/// Executable form of one trace.
pub trait HostCode: Send + Sync + fmt::Debug {
    fn invoke(&self, state: &mut dyn ProcessState) -> TraceExit;
}

#[derive(Clone, Debug)]
pub struct GeneratedCode {
    pub code: Arc<dyn HostCode>,
    /// Size of the generated code in host instructions; feeds the inlining size threshold.
    pub host_size_hint: usize,
}

pub trait HostCodeGenerator: Send + Sync {
    fn generate(&self, trace: &BuiltTrace) -> Result<GeneratedCode, CodegenError>;
}

/// Reference backend that evaluates the block graph directly.
#[derive(Clone, Default)]
pub struct IrEvaluator {
    profile: Option<Arc<dyn BranchTargetProfile>>,
}

impl IrEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed `RecordBranch` instructions into `profile`.
    pub fn with_profile(profile: Arc<dyn BranchTargetProfile>) -> Self {
        Self {
            profile: Some(profile),
        }
    }
}

impl HostCodeGenerator for IrEvaluator {
    fn generate(&self, trace: &BuiltTrace) -> Result<GeneratedCode, CodegenError> {
        trace
            .graph
            .validate()
            .map_err(|block| CodegenError::Rejected {
                entry: trace.entry_pc,
                reason: format!("block {} is unterminated or has an unresolved edge", block.0),
            })?;
        Ok(GeneratedCode {
            host_size_hint: trace.graph.instr_count(),
            code: Arc::new(EvaluatedTrace {
                entry_pc: trace.entry_pc,
                graph: trace.graph.clone(),
                profile: self.profile.clone(),
            }),
        })
    }
}

struct EvaluatedTrace {
    entry_pc: GuestAddr,
    graph: BlockGraph,
    profile: Option<Arc<dyn BranchTargetProfile>>,
}

impl fmt::Debug for EvaluatedTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvaluatedTrace")
            .field("entry_pc", &format_args!("{:#x}", self.entry_pc))
            .field("blocks", &self.graph.layout().len())
            .finish_non_exhaustive()
    }
}

impl HostCode for EvaluatedTrace {
    /// A guarded memory access that faults leaves through its fault stub with exact state. An
    /// unguarded one leaves on the spot, with registers as of the last spill and the pc at the
    /// trace entry.
    fn invoke(&self, state: &mut dyn ProcessState) -> TraceExit {
        let mut vars = vec![0u64; self.graph.var_count() as usize];
        let mut block = self.graph.entry();
        loop {
            let b = self.graph.block(block);
            for instr in &b.instrs {
                match self.step(instr, state, &mut vars) {
                    Ok(None) => {}
                    Ok(Some(exit)) => return exit,
                    Err(fault) => return TraceExit::Fault(fault),
                }
            }
            let term = b
                .term
                .as_ref()
                .expect("validated trace has a terminator on every block");
            block = match term {
                Terminator::Jump(target) => *target,
                Terminator::Branch {
                    cond,
                    taken,
                    not_taken,
                } => {
                    if eval(*cond, &vars) != 0 {
                        *taken
                    } else {
                        *not_taken
                    }
                }
                Terminator::Switch {
                    value,
                    cases,
                    default,
                } => {
                    let v = eval(*value, &vars);
                    cases
                        .iter()
                        .find(|(addr, _)| *addr == v)
                        .map_or(*default, |(_, target)| *target)
                }
                Terminator::Return { next_pc } => {
                    let pc = vars[next_pc.index()];
                    state.set_pc(pc);
                    return TraceExit::Continue(pc);
                }
                Terminator::Fault { pc, bytes } => {
                    state.set_pc(*pc);
                    return TraceExit::Fault(GuestFault::bad_instruction(*pc, bytes));
                }
                Terminator::MemoryFault { pc, addr } => {
                    state.set_pc(*pc);
                    let addr = eval(*addr, &vars);
                    return TraceExit::Fault(GuestFault::MemoryFault { addr });
                }
            };
        }
    }
}

impl EvaluatedTrace {
    fn step(
        &self,
        instr: &Instr,
        state: &mut dyn ProcessState,
        vars: &mut [u64],
    ) -> Result<Option<TraceExit>, GuestFault> {
        match instr {
            Instr::Fill { dst, reg } => set(vars, *dst, state.read_reg(*reg)),
            Instr::Spill { reg, src } => state.write_reg(*reg, vars[src.index()]),
            Instr::Mov { dst, src } => set(vars, *dst, eval(*src, vars)),
            Instr::Bin { dst, op, lhs, rhs } => {
                let r = bin(*op, eval(*lhs, vars), eval(*rhs, vars));
                set(vars, *dst, r);
            }
            Instr::Cmp { dst, op, lhs, rhs } => {
                let r = cmp(*op, eval(*lhs, vars), eval(*rhs, vars));
                set(vars, *dst, r as u64);
            }
            Instr::Select {
                dst,
                cond,
                if_true,
                if_false,
            } => {
                let v = if eval(*cond, vars) != 0 {
                    eval(*if_true, vars)
                } else {
                    eval(*if_false, vars)
                };
                set(vars, *dst, v);
            }
            Instr::Load {
                dst,
                addr,
                size,
                faulted,
            } => {
                let result = state.load(eval(*addr, vars), *size);
                if let Some(v) = guard(result, *faulted, vars)? {
                    set(vars, *dst, v);
                }
            }
            Instr::Store {
                addr,
                value,
                size,
                faulted,
            } => {
                let result = state.store(eval(*addr, vars), eval(*value, vars), *size);
                guard(result, *faulted, vars)?;
            }
            Instr::SysCall { resume_pc } => {
                state.system_call();
                if state.finished() {
                    state.set_pc(*resume_pc);
                    return Ok(Some(TraceExit::Continue(*resume_pc)));
                }
            }
            Instr::RecordBranch {
                site,
                target,
                kind,
                return_pc,
            } => {
                if let Some(profile) = &self.profile {
                    let target = eval(*target, vars);
                    match (kind, return_pc) {
                        (BranchKind::Call, Some(ret)) => {
                            profile.register_call_site(*site, *ret, target)
                        }
                        (BranchKind::Return, _) => profile.register_return_site(*site, target),
                        _ => profile.profile_branch(*site, target),
                    }
                }
            }
        }
        Ok(None)
    }
}

/// Route a memory access result: a guarded access records whether it faulted, an unguarded one
/// propagates the fault.
fn guard<T>(
    result: Result<T, GuestFault>,
    faulted: Option<Var>,
    vars: &mut [u64],
) -> Result<Option<T>, GuestFault> {
    match (result, faulted) {
        (Ok(v), Some(flag)) => {
            set(vars, flag, 0);
            Ok(Some(v))
        }
        (Ok(v), None) => Ok(Some(v)),
        (Err(_), Some(flag)) => {
            set(vars, flag, 1);
            Ok(None)
        }
        (Err(fault), None) => Err(fault),
    }
}

#[inline]
fn set(vars: &mut [u64], dst: Var, value: u64) {
    vars[dst.index()] = value;
}

#[inline]
fn eval(op: Operand, vars: &[u64]) -> u64 {
    match op {
        Operand::Imm(v) => v,
        Operand::Var(v) => vars[v.index()],
    }
}

fn bin(op: BinOp, a: u64, b: u64) -> u64 {
    let shift = (b & 63) as u32;
    match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::And => a & b,
        BinOp::Or => a | b,
        BinOp::Xor => a ^ b,
        BinOp::Shl => a.wrapping_shl(shift),
        BinOp::ShrU => a.wrapping_shr(shift),
        BinOp::ShrS => ((a as i64).wrapping_shr(shift)) as u64,
    }
}

fn cmp(op: CmpOp, a: u64, b: u64) -> bool {
    let (sa, sb) = (a as i64, b as i64);
    match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        CmpOp::LtS => sa < sb,
        CmpOp::LtU => a < b,
        CmpOp::LeS => sa <= sb,
        CmpOp::LeU => a <= b,
        CmpOp::GtS => sa > sb,
        CmpOp::GtU => a > b,
        CmpOp::GeS => sa >= sb,
        CmpOp::GeU => a >= b,
    }
}
