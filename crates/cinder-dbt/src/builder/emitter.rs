//! Decoder-facing half of the trace builder.
//!
//! A [`GuestArchitecture`] translates one instruction at a time by calling into a [`TraceEmitter`]:
//! it reads and writes guest registers through the register file adapter, emits host IR into the
//! current block, and reports control transfers. Control transfers are recorded as unresolved
//! branches and bound to blocks only after the current path has been decoded.

use std::collections::{HashMap, VecDeque};

use tracing::trace;

use crate::arch::{CodeSource, GuestAddr, GuestArchitecture, RegId, Width};
use crate::cache::CodeCache;
use crate::config::TranslatorConfig;
use crate::ir::{
    BinOp, BlockGraph, BlockId, BranchSlot, CmpOp, Instr, MemSize, Operand, Terminator, Var,
};
use crate::lazy::{LazyKey, LazyState, Validity};
use crate::profile::{BranchKind, BranchTargetProfile};
use crate::regfile::{RegisterFile, SpillMode};

use super::BuildStats;

/// Where an unresolved branch will be bound once its destination block is known.
#[derive(Clone, Debug)]
pub(super) enum Placeholder {
    /// Statically known target; patch the given edge of `block`'s terminator.
    Edge {
        block: BlockId,
        slot: BranchSlot,
        target: GuestAddr,
    },
    /// Target computed at run time; `block` is empty and receives the dispatch code.
    Dispatch { block: BlockId, value: Operand },
}

#[derive(Clone, Debug)]
pub(super) struct UnresolvedBranch {
    pub(super) site: GuestAddr,
    pub(super) kind: BranchKind,
    /// Address a call returns to.
    pub(super) return_pc: Option<GuestAddr>,
    /// Lazy state at the branch site. The destination block is looked up under this state.
    pub(super) lazy: LazyState,
    pub(super) depth: u32,
    pub(super) at: Placeholder,
}

pub struct TraceEmitter<'a> {
    pub(super) arch: &'a dyn GuestArchitecture,
    pub(super) code: &'a dyn CodeSource,
    pub(super) profile: &'a dyn BranchTargetProfile,
    pub(super) cache: Option<&'a CodeCache>,
    pub(super) config: &'a TranslatorConfig,
    pub(super) graph: BlockGraph,
    pub(super) regs: RegisterFile,
    pub(super) current: BlockId,
    pub(super) current_pc: GuestAddr,
    /// Last block created; new blocks are laid out after it, ahead of the finish block.
    pub(super) tail: BlockId,
    pub(super) finish: BlockId,
    pub(super) next_pc: Var,
    pub(super) block_map: HashMap<LazyKey, BlockId>,
    pub(super) direct_queue: VecDeque<UnresolvedBranch>,
    pub(super) dynamic_queue: VecDeque<UnresolvedBranch>,
    pub(super) scratch: HashMap<u32, Var>,
    pub(super) depth: u32,
    pub(super) instruction_count: usize,
    pub(super) stop_requested: bool,
    pub(super) stats: BuildStats,
}

impl<'a> TraceEmitter<'a> {
    /// Guest code being translated.
    pub fn code(&self) -> &'a dyn CodeSource {
        self.code
    }

    /// Address of the instruction being translated.
    pub fn pc(&self) -> GuestAddr {
        self.current_pc
    }

    pub fn new_var(&mut self) -> Var {
        self.graph.new_var()
    }

    /// A host variable that is the same for the whole trace under a given `slot` number.
    ///
    /// Architectures keep deferred inputs in scratch variables (for instance the last arithmetic
    /// result that flags are derived from) so that every block of the trace sees the same variable.
    pub fn scratch(&mut self, slot: u32) -> Var {
        if let Some(v) = self.scratch.get(&slot) {
            return *v;
        }
        let v = self.graph.new_var();
        self.scratch.insert(slot, v);
        v
    }

    pub fn emit(&mut self, instr: Instr) {
        self.graph.push_instr(self.current, instr);
    }

    pub fn mov(&mut self, dst: Var, src: Operand) {
        self.emit(Instr::Mov { dst, src });
    }

    /// `dst = lhs op rhs` into a fresh variable.
    pub fn bin(&mut self, op: BinOp, lhs: Operand, rhs: Operand) -> Var {
        let dst = self.new_var();
        self.emit(Instr::Bin { dst, op, lhs, rhs });
        dst
    }

    /// `(lhs op rhs) as u64` into a fresh variable.
    pub fn cmp(&mut self, op: CmpOp, lhs: Operand, rhs: Operand) -> Var {
        let dst = self.new_var();
        self.emit(Instr::Cmp { dst, op, lhs, rhs });
        dst
    }

    /// `size`-byte load from guest memory into a fresh variable.
    ///
    /// A faulting access leaves the trace with the registers as they were before the current
    /// instruction and the pc on it, so an instruction must not write guest registers ahead of
    /// its memory accesses.
    pub fn load(&mut self, addr: Operand, size: MemSize, lazy: &LazyState) -> Var {
        let dst = self.new_var();
        let faulted = self.new_var();
        self.emit(Instr::Load {
            dst,
            addr,
            size,
            faulted: Some(faulted),
        });
        self.guard_memory_access(faulted, addr, lazy);
        dst
    }

    /// `size`-byte store to guest memory. Faults as for [`TraceEmitter::load`].
    pub fn store(&mut self, addr: Operand, value: Operand, size: MemSize, lazy: &LazyState) {
        let faulted = self.new_var();
        self.emit(Instr::Store {
            addr,
            value,
            size,
            faulted: Some(faulted),
        });
        self.guard_memory_access(faulted, addr, lazy);
    }

    /// Split the current block on `faulted`. The faulting side resolves laziness, spills every
    /// register and raises the fault; emission continues on the other side.
    fn guard_memory_access(&mut self, faulted: Var, addr: Operand, lazy: &LazyState) {
        let block = self.current;
        let stub = self.new_block();
        let rest = self.new_block();
        self.terminate(Terminator::Branch {
            cond: Operand::Var(faulted),
            taken: stub,
            not_taken: rest,
        });

        self.current = stub;
        self.regs.begin_block();
        let mut lazy = lazy.clone();
        self.resolve_lazy(&mut lazy);
        self.regs.spill_all(&mut self.graph, stub, SpillMode::All);
        self.terminate(Terminator::MemoryFault {
            pc: self.current_pc,
            addr,
        });
        trace!(
            target: "cinder_dbt::builder",
            "memory access at {:#x} guarded from block {}",
            self.current_pc,
            block.0
        );

        self.current = rest;
        self.regs.begin_block();
    }

    /// Variable holding `width` bits of `reg`. Deferred values are materialised first.
    ///
    /// # Aliasing
    ///
    /// When `width` matches the width the register is currently held at, the returned [`Var`] is
    /// the register's live working value, not a copy. A later write to `reg` in the same trace
    /// overwrites it, so copy it with [`TraceEmitter::mov`] first if it must survive that write.
    pub fn read_reg(&mut self, reg: RegId, width: Width, lazy: &mut LazyState) -> Var {
        self.materialize_if_deferred(reg, lazy);
        self.regs.read(&mut self.graph, self.current, reg, width, lazy)
    }

    /// Variable to assign for a `width`-bit write of `reg`.
    pub fn write_reg(&mut self, reg: RegId, width: Width, lazy: &mut LazyState) -> Var {
        let narrow = self
            .arch
            .registers()
            .get(reg.index())
            .is_some_and(|desc| width < desc.width);
        if narrow {
            // The untouched high bits must be real before a narrow view can be merged into them.
            self.materialize_if_deferred(reg, lazy);
        }
        self.regs.write(&mut self.graph, self.current, reg, width, lazy)
    }

    /// `reg[width] = value`.
    pub fn set_reg(&mut self, reg: RegId, width: Width, value: Operand, lazy: &mut LazyState) {
        let dst = self.write_reg(reg, width, lazy);
        self.mov(dst, value);
    }

    /// Leave the value of `reg` deferred. The architecture's `materialize` will be asked for it
    /// when it is read or when the trace leaves.
    pub fn defer(&mut self, reg: RegId, lazy: &mut LazyState) {
        self.regs.touch(reg);
        lazy.defer(reg);
    }

    /// Working variable of `reg` for a materialiser to assign. Marks the register valid.
    pub fn materialized_var(&mut self, reg: RegId, lazy: &mut LazyState) -> Var {
        self.regs.touch(reg);
        lazy.set(reg, Validity::Full);
        self.regs.full_var(reg)
    }

    fn materialize_if_deferred(&mut self, reg: RegId, lazy: &mut LazyState) {
        if lazy.get(reg) != Validity::NotMaterialized {
            return;
        }
        let arch = self.arch;
        arch.materialize(self, reg, lazy);
        assert!(
            lazy.get(reg) != Validity::NotMaterialized,
            "{}: materialize left register {} deferred",
            arch.name(),
            reg.0
        );
        self.stats.materializations += 1;
    }

    /// Emit host code that makes every deferred or partial register real. Afterwards `lazy` is the
    /// canonical all-[`Validity::Full`] state.
    pub fn resolve_lazy(&mut self, lazy: &mut LazyState) {
        loop {
            let Some((reg, tag)) = lazy.pending().next() else {
                break;
            };
            match tag {
                Validity::NotMaterialized => self.materialize_if_deferred(reg, lazy),
                Validity::Partial(_) => {
                    self.regs
                        .resolve_register(&mut self.graph, self.current, reg, lazy)
                }
                Validity::Full => unreachable!("pending() skips resolved registers"),
            }
        }
    }

    fn terminate(&mut self, term: Terminator) {
        self.graph.set_terminator(self.current, term);
    }

    fn record(
        &mut self,
        kind: BranchKind,
        return_pc: Option<GuestAddr>,
        lazy: &LazyState,
        at: Placeholder,
    ) {
        let branch = UnresolvedBranch {
            site: self.current_pc,
            kind,
            return_pc,
            lazy: lazy.clone(),
            depth: self.depth,
            at,
        };
        trace!(
            target: "cinder_dbt::builder",
            site = branch.site,
            ?kind,
            "recorded unresolved branch"
        );
        match branch.at {
            Placeholder::Edge { .. } => self.direct_queue.push_back(branch),
            Placeholder::Dispatch { .. } => self.dynamic_queue.push_back(branch),
        }
    }

    /// Unconditional branch to a known address. Ends the instruction's control flow.
    pub fn branch(&mut self, target: GuestAddr, lazy: &LazyState) {
        let block = self.current;
        self.terminate(Terminator::Jump(BlockId::UNRESOLVED));
        self.record(
            BranchKind::Direct,
            None,
            lazy,
            Placeholder::Edge {
                block,
                slot: BranchSlot::Jump,
                target,
            },
        );
    }

    /// Branch to `target` when `cond != 0`, otherwise fall through. Emission continues in a fresh
    /// block on the fall-through path.
    pub fn conditional_branch(&mut self, cond: Operand, target: GuestAddr, lazy: &LazyState) {
        let block = self.current;
        let fallthrough = self.new_block();
        self.terminate(Terminator::Branch {
            cond,
            taken: BlockId::UNRESOLVED,
            not_taken: fallthrough,
        });
        self.record(
            BranchKind::Direct,
            None,
            lazy,
            Placeholder::Edge {
                block,
                slot: BranchSlot::Taken,
                target,
            },
        );
        self.current = fallthrough;
        self.regs.begin_block();
    }

    /// Call to a known address. The caller has already written the return address wherever the
    /// architecture keeps it.
    pub fn call(&mut self, target: GuestAddr, return_pc: GuestAddr, lazy: &LazyState) {
        self.profile
            .register_call_site(self.current_pc, return_pc, target);
        let block = self.current;
        self.terminate(Terminator::Jump(BlockId::UNRESOLVED));
        self.record(
            BranchKind::Call,
            Some(return_pc),
            lazy,
            Placeholder::Edge {
                block,
                slot: BranchSlot::Jump,
                target,
            },
        );
    }

    fn dynamic(
        &mut self,
        kind: BranchKind,
        value: Operand,
        return_pc: Option<GuestAddr>,
        lazy: &LazyState,
    ) {
        let dispatch = self.new_block();
        self.terminate(Terminator::Jump(dispatch));
        self.record(
            kind,
            return_pc,
            lazy,
            Placeholder::Dispatch {
                block: dispatch,
                value,
            },
        );
    }

    /// Register-indirect jump.
    pub fn indirect_jump(&mut self, target: Operand, lazy: &LazyState) {
        self.dynamic(BranchKind::DynamicIndirect, target, None, lazy);
    }

    /// Register-indirect call returning to `return_pc`. The call site is registered with the
    /// profile when the fallback runs, since the callee is only known then.
    pub fn indirect_call(&mut self, target: Operand, return_pc: GuestAddr, lazy: &LazyState) {
        self.dynamic(BranchKind::Call, target, Some(return_pc), lazy);
    }

    /// Return to an address held in a register.
    pub fn return_via(&mut self, target: Operand, lazy: &LazyState) {
        self.dynamic(BranchKind::Return, target, None, lazy);
    }

    /// Leave the trace at `target` from the current block.
    pub fn exit_to(&mut self, target: GuestAddr, lazy: &LazyState) {
        let mut lazy = lazy.clone();
        self.emit_exit(Operand::Imm(target), &mut lazy);
    }

    /// Perform a system call. State is resolved and spilled before and reloaded after; the trace
    /// ends after this instruction.
    pub fn system_call(&mut self, resume_pc: GuestAddr, lazy: &mut LazyState) {
        self.resolve_lazy(lazy);
        self.regs
            .spill_all(&mut self.graph, self.current, SpillMode::All);
        self.emit(Instr::SysCall { resume_pc });
        self.regs.refill_all(&mut self.graph, self.current);
        self.stop_requested = true;
        self.stats.system_calls += 1;
    }

    /// The instruction at the current pc is not recognised. State is made exact and spilled, then
    /// the path ends in a fault that reports the raw instruction bytes.
    pub fn bad_instruction(&mut self, lazy: &mut LazyState) {
        let pc = self.current_pc;
        let mut bytes = vec![0u8; self.arch.max_instruction_len()];
        let n = self.code.fetch(pc, &mut bytes);
        bytes.truncate(n);
        self.resolve_lazy(lazy);
        self.regs
            .spill_all(&mut self.graph, self.current, SpillMode::All);
        self.terminate(Terminator::Fault { pc, bytes });
        self.stats.bad_instructions += 1;
    }

    /// Exit stub in the current block: resolve laziness, then hand `target` to the finish block.
    pub(super) fn emit_exit(&mut self, target: Operand, lazy: &mut LazyState) {
        self.resolve_lazy(lazy);
        let next_pc = self.next_pc;
        self.mov(next_pc, target);
        self.terminate(Terminator::Jump(self.finish));
        self.stats.exit_stubs += 1;
    }

    pub(super) fn new_block(&mut self) -> BlockId {
        let b = self.graph.create_block_after(self.tail);
        self.tail = b;
        self.stats.blocks += 1;
        b
    }
}
