//! Trace builder.
//!
//! A trace is built in four steps:
//!
//! 1. A pre-fill block loads every guest register, so any block of the trace (including targets of
//!    backward branches) sees a filled register file.
//! 2. Guest instructions are decoded one per block, starting at the entry pc, until the path ends
//!    in a control transfer, the instruction budget runs out, or a decoded block for the same
//!    `(pc, lazy state)` already exists.
//! 3. Branches recorded during decoding are resolved from two worklists (direct and call edges
//!    first, then dynamic dispatches) until both are empty. Each one either links to an existing
//!    block, is inlined by decoding its target as a new subtrace, or becomes an exit stub.
//! 4. Every exit converges on a single finish block that spills registers and returns the next pc.
//!
//! Decoding and resolution never touch shared state apart from the branch profile; a built trace
//! becomes visible to other contexts only once it is published to the code cache.

mod cleanup;
mod emitter;
mod inline;

use std::collections::{BTreeSet, HashMap, VecDeque};

use tracing::{debug, trace};

use crate::arch::{CodeSource, GuestAddr, GuestArchitecture, RegId};
use crate::cache::CodeCache;
use crate::config::TranslatorConfig;
use crate::error::BuildError;
use crate::ir::{BlockGraph, BlockId, CmpOp, Instr, Operand, Terminator};
use crate::lazy::{LazyKey, LazyState};
use crate::profile::{BranchKind, BranchTargetProfile};
use crate::regfile::{RegisterFile, SpillMode};

pub use cleanup::eliminate_register_fills;
pub use emitter::TraceEmitter;
pub use inline::{should_inline, InlineQuery};

use emitter::{Placeholder, UnresolvedBranch};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub blocks: usize,
    pub subtraces: usize,
    pub inlined_branches: usize,
    pub exit_stubs: usize,
    pub dynamic_dispatches: usize,
    pub materializations: usize,
    pub system_calls: usize,
    pub bad_instructions: usize,
    /// Fill/spill instructions removed for registers the trace never used.
    pub eliminated_instrs: usize,
}

/// A finished, resolved trace ready for host code generation.
#[derive(Clone, Debug)]
pub struct BuiltTrace {
    pub entry_pc: GuestAddr,
    pub graph: BlockGraph,
    /// Guest instructions decoded into the trace.
    pub instruction_count: usize,
    /// Every `(pc, lazy state)` the trace has a block for, ordered by pc.
    pub keys: Vec<LazyKey>,
    pub stats: BuildStats,
}

impl BuiltTrace {
    /// Keys recorded for `pc`, one per distinct lazy state the pc was reached under.
    pub fn keys_at(&self, pc: GuestAddr) -> impl Iterator<Item = &LazyKey> + '_ {
        self.keys.iter().filter(move |k| k.pc == pc)
    }
}

pub struct TraceBuilder<'a> {
    arch: &'a dyn GuestArchitecture,
    code: &'a dyn CodeSource,
    profile: &'a dyn BranchTargetProfile,
    cache: Option<&'a CodeCache>,
    config: &'a TranslatorConfig,
}

impl<'a> TraceBuilder<'a> {
    pub fn new(
        arch: &'a dyn GuestArchitecture,
        code: &'a dyn CodeSource,
        profile: &'a dyn BranchTargetProfile,
        config: &'a TranslatorConfig,
    ) -> Self {
        Self {
            arch,
            code,
            profile,
            cache: None,
            config,
        }
    }

    /// Consult `cache` when deciding whether to inline dynamic branch targets.
    pub fn with_cache(mut self, cache: &'a CodeCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(&self, entry_pc: GuestAddr) -> Result<BuiltTrace, BuildError> {
        let registers = self.arch.registers();
        let mut graph = BlockGraph::new();
        let prefill = graph.entry();
        let finish = graph.create_block_after(prefill);
        let next_pc = graph.new_var();

        let mut tx = TraceEmitter {
            arch: self.arch,
            code: self.code,
            profile: self.profile,
            cache: self.cache,
            config: self.config,
            graph,
            regs: RegisterFile::new(registers.iter().map(|r| r.width).collect()),
            current: prefill,
            current_pc: entry_pc,
            tail: prefill,
            finish,
            next_pc,
            block_map: HashMap::new(),
            direct_queue: VecDeque::new(),
            dynamic_queue: VecDeque::new(),
            scratch: HashMap::new(),
            depth: 0,
            instruction_count: 0,
            stop_requested: false,
            stats: BuildStats::default(),
        };

        for i in 0..registers.len() {
            tx.regs.fill(&mut tx.graph, prefill, RegId(i as u16));
        }

        let lazy = self.arch.initial_lazy_state();
        assert_eq!(
            lazy.len(),
            registers.len(),
            "{}: initial lazy state does not cover the register table",
            self.arch.name()
        );

        debug!(
            target: "cinder_dbt::builder",
            "building trace at {entry_pc:#x} ({} registers, budget {})",
            registers.len(),
            self.config.budget()
        );
        let first = tx.translate_subtrace(entry_pc, lazy, 0)?;
        tx.graph.set_terminator(prefill, Terminator::Jump(first));
        tx.resolve_branches()?;
        tx.finish(entry_pc)
    }
}

impl TraceEmitter<'_> {
    /// Continuation policy, checked before each instruction.
    fn should_stop(&self) -> bool {
        (self.config.single_instruction && self.instruction_count >= 1)
            || self.instruction_count >= self.config.budget()
    }

    /// Decode a path starting at `pc` under `lazy`. Returns the block of the first instruction.
    fn translate_subtrace(
        &mut self,
        pc: GuestAddr,
        mut lazy: LazyState,
        depth: u32,
    ) -> Result<BlockId, BuildError> {
        let saved_depth = std::mem::replace(&mut self.depth, depth);
        self.stats.subtraces += 1;
        debug!(target: "cinder_dbt::builder", "subtrace at {pc:#x} (depth {depth})");

        let mut pc = pc;
        let mut entry = None;
        let mut link: Option<BlockId> = None;
        let result = loop {
            let key = lazy.make_key(pc);
            if let Some(&existing) = self.block_map.get(&key) {
                if let Some(prev) = link {
                    self.graph.set_terminator(prev, Terminator::Jump(existing));
                }
                trace!(target: "cinder_dbt::builder", ?key, "linked to existing block");
                break Ok(*entry.get_or_insert(existing));
            }

            let block = self.new_block();
            if let Some(prev) = link.take() {
                self.graph.set_terminator(prev, Terminator::Jump(block));
            }
            self.block_map.insert(key, block);
            let entry_block = *entry.get_or_insert(block);
            self.current = block;
            self.current_pc = pc;
            self.regs.begin_block();

            if self.should_stop() {
                debug!(
                    target: "cinder_dbt::builder",
                    "stopping at {pc:#x} after {} instructions",
                    self.instruction_count
                );
                self.emit_exit(Operand::Imm(pc), &mut lazy);
                break Ok(entry_block);
            }

            let arch = self.arch;
            let next = arch.translate(self, &mut lazy, pc);
            self.instruction_count += 1;
            trace!(target: "cinder_dbt::builder", "decoded {pc:#x} -> {next:x?}");

            let stop = std::mem::take(&mut self.stop_requested);
            let end = self.current;
            if self.graph.is_terminated(end) {
                break Ok(entry_block);
            }
            match next {
                Some(next) if stop => {
                    self.emit_exit(Operand::Imm(next), &mut lazy);
                    break Ok(entry_block);
                }
                Some(next) => {
                    link = Some(end);
                    pc = next;
                }
                None => break Err(BuildError::UnterminatedPath { pc, block: end.0 }),
            }
        };
        self.depth = saved_depth;
        result
    }

    fn resolve_branches(&mut self) -> Result<(), BuildError> {
        loop {
            let Some(branch) = self
                .direct_queue
                .pop_front()
                .or_else(|| self.dynamic_queue.pop_front())
            else {
                return Ok(());
            };
            match branch.at.clone() {
                Placeholder::Edge {
                    block,
                    slot,
                    target,
                } => {
                    let dest = self.destination(&branch, branch.kind, target)?;
                    self.graph.patch(block, slot, dest);
                }
                Placeholder::Dispatch { block, value } => {
                    self.resolve_dispatch(&branch, block, value)?;
                }
            }
        }
    }

    /// Block for `target` reached from `branch`: an existing block, an inlined subtrace or a fresh
    /// exit stub.
    fn destination(
        &mut self,
        branch: &UnresolvedBranch,
        kind: BranchKind,
        target: GuestAddr,
    ) -> Result<BlockId, BuildError> {
        let key = branch.lazy.make_key(target);
        if let Some(&block) = self.block_map.get(&key) {
            return Ok(block);
        }

        let query = InlineQuery {
            kind,
            single_instruction: self.config.single_instruction,
            instructions: self.instruction_count,
            budget: self.config.budget(),
            depth: branch.depth,
            max_depth: self.config.max_inline_depth,
            cached_size: self.cache.and_then(|c| c.size_hint(target)),
            size_threshold: self.config.inline_size_threshold,
        };
        if should_inline(&query) {
            debug!(
                target: "cinder_dbt::builder",
                "inlining {kind:?} branch {:#x} -> {target:#x}",
                branch.site
            );
            self.stats.inlined_branches += 1;
            return self.translate_subtrace(target, branch.lazy.clone(), branch.depth + 1);
        }

        debug!(
            target: "cinder_dbt::builder",
            "exit stub for {kind:?} branch {:#x} -> {target:#x}",
            branch.site
        );
        let stub = self.new_block();
        self.block_map.insert(key, stub);
        self.current = stub;
        self.current_pc = branch.site;
        self.regs.begin_block();
        let mut lazy = branch.lazy.clone();
        self.emit_exit(Operand::Imm(target), &mut lazy);
        Ok(stub)
    }

    fn resolve_dispatch(
        &mut self,
        branch: &UnresolvedBranch,
        block: BlockId,
        value: Operand,
    ) -> Result<(), BuildError> {
        self.stats.dynamic_dispatches += 1;
        let targets = match branch.kind {
            BranchKind::DynamicIndirect => self.profile.known_branch_targets(branch.site),
            // Calls and returns are never inlined; dispatching on them would only select between
            // exit stubs.
            BranchKind::Direct | BranchKind::Call | BranchKind::Return => BTreeSet::new(),
        };

        let mut cases = Vec::with_capacity(targets.len());
        for target in targets {
            let dest = self.destination(branch, BranchKind::DynamicIndirect, target)?;
            cases.push((target, dest));
        }
        debug!(
            target: "cinder_dbt::builder",
            "dispatch at {:#x} over {} profiled targets",
            branch.site,
            cases.len()
        );

        let fallback = if cases.is_empty() {
            block
        } else {
            self.new_block()
        };
        self.current = fallback;
        self.current_pc = branch.site;
        self.regs.begin_block();
        if self.config.records_uncaught_branches() {
            self.emit(Instr::RecordBranch {
                site: branch.site,
                target: value,
                kind: branch.kind,
                return_pc: branch.return_pc,
            });
        }
        let mut lazy = branch.lazy.clone();
        self.emit_exit(value, &mut lazy);

        if cases.is_empty() {
            return Ok(());
        }
        self.current = block;
        self.regs.begin_block();
        let term = match cases.as_slice() {
            [(target, dest)] => {
                let cond = self.cmp(CmpOp::Eq, value, Operand::Imm(*target));
                Terminator::Branch {
                    cond: Operand::Var(cond),
                    taken: *dest,
                    not_taken: fallback,
                }
            }
            _ => Terminator::Switch {
                value,
                cases,
                default: fallback,
            },
        };
        self.graph.set_terminator(block, term);
        Ok(())
    }

    fn finish(mut self, entry_pc: GuestAddr) -> Result<BuiltTrace, BuildError> {
        self.current = self.finish;
        self.regs.begin_block();
        let mut lazy = LazyState::canonical(self.regs.len());
        self.resolve_lazy(&mut lazy);
        let mode = if self.config.always_spill {
            SpillMode::All
        } else {
            SpillMode::InUse
        };
        self.regs.spill_all(&mut self.graph, self.finish, mode);
        self.graph.set_terminator(
            self.finish,
            Terminator::Return {
                next_pc: self.next_pc,
            },
        );

        if self.config.eliminate_register_fills {
            let unused = self.regs.unused();
            self.stats.eliminated_instrs = eliminate_register_fills(&mut self.graph, &unused);
        }
        self.graph.prune_unreachable();
        self.graph
            .validate()
            .map_err(|block| BuildError::UnresolvedEdge {
                entry: entry_pc,
                block,
            })?;

        let mut keys: Vec<LazyKey> = self.block_map.into_keys().collect();
        keys.sort_by_key(|k| k.pc);
        debug!(
            target: "cinder_dbt::builder",
            "finished trace at {entry_pc:#x}: {} instructions, {} blocks, {} exit stubs",
            self.instruction_count,
            self.graph.layout().len(),
            self.stats.exit_stubs
        );
        Ok(BuiltTrace {
            entry_pc,
            graph: self.graph,
            instruction_count: self.instruction_count,
            keys,
            stats: self.stats,
        })
    }
}
