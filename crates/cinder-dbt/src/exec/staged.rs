use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::debug;

use crate::arch::GuestAddr;
use crate::cache::Trace;
use crate::error::ExecError;
use crate::host::{ProcessState, TraceExit};
use crate::translator::Translator;

use super::{
    ControllerStats, DecodedBlock, ExecutedTier, ExecutionController, Interpreter, StepOutcome,
};

enum Stage<I> {
    Interpreted { block: DecodedBlock<I>, heat: u64 },
    /// Terminal: a promoted block is never interpreted again.
    Compiled(Arc<Trace>),
}

/// Interpret memoised blocks while counting their heat; hand blocks whose heat exceeds the
/// threshold to the translator and dispatch them through the code cache from then on.
///
/// Interpreted dynamic branches feed the translator's branch profile, so traces built later can
/// specialise indirect dispatch on the targets seen so far.
pub struct StagedController<S: ?Sized, P: Interpreter<S>> {
    interp: P,
    translator: Translator,
    hot_threshold: u64,
    blocks: HashMap<GuestAddr, Stage<P::Insn>>,
    stats: ControllerStats,
    _state: PhantomData<fn(&mut S)>,
}

impl<S: ?Sized, P: Interpreter<S>> StagedController<S, P> {
    pub fn new(interp: P, translator: Translator, hot_threshold: u64) -> Self {
        Self {
            interp,
            translator,
            hot_threshold,
            blocks: HashMap::new(),
            stats: ControllerStats::default(),
            _state: PhantomData,
        }
    }

    pub fn translator(&self) -> &Translator {
        &self.translator
    }

    /// Heat of the block at `pc`, or `None` if it is unknown or already compiled.
    pub fn heat(&self, pc: GuestAddr) -> Option<u64> {
        match self.blocks.get(&pc)? {
            Stage::Interpreted { heat, .. } => Some(*heat),
            Stage::Compiled(_) => None,
        }
    }

    pub fn is_promoted(&self, pc: GuestAddr) -> bool {
        matches!(self.blocks.get(&pc), Some(Stage::Compiled(_)))
    }
}

impl<S: ProcessState, P: Interpreter<S>> ExecutionController<S> for StagedController<S, P> {
    fn step(&mut self, state: &mut S) -> Result<StepOutcome, ExecError> {
        let entry_pc = state.pc();

        if let Some(Stage::Compiled(trace)) = self.blocks.get(&entry_pc) {
            let trace = Arc::clone(trace);
            let next_pc = match trace.code.invoke(state) {
                TraceExit::Continue(pc) => pc,
                TraceExit::Fault(fault) => return Err(fault.into()),
            };
            let out = StepOutcome {
                tier: ExecutedTier::Compiled,
                entry_pc,
                next_pc,
                instructions: trace.instruction_count as u64,
            };
            self.stats.record(&out);
            return Ok(out);
        }

        if !self.blocks.contains_key(&entry_pc) {
            let block = DecodedBlock::decode(&self.interp, &*state, entry_pc)?;
            self.blocks
                .insert(entry_pc, Stage::Interpreted { block, heat: 0 });
            self.stats.memoised_blocks = self.blocks.len();
        }
        let Some(Stage::Interpreted { block, heat }) = self.blocks.get_mut(&entry_pc) else {
            unreachable!("block at {entry_pc:#x} was just memoised");
        };
        let executed = block.execute(state, Some(&**self.translator.profile()))?;
        *heat += executed;
        let promote = *heat > self.hot_threshold;

        if promote {
            debug!(
                target: "cinder_dbt::exec",
                "promoting block {entry_pc:#x} (heat {})",
                *heat
            );
            let trace = self.translator.compile(entry_pc, &*state)?;
            self.blocks.insert(entry_pc, Stage::Compiled(trace));
            self.stats.promotions += 1;
        }

        let out = StepOutcome {
            tier: ExecutedTier::Interpreter,
            entry_pc,
            next_pc: state.pc(),
            instructions: executed,
        };
        self.stats.record(&out);
        Ok(out)
    }

    fn stats(&self) -> ControllerStats {
        self.stats
    }
}
