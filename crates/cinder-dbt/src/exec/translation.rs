use std::collections::HashMap;
use std::sync::Arc;

use crate::arch::GuestAddr;
use crate::cache::Trace;
use crate::error::ExecError;
use crate::host::{ProcessState, TraceExit};
use crate::translator::Translator;

use super::{ControllerStats, ExecutedTier, ExecutionController, StepOutcome};

/// Compile every block on first visit and always run compiled code.
pub struct TranslationController {
    translator: Translator,
    /// Local handles so the shared cache lock is only taken on first visit.
    traces: HashMap<GuestAddr, Arc<Trace>>,
    stats: ControllerStats,
}

impl TranslationController {
    pub fn new(translator: Translator) -> Self {
        Self {
            translator,
            traces: HashMap::new(),
            stats: ControllerStats::default(),
        }
    }

    pub fn translator(&self) -> &Translator {
        &self.translator
    }
}

impl<S: ProcessState> ExecutionController<S> for TranslationController {
    fn step(&mut self, state: &mut S) -> Result<StepOutcome, ExecError> {
        let entry_pc = state.pc();
        let trace = match self.traces.get(&entry_pc) {
            Some(trace) => Arc::clone(trace),
            None => {
                let trace = self.translator.compile(entry_pc, &*state)?;
                self.traces.insert(entry_pc, Arc::clone(&trace));
                trace
            }
        };
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
        Ok(out)
    }

    fn stats(&self) -> ControllerStats {
        self.stats
    }
}
