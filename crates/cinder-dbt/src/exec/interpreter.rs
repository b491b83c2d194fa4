use std::marker::PhantomData;

use crate::error::ExecError;
use crate::host::ProcessState;

use super::{
    ControllerStats, DecodedInsn, ExecutedTier, ExecutionController, Interpreter, StepOutcome,
};

/// Decode and execute one instruction per step. Nothing is memoised.
pub struct InterpreterController<S: ?Sized, P> {
    interp: P,
    stats: ControllerStats,
    _state: PhantomData<fn(&mut S)>,
}

impl<S: ?Sized, P: Interpreter<S>> InterpreterController<S, P> {
    pub fn new(interp: P) -> Self {
        Self {
            interp,
            stats: ControllerStats::default(),
            _state: PhantomData,
        }
    }
}

impl<S: ProcessState, P: Interpreter<S>> ExecutionController<S> for InterpreterController<S, P> {
    fn step(&mut self, state: &mut S) -> Result<StepOutcome, ExecError> {
        let entry_pc = state.pc();
        let insn = self.interp.decode(state, entry_pc)?;
        insn.execute(state)?;
        let out = StepOutcome {
            tier: ExecutedTier::Interpreter,
            entry_pc,
            next_pc: state.pc(),
            instructions: 1,
        };
        self.stats.record(&out);
        Ok(out)
    }

    fn stats(&self) -> ControllerStats {
        self.stats
    }
}
