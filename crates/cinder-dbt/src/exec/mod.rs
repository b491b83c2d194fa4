//! Execution controllers.
//!
//! A controller runs a guest program one dynamic block at a time. All controllers work against the
//! same guest contract: an [`Interpreter`] that decodes instructions into [`DecodedInsn`]s, and a
//! [`ProcessState`] that both interpreted and compiled code read and write.

mod interpreter;
mod staged;
mod threaded;
mod translation;

use std::fmt;
use std::str::FromStr;

use crate::arch::GuestAddr;
use crate::config::ExecConfig;
use crate::error::{ExecError, GuestFault};
use crate::host::ProcessState;
use crate::profile::BranchKind;
use crate::translator::Translator;

pub use interpreter::InterpreterController;
pub use staged::StagedController;
pub use threaded::{DecodedBlock, ThreadedInterpreter, MAX_BLOCK_INSTRUCTIONS};
pub use translation::TranslationController;

/// One decoded guest instruction, ready to be executed any number of times.
pub trait DecodedInsn<S: ?Sized>: Clone {
    /// Execute against `state` and leave the process pc at the next instruction to run.
    fn execute(&self, state: &mut S) -> Result<(), GuestFault>;

    /// Statically known address of the next instruction when this one sits at `pc`, or `None` when
    /// control may go elsewhere (branches, returns, calls).
    fn successor(&self, pc: GuestAddr) -> Option<GuestAddr>;

    /// Kind of a dynamic control transfer whose observed targets are worth profiling.
    fn branch_kind(&self) -> Option<BranchKind> {
        None
    }

    /// Return address of a call sitting at `pc`.
    fn return_pc(&self, _pc: GuestAddr) -> Option<GuestAddr> {
        None
    }
}

/// Guest instruction decoder used by the interpreting tiers.
pub trait Interpreter<S: ?Sized> {
    type Insn: DecodedInsn<S>;

    fn decode(&self, state: &S, pc: GuestAddr) -> Result<Self::Insn, GuestFault>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutedTier {
    Interpreter,
    Compiled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutcome {
    pub tier: ExecutedTier,
    pub entry_pc: GuestAddr,
    pub next_pc: GuestAddr,
    /// Guest instructions retired. For compiled steps this is the number of instructions
    /// translated into the trace, which is exact only for straight-line traces.
    pub instructions: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerStats {
    pub interpreted_instructions: u64,
    pub compiled_instructions: u64,
    pub compiled_invocations: u64,
    /// Blocks handed to the translator after becoming hot.
    pub promotions: u64,
    /// Decoded blocks currently memoised.
    pub memoised_blocks: usize,
}

impl ControllerStats {
    fn record(&mut self, out: &StepOutcome) {
        match out.tier {
            ExecutedTier::Interpreter => self.interpreted_instructions += out.instructions,
            ExecutedTier::Compiled => {
                self.compiled_instructions += out.instructions;
                self.compiled_invocations += 1;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub steps: u64,
    pub interpreted_instructions: u64,
    pub compiled_instructions: u64,
    pub final_pc: GuestAddr,
    /// The process reported `finished()`; otherwise the step limit was reached.
    pub finished: bool,
}

pub trait ExecutionController<S: ProcessState> {
    fn step(&mut self, state: &mut S) -> Result<StepOutcome, ExecError>;

    fn stats(&self) -> ControllerStats;

    /// Step until the process finishes or `max_steps` steps have run.
    fn run(&mut self, state: &mut S, max_steps: Option<u64>) -> Result<RunSummary, ExecError> {
        let mut summary = RunSummary::default();
        while !state.finished() && max_steps.map_or(true, |max| summary.steps < max) {
            let out = self.step(state)?;
            summary.steps += 1;
            match out.tier {
                ExecutedTier::Interpreter => summary.interpreted_instructions += out.instructions,
                ExecutedTier::Compiled => summary.compiled_instructions += out.instructions,
            }
        }
        summary.final_pc = state.pc();
        summary.finished = state.finished();
        Ok(summary)
    }
}

/// Selects an execution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerKind {
    Interpreter,
    Threaded,
    Staged,
    /// Compile every block; never interpret.
    Translator,
}

impl ControllerKind {
    pub const ALL: [ControllerKind; 4] = [
        ControllerKind::Interpreter,
        ControllerKind::Threaded,
        ControllerKind::Staged,
        ControllerKind::Translator,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ControllerKind::Interpreter => "interpreter",
            ControllerKind::Threaded => "threaded",
            ControllerKind::Staged => "staged",
            ControllerKind::Translator => "translator",
        }
    }
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ControllerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ControllerKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| format!("unknown controller `{s}`"))
    }
}

/// Construct the controller selected by `kind`.
pub fn new_controller<S, I>(
    kind: ControllerKind,
    interpreter: I,
    translator: Translator,
    config: &ExecConfig,
) -> Box<dyn ExecutionController<S>>
where
    S: ProcessState + 'static,
    I: Interpreter<S> + 'static,
{
    match kind {
        ControllerKind::Interpreter => Box::new(InterpreterController::new(interpreter)),
        ControllerKind::Threaded => Box::new(ThreadedInterpreter::new(
            interpreter,
            config.min_threaded_block_len,
        )),
        ControllerKind::Staged => Box::new(StagedController::new(
            interpreter,
            translator,
            config.hot_threshold,
        )),
        ControllerKind::Translator => Box::new(TranslationController::new(translator)),
    }
}
