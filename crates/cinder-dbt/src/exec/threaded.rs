use std::collections::HashMap;
use std::marker::PhantomData;

use crate::arch::GuestAddr;
use crate::error::{ExecError, GuestFault};
use crate::host::ProcessState;
use crate::profile::{BranchKind, BranchTargetProfile};

use super::{
    ControllerStats, DecodedInsn, ExecutedTier, ExecutionController, Interpreter, StepOutcome,
};

/// Upper bound on instructions in one dynamic block.
pub const MAX_BLOCK_INSTRUCTIONS: usize = 256;

/// Straight-line run of decoded instructions ending at the first one whose successor is not
/// statically known.
#[derive(Clone, Debug)]
pub struct DecodedBlock<I> {
    pub entry: GuestAddr,
    insns: Vec<(GuestAddr, I)>,
}

impl<I> DecodedBlock<I> {
    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// Decode from `pc`. A decode fault after the first instruction ends the block early; the
    /// fault surfaces when the faulting pc is reached.
    pub fn decode<S, P>(interp: &P, state: &S, pc: GuestAddr) -> Result<Self, GuestFault>
    where
        S: ?Sized,
        P: Interpreter<S, Insn = I>,
        I: DecodedInsn<S>,
    {
        let mut insns = Vec::new();
        let mut at = pc;
        while insns.len() < MAX_BLOCK_INSTRUCTIONS {
            let insn = match interp.decode(state, at) {
                Ok(insn) => insn,
                Err(fault) if insns.is_empty() => return Err(fault),
                Err(_) => break,
            };
            let next = insn.successor(at);
            insns.push((at, insn));
            match next {
                Some(next) => at = next,
                None => break,
            }
        }
        Ok(Self { entry: pc, insns })
    }

    /// Execute the block, stopping early if the process finishes. Returns instructions executed.
    ///
    /// Dynamic branches are reported to `profile` with the target they actually took.
    pub fn execute<S>(
        &self,
        state: &mut S,
        profile: Option<&dyn BranchTargetProfile>,
    ) -> Result<u64, GuestFault>
    where
        S: ProcessState + ?Sized,
        I: DecodedInsn<S>,
    {
        let mut executed = 0;
        for (pc, insn) in &self.insns {
            insn.execute(state)?;
            executed += 1;
            if let (Some(profile), Some(kind)) = (profile, insn.branch_kind()) {
                match (kind, insn.return_pc(*pc)) {
                    (BranchKind::Call, Some(ret)) => {
                        profile.register_call_site(*pc, ret, state.pc())
                    }
                    (BranchKind::Return, _) => profile.register_return_site(*pc, state.pc()),
                    _ => profile.profile_branch(*pc, state.pc()),
                }
            }
            if state.finished() {
                break;
            }
        }
        Ok(executed)
    }
}

/// Memoises decoded blocks per entry pc and replays them on later visits. Only blocks longer than
/// the configured minimum are kept.
pub struct ThreadedInterpreter<S: ?Sized, P: Interpreter<S>> {
    interp: P,
    min_block_len: usize,
    blocks: HashMap<GuestAddr, DecodedBlock<P::Insn>>,
    stats: ControllerStats,
    _state: PhantomData<fn(&mut S)>,
}

impl<S: ?Sized, P: Interpreter<S>> ThreadedInterpreter<S, P> {
    pub fn new(interp: P, min_block_len: usize) -> Self {
        Self {
            interp,
            min_block_len,
            blocks: HashMap::new(),
            stats: ControllerStats::default(),
            _state: PhantomData,
        }
    }

    pub fn is_memoised(&self, pc: GuestAddr) -> bool {
        self.blocks.contains_key(&pc)
    }
}

impl<S: ProcessState, P: Interpreter<S>> ExecutionController<S> for ThreadedInterpreter<S, P> {
    fn step(&mut self, state: &mut S) -> Result<StepOutcome, ExecError> {
        let entry_pc = state.pc();
        let executed = match self.blocks.get(&entry_pc) {
            Some(block) => block.execute(state, None)?,
            None => {
                let block = DecodedBlock::decode(&self.interp, &*state, entry_pc)?;
                let executed = block.execute(state, None)?;
                if block.len() > self.min_block_len {
                    self.blocks.insert(entry_pc, block);
                    self.stats.memoised_blocks = self.blocks.len();
                }
                executed
            }
        };
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
