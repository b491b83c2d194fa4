//! Inlining decision for unresolved branches.

use crate::profile::BranchKind;

/// Everything the inlining decision looks at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InlineQuery {
    pub kind: BranchKind,
    pub single_instruction: bool,
    /// Guest instructions translated into the trace so far.
    pub instructions: usize,
    pub budget: usize,
    /// Inline depth of the subtrace the branch was recorded in.
    pub depth: u32,
    pub max_depth: u32,
    /// Host size hint of an already compiled trace for the target, if there is one.
    pub cached_size: Option<usize>,
    pub size_threshold: usize,
}

/// Whether to continue the trace into the branch target instead of leaving it.
///
/// Calls and returns always leave the trace so the code cache can find their targets. Direct
/// branches are inlined while resources remain. A dynamic target is inlined only when it has no
/// compiled trace of its own, or when that trace is small.
pub fn should_inline(q: &InlineQuery) -> bool {
    if q.single_instruction || q.instructions >= q.budget || q.depth >= q.max_depth {
        return false;
    }
    match q.kind {
        BranchKind::Call | BranchKind::Return => false,
        BranchKind::Direct => true,
        BranchKind::DynamicIndirect => match q.cached_size {
            None => true,
            Some(size) => size < q.size_threshold,
        },
    }
}
