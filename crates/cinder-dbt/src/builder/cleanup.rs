//! Post-build cleanup passes over a finished block graph.

use std::collections::HashSet;

use crate::arch::RegId;
use crate::ir::{BlockGraph, Instr};

/// Remove fill and spill code for registers the trace never read or wrote. Their persistent value
/// is unchanged by the trace, so loading and storing it again is dead work.
///
/// Returns the number of removed instructions.
pub fn eliminate_register_fills(graph: &mut BlockGraph, unused: &[RegId]) -> usize {
    if unused.is_empty() {
        return 0;
    }
    let unused: HashSet<RegId> = unused.iter().copied().collect();
    graph.retain_instrs(|instr| match instr {
        Instr::Fill { reg, .. } | Instr::Spill { reg, .. } => !unused.contains(reg),
        _ => true,
    })
}
