//! Tunables for trace construction and tiered execution.
//!
//! Both structs are `serde`-(de)serialisable so a runner can load them from a JSON file and
//! override individual fields from the command line. Missing fields fall back to [`Default`].

use serde::{Deserialize, Serialize};

/// Highest supported optimisation level.
pub const MAX_OPT_LEVEL: u8 = 2;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslatorConfig {
    /// Optimisation level, `0..=MAX_OPT_LEVEL`. Selects the instruction budget and enables branch
    /// recording in dynamic fallbacks above level 0.
    pub opt_level: u8,
    /// Guest instructions a single trace may translate, indexed by optimisation level.
    pub instruction_budget: [usize; 3],
    /// Translate exactly one guest instruction per trace.
    pub single_instruction: bool,
    /// Spill every filled register at the finish block, not only the ones in use.
    pub always_spill: bool,
    /// Drop fill/spill code for registers that were filled but never touched.
    pub eliminate_register_fills: bool,
    /// A dynamic branch target that is already compiled is still inlined when its host size hint
    /// is below this many host instructions.
    pub inline_size_threshold: usize,
    /// Bound on nested inlining of branch targets.
    pub max_inline_depth: u32,
    /// Plant a branch-recording instruction in the fallback of dynamic dispatches.
    pub record_uncaught_branches: bool,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            opt_level: 0,
            instruction_budget: [684, 1500, 1500],
            single_instruction: false,
            always_spill: false,
            eliminate_register_fills: true,
            inline_size_threshold: 30,
            max_inline_depth: 8,
            record_uncaught_branches: false,
        }
    }
}

impl TranslatorConfig {
    /// Instruction budget for the configured optimisation level. Levels above the maximum are
    /// clamped.
    pub fn budget(&self) -> usize {
        let level = usize::from(self.opt_level.min(MAX_OPT_LEVEL));
        self.instruction_budget[level]
    }

    pub fn records_uncaught_branches(&self) -> bool {
        self.record_uncaught_branches && self.opt_level > 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Accumulated guest instructions after which a memoised block is handed to the translator.
    pub hot_threshold: u64,
    /// The threaded interpreter only memoises blocks longer than this many instructions.
    pub min_threaded_block_len: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            hot_threshold: 1_000,
            min_threaded_block_len: 3,
        }
    }
}
