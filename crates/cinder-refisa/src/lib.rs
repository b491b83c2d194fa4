//! A small 32-bit reference guest ISA for the `cinder-dbt` translator.
//!
//! Eight general-purpose registers, a link register convention (`r7`), a zero/negative flags
//! register and fixed four-byte instructions. Small as it is, the ISA exercises every interesting
//! path of the trace builder: deferred flags, 8- and 16-bit sub-register writes, direct and
//! conditional branches, calls, returns, register-indirect jumps and system calls.

pub mod asm;
pub mod interp;
pub mod isa;
pub mod machine;
pub mod translate;

use std::sync::Arc;

use cinder_dbt::{BranchTargetProfile, CodeCache, IrEvaluator, Translator, TranslatorConfig};

pub use interp::RefInterpreter;
pub use isa::{decode, Insn};
pub use machine::{MachineError, RefMachine};
pub use translate::RefIsa;

/// Translator for the reference ISA backed by the IR evaluator. `profile` is also handed to the
/// evaluator, so compiled dynamic-branch fallbacks feed it.
pub fn translator(
    arch: Arc<RefIsa>,
    profile: Arc<dyn BranchTargetProfile>,
    config: TranslatorConfig,
) -> Translator {
    Translator::new(
        arch,
        Arc::new(IrEvaluator::with_profile(Arc::clone(&profile))),
        Arc::new(CodeCache::new()),
        profile,
        config,
    )
}
