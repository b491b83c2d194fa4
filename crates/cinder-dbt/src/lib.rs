//! Trace-granularity dynamic binary translation core.
//!
//! Guest code is decoded into multi-instruction, single-entry traces of host IR, compiled once per
//! entry pc and cached. Execution controllers decide per dynamic block whether to interpret or run
//! compiled code, promoting blocks as they get hot.
//!
//! The crate is guest- and host-agnostic: a guest ISA plugs in through
//! [`arch::GuestArchitecture`] (translation) and [`exec::Interpreter`] (interpretation), and a host
//! backend through [`host::HostCodeGenerator`].

pub mod arch;
pub mod builder;
pub mod cache;
pub mod config;
pub mod error;
pub mod exec;
pub mod host;
pub mod ir;
pub mod lazy;
pub mod profile;
pub mod regfile;
pub mod translator;

pub use arch::{CodeSource, GuestAddr, GuestArchitecture, RegClass, RegId, RegisterDesc, Width};
pub use builder::{BuiltTrace, TraceBuilder, TraceEmitter};
pub use cache::{CodeCache, Trace};
pub use config::{ExecConfig, TranslatorConfig};
pub use error::{BuildError, CacheError, CodegenError, ExecError, GuestFault, TranslateError};
pub use exec::{
    ControllerKind, ExecutedTier, ExecutionController, RunSummary, StepOutcome,
};
pub use host::{HostCode, HostCodeGenerator, IrEvaluator, ProcessState, TraceExit};
pub use lazy::{LazyKey, LazyState, Validity};
pub use profile::{BranchKind, BranchProfile, BranchTargetProfile};
pub use translator::Translator;
