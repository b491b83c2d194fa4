//! `compile(pc)`: cache lookup, trace building, host code generation and publication.

use std::sync::Arc;

use tracing::debug;

use crate::arch::{CodeSource, GuestAddr, GuestArchitecture};
use crate::builder::{BuiltTrace, TraceBuilder};
use crate::cache::{CodeCache, Trace};
use crate::config::TranslatorConfig;
use crate::error::TranslateError;
use crate::host::HostCodeGenerator;
use crate::profile::BranchTargetProfile;

/// Everything needed to turn guest code into cached traces. Cheap to clone; clones share the
/// cache and the profile.
#[derive(Clone)]
pub struct Translator {
    arch: Arc<dyn GuestArchitecture>,
    codegen: Arc<dyn HostCodeGenerator>,
    cache: Arc<CodeCache>,
    profile: Arc<dyn BranchTargetProfile>,
    config: TranslatorConfig,
}

impl Translator {
    pub fn new(
        arch: Arc<dyn GuestArchitecture>,
        codegen: Arc<dyn HostCodeGenerator>,
        cache: Arc<CodeCache>,
        profile: Arc<dyn BranchTargetProfile>,
        config: TranslatorConfig,
    ) -> Self {
        Self {
            arch,
            codegen,
            cache,
            profile,
            config,
        }
    }

    pub fn arch(&self) -> &Arc<dyn GuestArchitecture> {
        &self.arch
    }

    pub fn cache(&self) -> &Arc<CodeCache> {
        &self.cache
    }

    pub fn profile(&self) -> &Arc<dyn BranchTargetProfile> {
        &self.profile
    }

    pub fn config(&self) -> &TranslatorConfig {
        &self.config
    }

    /// Build a trace for `pc` without generating or caching it.
    pub fn build(&self, pc: GuestAddr, code: &dyn CodeSource) -> Result<BuiltTrace, TranslateError> {
        let trace = TraceBuilder::new(&*self.arch, code, &*self.profile, &self.config)
            .with_cache(&self.cache)
            .build(pc)?;
        Ok(trace)
    }

    /// Cached trace for `pc`, compiling and publishing one on a miss.
    ///
    /// Building and code generation run outside the cache lock. If another context published a
    /// trace for `pc` in the meantime, that trace is returned and this one is dropped.
    pub fn compile(&self, pc: GuestAddr, code: &dyn CodeSource) -> Result<Arc<Trace>, TranslateError> {
        if let Some(trace) = self.cache.try_get(pc) {
            return Ok(trace);
        }
        let built = self.build(pc, code)?;
        let generated = self.codegen.generate(&built)?;
        let trace = Arc::new(Trace::new(pc, built.instruction_count, generated));
        debug!(
            target: "cinder_dbt::cache",
            "compiled {pc:#x}: {} guest instructions, host size {}",
            trace.instruction_count,
            trace.host_size_hint
        );
        Ok(self.cache.publish(trace))
    }

    /// Compile `pc` and insert it with [`CodeCache::add`], failing if a trace is already cached.
    pub fn precompile(
        &self,
        pc: GuestAddr,
        code: &dyn CodeSource,
    ) -> Result<Arc<Trace>, TranslateError> {
        let built = self.build(pc, code)?;
        let generated = self.codegen.generate(&built)?;
        let trace = Arc::new(Trace::new(pc, built.instruction_count, generated));
        self.cache.add(Arc::clone(&trace))?;
        Ok(trace)
    }
}
