//! Code cache: compiled traces keyed by guest entry pc.
//!
//! At most one trace exists per entry pc. Guest contexts sharing a process image share one cache,
//! so insertion is atomic with respect to concurrent lookups and insertions. Translation happens
//! outside the lock; a context that loses a compilation race discards its own trace and adopts the
//! one that was published first.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::arch::GuestAddr;
use crate::error::CacheError;
use crate::host::{GeneratedCode, HostCode};

/// Compiled, immutable unit of translated code.
pub struct Trace {
    pub entry_pc: GuestAddr,
    /// Guest instructions translated into this trace.
    pub instruction_count: usize,
    pub host_size_hint: usize,
    pub code: Arc<dyn HostCode>,
}

impl Trace {
    pub fn new(entry_pc: GuestAddr, instruction_count: usize, generated: GeneratedCode) -> Self {
        Self {
            entry_pc,
            instruction_count,
            host_size_hint: generated.host_size_hint,
            code: generated.code,
        }
    }
}

impl fmt::Debug for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trace")
            .field("entry_pc", &format_args!("{:#x}", self.entry_pc))
            .field("instruction_count", &self.instruction_count)
            .field("host_size_hint", &self.host_size_hint)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub lost_races: u64,
}

#[derive(Debug, Default)]
pub struct CodeCache {
    traces: RwLock<HashMap<GuestAddr, Arc<Trace>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    lost_races: AtomicU64,
}

impl CodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `trace` under its entry pc.
    ///
    /// Fails with [`CacheError::DuplicateEntry`] if a trace for that pc already exists; the
    /// existing entry is never overwritten.
    pub fn add(&self, trace: Arc<Trace>) -> Result<(), CacheError> {
        let pc = trace.entry_pc;
        let mut traces = self.traces.write();
        if traces.contains_key(&pc) {
            return Err(CacheError::DuplicateEntry { pc });
        }
        traces.insert(pc, trace);
        Ok(())
    }

    pub fn try_get(&self, pc: GuestAddr) -> Option<Arc<Trace>> {
        let found = self.traces.read().get(&pc).cloned();
        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Publish a freshly compiled trace, or return the one that beat it to the cache.
    pub fn publish(&self, trace: Arc<Trace>) -> Arc<Trace> {
        let pc = trace.entry_pc;
        let mut traces = self.traces.write();
        if let Some(winner) = traces.get(&pc) {
            self.lost_races.fetch_add(1, Ordering::Relaxed);
            warn!(
                target: "cinder_dbt::cache",
                "lost compilation race for {pc:#x}; discarding trace"
            );
            return Arc::clone(winner);
        }
        traces.insert(pc, Arc::clone(&trace));
        trace
    }

    /// Host size hint of the trace cached for `pc`. Not counted as a lookup.
    pub fn size_hint(&self, pc: GuestAddr) -> Option<usize> {
        self.traces.read().get(&pc).map(|t| t.host_size_hint)
    }

    pub fn contains(&self, pc: GuestAddr) -> bool {
        self.traces.read().contains_key(&pc)
    }

    pub fn len(&self) -> usize {
        self.traces.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry pcs of every cached trace, ascending.
    pub fn entries(&self) -> Vec<GuestAddr> {
        let mut pcs: Vec<_> = self.traces.read().keys().copied().collect();
        pcs.sort_unstable();
        pcs
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            lost_races: self.lost_races.load(Ordering::Relaxed),
        }
    }
}
