//! Branch target profile: observed destinations of dynamic branches, call and return sites.
//!
//! The profile is advisory. The trace builder specialises dynamic dispatch on the targets it knows
//! about, and missing data only costs a slower fallback exit.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::arch::GuestAddr;

/// Kind of a control transfer recorded while building a trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BranchKind {
    Direct,
    Call,
    Return,
    DynamicIndirect,
}

/// Oracle consulted and fed by the trace builder and the generated code.
///
/// All methods take `&self` so one profile can be shared between guest contexts.
pub trait BranchTargetProfile: Send + Sync {
    fn register_call_site(&self, pc: GuestAddr, return_pc: GuestAddr, target_pc: GuestAddr);

    fn register_return_site(&self, pc: GuestAddr, target_pc: GuestAddr);

    /// Destinations observed for the branch at `pc`, in ascending address order.
    fn known_branch_targets(&self, pc: GuestAddr) -> BTreeSet<GuestAddr>;

    fn profile_branch(&self, pc: GuestAddr, actual_target: GuestAddr);
}

/// Profile that never knows anything. Dynamic branches always leave the trace.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProfile;

impl BranchTargetProfile for NoProfile {
    fn register_call_site(&self, _pc: GuestAddr, _return_pc: GuestAddr, _target_pc: GuestAddr) {}

    fn register_return_site(&self, _pc: GuestAddr, _target_pc: GuestAddr) {}

    fn known_branch_targets(&self, _pc: GuestAddr) -> BTreeSet<GuestAddr> {
        BTreeSet::new()
    }

    fn profile_branch(&self, _pc: GuestAddr, _actual_target: GuestAddr) {}
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    pub site: GuestAddr,
    pub return_pc: GuestAddr,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Procedure {
    pub entry: GuestAddr,
    pub calls: Vec<CallSite>,
    pub return_sites: BTreeSet<GuestAddr>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchSite {
    pub site: GuestAddr,
    /// `(target, times taken)`.
    pub targets: BTreeMap<GuestAddr, u64>,
}

impl BranchSite {
    pub fn execution_count(&self) -> u64 {
        self.targets.values().sum()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProfileData {
    procedures: BTreeMap<GuestAddr, Procedure>,
    branches: BTreeMap<GuestAddr, BranchSite>,
}

impl ProfileData {
    /// Procedure with the closest entry strictly below `pc`.
    fn likely_procedure(&mut self, pc: GuestAddr) -> Option<&mut Procedure> {
        self.procedures.range_mut(..pc).next_back().map(|(_, p)| p)
    }

    fn record(&mut self, site: GuestAddr, target: GuestAddr) {
        let entry = self.branches.entry(site).or_insert_with(|| BranchSite {
            site,
            targets: BTreeMap::new(),
        });
        *entry.targets.entry(target).or_insert(0) += 1;
    }
}

/// Thread-safe frequency profile with procedure tracking and JSON persistence.
#[derive(Debug, Default)]
pub struct BranchProfile {
    data: RwLock<ProfileData>,
}

impl BranchProfile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probability that the branch at `site` goes to `target`, or `None` when the site has never
    /// been observed.
    pub fn branch_probability(&self, site: GuestAddr, target: GuestAddr) -> Option<f64> {
        let data = self.data.read();
        let branch = data.branches.get(&site)?;
        let total = branch.execution_count();
        if total == 0 {
            return None;
        }
        let taken = branch.targets.get(&target).copied().unwrap_or(0);
        Some(taken as f64 / total as f64)
    }

    pub fn procedure(&self, entry: GuestAddr) -> Option<Procedure> {
        self.data.read().procedures.get(&entry).cloned()
    }

    pub fn procedures(&self) -> Vec<Procedure> {
        self.data.read().procedures.values().cloned().collect()
    }

    pub fn branch_site(&self, site: GuestAddr) -> Option<BranchSite> {
        self.data.read().branches.get(&site).cloned()
    }

    pub fn site_count(&self) -> usize {
        self.data.read().branches.len()
    }

    pub fn save<W: Write>(&self, writer: W) -> serde_json::Result<()> {
        serde_json::to_writer_pretty(writer, &*self.data.read())
    }

    pub fn load<R: Read>(reader: R) -> serde_json::Result<Self> {
        let data: ProfileData = serde_json::from_reader(reader)?;
        Ok(Self {
            data: RwLock::new(data),
        })
    }
}

impl BranchTargetProfile for BranchProfile {
    fn register_call_site(&self, pc: GuestAddr, return_pc: GuestAddr, target_pc: GuestAddr) {
        let mut data = self.data.write();
        let procedure = data
            .procedures
            .entry(target_pc)
            .or_insert_with(|| Procedure {
                entry: target_pc,
                ..Procedure::default()
            });
        let call = CallSite {
            site: pc,
            return_pc,
        };
        if !procedure.calls.contains(&call) {
            procedure.calls.push(call);
        }
        data.record(pc, target_pc);
    }

    fn register_return_site(&self, pc: GuestAddr, target_pc: GuestAddr) {
        let mut data = self.data.write();
        if let Some(procedure) = data.likely_procedure(pc) {
            procedure.return_sites.insert(pc);
        }
        data.record(pc, target_pc);
    }

    fn known_branch_targets(&self, pc: GuestAddr) -> BTreeSet<GuestAddr> {
        self.data
            .read()
            .branches
            .get(&pc)
            .map(|b| b.targets.keys().copied().collect())
            .unwrap_or_default()
    }

    fn profile_branch(&self, pc: GuestAddr, actual_target: GuestAddr) {
        self.data.write().record(pc, actual_target);
    }
}
