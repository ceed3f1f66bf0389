//! Scheduling Filters
//!
//! Backends must pass the capability filter and then the capacity filter.
//! The two are kept separate because they map to different errors.

use super::ledger::CapacityLedger;
use crate::domain::ports::CapabilityRequirements;
use crate::registry::{BackendDescriptor, RegistrySnapshot};

/// A backend that passed the capability filter, with its current headroom
#[derive(Debug, Clone)]
pub struct Candidate {
    pub backend: BackendDescriptor,
    pub ledger: CapacityLedger,
    pub ledger_version: u64,
    pub headroom_bytes: u64,
}

/// Backends whose capability set is a superset of the requirements
pub fn capability_filter<'a>(
    snapshot: &'a RegistrySnapshot,
    requirements: &CapabilityRequirements,
) -> Vec<&'a BackendDescriptor> {
    snapshot
        .backends()
        .iter()
        .filter(|b| b.capabilities.satisfies(requirements))
        .collect()
}

/// Candidates with at least `size_bytes` of headroom
pub fn capacity_filter(candidates: Vec<Candidate>, size_bytes: u64) -> Vec<Candidate> {
    candidates
        .into_iter()
        .filter(|c| c.headroom_bytes >= size_bytes)
        .collect()
}
