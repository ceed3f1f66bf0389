//! Capacity Ledger
//!
//! Per-backend committed usage plus in-flight reservations, persisted under
//! `capacity/<backend>` and only ever mutated through version-guarded writes.
//! Invariant: `committed + reserved <= usable total` of the backend.

use crate::domain::ports::{BackendId, StateStore, WriteOp};
use crate::error::Result;
use crate::registry::BackendDescriptor;
use crate::store::{keys, load_json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An in-flight capacity hold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub backend_id: BackendId,
    pub volume_id: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Committed usage and active reservations of one backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityLedger {
    pub committed_bytes: u64,
    pub reservations: BTreeMap<String, Reservation>,
}

impl CapacityLedger {
    /// Sum of active reservations
    pub fn reserved_bytes(&self) -> u64 {
        self.reservations.values().map(|r| r.size_bytes).sum()
    }

    /// Bytes still available for new reservations on `backend`
    ///
    /// Bounded both by what the backend reports free and by what our own
    /// accounting says is left of its usable total.
    pub fn headroom(&self, backend: &BackendDescriptor) -> u64 {
        let by_accounting = backend
            .usable_total_bytes()
            .saturating_sub(self.committed_bytes);
        backend
            .free_bytes
            .min(by_accounting)
            .saturating_sub(self.reserved_bytes())
    }

    pub fn add_reservation(&mut self, reservation: Reservation) {
        self.reservations.insert(reservation.id.clone(), reservation);
    }

    /// Drop a reservation, returning it if it was active
    pub fn release(&mut self, reservation_id: &str) -> Option<Reservation> {
        self.reservations.remove(reservation_id)
    }

    /// Turn a reservation into committed usage
    ///
    /// Returns false when the reservation is no longer active, which means it
    /// was already committed or released.
    pub fn commit(&mut self, reservation_id: &str) -> bool {
        match self.reservations.remove(reservation_id) {
            Some(reservation) => {
                self.committed_bytes += reservation.size_bytes;
                true
            }
            None => false,
        }
    }

    /// Return committed usage after a delete
    pub fn free(&mut self, bytes: u64) {
        self.committed_bytes = self.committed_bytes.saturating_sub(bytes);
    }
}

/// Load a ledger and its store version (0 when absent)
pub async fn load_ledger(
    store: &dyn StateStore,
    backend_id: &BackendId,
) -> Result<(CapacityLedger, u64)> {
    Ok(load_json(store, &keys::capacity(backend_id.as_str()))
        .await?
        .unwrap_or_default())
}

/// Version-guarded write of a ledger
pub fn ledger_write(
    backend_id: &BackendId,
    ledger: &CapacityLedger,
    version: u64,
) -> Result<WriteOp> {
    WriteOp::put_json(keys::capacity(backend_id.as_str()), ledger, Some(version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{BackendKind, CapabilitySet};

    const GIB: u64 = 1024 * 1024 * 1024;

    fn backend(free: u64, total: u64) -> BackendDescriptor {
        BackendDescriptor {
            backend_id: BackendId::new("lvm-a"),
            kind: BackendKind::Lvm,
            free_bytes: free,
            total_bytes: total,
            utilization_percent: 0,
            reserved_percentage: 0,
            capabilities: CapabilitySet::default(),
            sequence_no: 1,
            first_seen: Utc::now(),
            last_report: Utc::now(),
        }
    }

    fn reservation(id: &str, size: u64) -> Reservation {
        Reservation {
            id: id.into(),
            backend_id: BackendId::new("lvm-a"),
            volume_id: format!("vol-{}", id),
            size_bytes: size,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_headroom_accounts_for_reservations_and_commits() {
        let b = backend(15 * GIB, 15 * GIB);
        let mut ledger = CapacityLedger::default();
        assert_eq!(ledger.headroom(&b), 15 * GIB);

        ledger.add_reservation(reservation("r1", 10 * GIB));
        assert_eq!(ledger.headroom(&b), 5 * GIB);

        assert!(ledger.commit("r1"));
        assert_eq!(ledger.committed_bytes, 10 * GIB);
        assert_eq!(ledger.headroom(&b), 5 * GIB);

        // Second commit of the same reservation is a no-op
        assert!(!ledger.commit("r1"));
        assert_eq!(ledger.committed_bytes, 10 * GIB);
    }

    #[test]
    fn test_headroom_bounded_by_reported_free() {
        let b = backend(2 * GIB, 15 * GIB);
        let ledger = CapacityLedger::default();
        assert_eq!(ledger.headroom(&b), 2 * GIB);
    }

    #[test]
    fn test_release_and_free() {
        let mut ledger = CapacityLedger::default();
        ledger.add_reservation(reservation("r1", GIB));
        assert!(ledger.release("r1").is_some());
        assert!(ledger.release("r1").is_none());
        assert_eq!(ledger.reserved_bytes(), 0);

        ledger.committed_bytes = GIB;
        ledger.free(2 * GIB);
        assert_eq!(ledger.committed_bytes, 0);
    }
}
