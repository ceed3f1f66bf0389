//! Capability Registry
//!
//! Holds the latest accepted report of every backend. Writers build a new map
//! and swap it in under a short write lock; readers clone the current `Arc`
//! and work on an immutable snapshot, so the read path never waits on a
//! writer assembling its update.

use super::RegistryEvent;
use crate::domain::clock::{ClockRef, SystemClock};
use crate::domain::ports::{BackendId, BackendKind, CapabilitySet, CapacityReport};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the capability registry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Backends whose last report is older than this are not scheduled
    #[serde(with = "crate::registry::capability_registry::duration_secs")]
    pub staleness_threshold: Duration,
    /// Event channel capacity
    pub event_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            staleness_threshold: Duration::from_secs(120),
            event_capacity: 1024,
        }
    }
}

/// Serde helper for durations expressed in whole seconds
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

// =============================================================================
// Backend Report
// =============================================================================

/// A backend's self-report, pushed or pulled periodically
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendReport {
    pub backend_id: BackendId,
    pub kind: BackendKind,
    pub capacity: CapacityReport,
    pub capabilities: CapabilitySet,
    /// Share of total capacity withheld from scheduling (0-100)
    #[serde(default)]
    pub reserved_percentage: u8,
    /// Strictly increasing per backend
    pub sequence_no: u64,
}

// =============================================================================
// Backend Descriptor
// =============================================================================

/// Registry entry for a single backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub backend_id: BackendId,
    pub kind: BackendKind,
    pub free_bytes: u64,
    pub total_bytes: u64,
    pub utilization_percent: u8,
    pub reserved_percentage: u8,
    pub capabilities: CapabilitySet,
    pub sequence_no: u64,
    pub first_seen: DateTime<Utc>,
    pub last_report: DateTime<Utc>,
}

impl BackendDescriptor {
    fn from_report(report: BackendReport, now: DateTime<Utc>, first_seen: DateTime<Utc>) -> Self {
        Self {
            backend_id: report.backend_id,
            kind: report.kind,
            free_bytes: report.capacity.free_bytes,
            total_bytes: report.capacity.total_bytes,
            utilization_percent: report.capacity.utilization_percent.min(100),
            reserved_percentage: report.reserved_percentage.min(100),
            capabilities: report.capabilities,
            sequence_no: report.sequence_no,
            first_seen,
            last_report: now,
        }
    }

    /// Total capacity minus the reserved share
    pub fn usable_total_bytes(&self) -> u64 {
        let usable_pct = 100 - u64::from(self.reserved_percentage.min(100));
        ((self.total_bytes as u128 * usable_pct as u128) / 100) as u64
    }

    /// Check if the last report is older than `threshold`
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        let age = now.signed_duration_since(self.last_report);
        age.num_milliseconds() >= threshold.as_millis() as i64
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Immutable view of schedulable backends, ordered by backend id
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    backends: Vec<BackendDescriptor>,
    pub taken_at: DateTime<Utc>,
}

impl RegistrySnapshot {
    pub fn backends(&self) -> &[BackendDescriptor] {
        &self.backends
    }

    pub fn get(&self, backend_id: &BackendId) -> Option<&BackendDescriptor> {
        self.backends
            .binary_search_by(|b| b.backend_id.cmp(backend_id))
            .ok()
            .map(|idx| &self.backends[idx])
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
struct RegistryCounters {
    reports_accepted: AtomicU64,
    reports_rejected: AtomicU64,
    removals: AtomicU64,
}

/// Snapshot of registry statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_backends: u64,
    pub fresh_backends: u64,
    pub total_capacity_bytes: u64,
    pub free_capacity_bytes: u64,
    pub reports_accepted: u64,
    pub reports_rejected: u64,
    pub removals: u64,
}

// =============================================================================
// Capability Registry
// =============================================================================

type BackendMap = BTreeMap<BackendId, BackendDescriptor>;

/// Registry of backend capacity and capabilities
pub struct CapabilityRegistry {
    config: RegistryConfig,
    clock: ClockRef,
    /// Current published map
    current: RwLock<Arc<BackendMap>>,
    /// Serializes writers so no update is lost between clone and swap
    writer: Mutex<()>,
    counters: RegistryCounters,
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl CapabilityRegistry {
    /// Create a new registry on the wall clock
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a new registry on the given clock
    pub fn with_clock(config: RegistryConfig, clock: ClockRef) -> Arc<Self> {
        let (event_sender, _) = broadcast::channel(config.event_capacity.max(1));

        Arc::new(Self {
            config,
            clock,
            current: RwLock::new(Arc::new(BTreeMap::new())),
            writer: Mutex::new(()),
            counters: RegistryCounters::default(),
            event_sender,
        })
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    fn load(&self) -> Arc<BackendMap> {
        self.current.read().clone()
    }

    /// Accept a backend report
    ///
    /// Rejects with `StaleReport` any report whose sequence number is not
    /// strictly greater than the last accepted one for that backend.
    pub fn report(&self, report: BackendReport) -> Result<()> {
        if report.capacity.free_bytes > report.capacity.total_bytes {
            return Err(Error::Validation(format!(
                "backend {} reports free {} > total {}",
                report.backend_id, report.capacity.free_bytes, report.capacity.total_bytes
            )));
        }

        let _guard = self.writer.lock();
        let current = self.load();
        let now = self.clock.now();

        let first_seen = match current.get(&report.backend_id) {
            Some(existing) if report.sequence_no <= existing.sequence_no => {
                self.counters.reports_rejected.fetch_add(1, Ordering::Relaxed);
                let _ = self.event_sender.send(RegistryEvent::ReportRejected {
                    backend_id: report.backend_id.to_string(),
                    sequence_no: report.sequence_no,
                    last_accepted: existing.sequence_no,
                });
                return Err(Error::StaleReport {
                    backend: report.backend_id.to_string(),
                    received: report.sequence_no,
                    last_accepted: existing.sequence_no,
                });
            }
            Some(existing) => existing.first_seen,
            None => {
                info!(backend = %report.backend_id, kind = %report.kind, "Backend added to registry");
                let _ = self.event_sender.send(RegistryEvent::BackendAdded {
                    backend_id: report.backend_id.to_string(),
                });
                now
            }
        };

        let descriptor = BackendDescriptor::from_report(report, now, first_seen);
        debug!(
            backend = %descriptor.backend_id,
            seq = descriptor.sequence_no,
            free = descriptor.free_bytes,
            total = descriptor.total_bytes,
            "Accepted backend report"
        );

        let event = RegistryEvent::BackendReported {
            backend_id: descriptor.backend_id.to_string(),
            sequence_no: descriptor.sequence_no,
            free_bytes: descriptor.free_bytes,
            total_bytes: descriptor.total_bytes,
        };

        let mut next = (*current).clone();
        next.insert(descriptor.backend_id.clone(), descriptor);
        *self.current.write() = Arc::new(next);

        self.counters.reports_accepted.fetch_add(1, Ordering::Relaxed);
        let _ = self.event_sender.send(event);
        Ok(())
    }

    /// Snapshot of backends fresh enough to schedule on
    pub fn snapshot(&self) -> RegistrySnapshot {
        let current = self.load();
        let now = self.clock.now();
        let threshold = self.config.staleness_threshold;

        let backends: Vec<BackendDescriptor> = current
            .values()
            .filter(|b| {
                let stale = b.is_stale(now, threshold);
                if stale {
                    debug!(backend = %b.backend_id, "Excluding stale backend from snapshot");
                }
                !stale
            })
            .cloned()
            .collect();

        RegistrySnapshot {
            backends,
            taken_at: now,
        }
    }

    /// Get a backend by ID, stale or not
    pub fn get(&self, backend_id: &BackendId) -> Option<BackendDescriptor> {
        self.load().get(backend_id).cloned()
    }

    /// All known backends, including stale ones
    pub fn all(&self) -> Vec<BackendDescriptor> {
        self.load().values().cloned().collect()
    }

    /// Remove a backend (operator deregistration)
    pub fn remove(&self, backend_id: &BackendId) -> Result<()> {
        let _guard = self.writer.lock();
        let current = self.load();

        if !current.contains_key(backend_id) {
            return Err(Error::BackendNotFound {
                backend: backend_id.to_string(),
            });
        }

        let mut next = (*current).clone();
        next.remove(backend_id);
        *self.current.write() = Arc::new(next);

        warn!(backend = %backend_id, "Backend removed from registry");
        self.counters.removals.fetch_add(1, Ordering::Relaxed);
        let _ = self.event_sender.send(RegistryEvent::BackendRemoved {
            backend_id: backend_id.to_string(),
        });
        Ok(())
    }

    /// Get registry statistics
    pub fn stats(&self) -> RegistryStats {
        let current = self.load();
        let now = self.clock.now();
        let fresh = current
            .values()
            .filter(|b| !b.is_stale(now, self.config.staleness_threshold))
            .count();

        RegistryStats {
            total_backends: current.len() as u64,
            fresh_backends: fresh as u64,
            total_capacity_bytes: current.values().map(|b| b.total_bytes).sum(),
            free_capacity_bytes: current.values().map(|b| b.free_bytes).sum(),
            reports_accepted: self.counters.reports_accepted.load(Ordering::Relaxed),
            reports_rejected: self.counters.reports_rejected.load(Ordering::Relaxed),
            removals: self.counters.removals.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::ManualClock;
    use assert_matches::assert_matches;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn report(id: &str, seq: u64, free: u64, total: u64) -> BackendReport {
        BackendReport {
            backend_id: BackendId::new(id),
            kind: BackendKind::Lvm,
            capacity: CapacityReport {
                free_bytes: free,
                total_bytes: total,
                utilization_percent: 10,
                ..Default::default()
            },
            capabilities: CapabilitySet::default(),
            reserved_percentage: 0,
            sequence_no: seq,
        }
    }

    #[test]
    fn test_report_and_snapshot() {
        let registry = CapabilityRegistry::new(RegistryConfig::default());
        registry.report(report("lvm-b", 1, 5 * GIB, 10 * GIB)).unwrap();
        registry.report(report("lvm-a", 1, 15 * GIB, 20 * GIB)).unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        // Ordered by backend id
        assert_eq!(snapshot.backends()[0].backend_id.as_str(), "lvm-a");
        assert_eq!(
            snapshot.get(&BackendId::new("lvm-b")).unwrap().free_bytes,
            5 * GIB
        );
    }

    #[test]
    fn test_stale_report_never_overwrites() {
        let registry = CapabilityRegistry::new(RegistryConfig::default());
        registry.report(report("lvm-a", 5, 8 * GIB, 10 * GIB)).unwrap();

        let result = registry.report(report("lvm-a", 4, 1 * GIB, 10 * GIB));
        assert_matches!(
            result,
            Err(Error::StaleReport { received: 4, last_accepted: 5, .. })
        );

        // Equal sequence is stale too
        assert!(registry.report(report("lvm-a", 5, 2 * GIB, 10 * GIB)).is_err());

        let entry = registry.get(&BackendId::new("lvm-a")).unwrap();
        assert_eq!(entry.free_bytes, 8 * GIB);
        assert_eq!(entry.sequence_no, 5);
        assert_eq!(registry.stats().reports_rejected, 2);
    }

    #[test]
    fn test_stale_backend_excluded_but_kept() {
        let clock = ManualClock::new(Utc::now());
        let config = RegistryConfig {
            staleness_threshold: Duration::from_secs(60),
            ..Default::default()
        };
        let registry = CapabilityRegistry::with_clock(config, clock.clone());
        registry.report(report("lvm-a", 1, GIB, GIB)).unwrap();

        clock.advance(Duration::from_secs(61));
        assert!(registry.snapshot().is_empty());
        assert_eq!(registry.all().len(), 1);

        // Recovers on the next report
        registry.report(report("lvm-a", 2, GIB, GIB)).unwrap();
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let registry = CapabilityRegistry::new(RegistryConfig::default());
        registry.report(report("lvm-a", 1, 4 * GIB, 10 * GIB)).unwrap();

        let snapshot = registry.snapshot();
        registry.report(report("lvm-a", 2, 1 * GIB, 10 * GIB)).unwrap();

        assert_eq!(snapshot.backends()[0].free_bytes, 4 * GIB);
        assert_eq!(registry.snapshot().backends()[0].free_bytes, GIB);
    }

    #[test]
    fn test_reject_inconsistent_capacity() {
        let registry = CapabilityRegistry::new(RegistryConfig::default());
        let result = registry.report(report("lvm-a", 1, 11 * GIB, 10 * GIB));
        assert_matches!(result, Err(Error::Validation(_)));
    }

    #[test]
    fn test_usable_total_with_reserved_share() {
        let registry = CapabilityRegistry::new(RegistryConfig::default());
        let mut r = report("lvm-a", 1, 100 * GIB, 100 * GIB);
        r.reserved_percentage = 10;
        registry.report(r).unwrap();

        let entry = registry.get(&BackendId::new("lvm-a")).unwrap();
        assert_eq!(entry.usable_total_bytes(), 90 * GIB);
    }

    #[test]
    fn test_remove_backend() {
        let registry = CapabilityRegistry::new(RegistryConfig::default());
        let mut events = registry.subscribe();
        registry.report(report("lvm-a", 1, GIB, GIB)).unwrap();

        registry.remove(&BackendId::new("lvm-a")).unwrap();
        assert!(registry.get(&BackendId::new("lvm-a")).is_none());
        assert_matches!(
            registry.remove(&BackendId::new("lvm-a")),
            Err(Error::BackendNotFound { .. })
        );

        assert_matches!(events.try_recv(), Ok(RegistryEvent::BackendAdded { .. }));
        assert_matches!(events.try_recv(), Ok(RegistryEvent::BackendReported { .. }));
        assert_matches!(events.try_recv(), Ok(RegistryEvent::BackendRemoved { .. }));
    }
}
