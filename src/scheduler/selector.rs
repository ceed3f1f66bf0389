//! Backend Selector
//!
//! Runs the filter and weigh pipeline over a registry snapshot and turns the
//! winner into a persisted reservation. The reservation is a version-guarded
//! write on the backend's capacity ledger; losing that race means someone
//! else consumed headroom first, so the whole pipeline runs again.

use super::filters::{capability_filter, capacity_filter, Candidate};
use super::ledger::{ledger_write, load_ledger, CapacityLedger, Reservation};
use super::weigher::{weigh, WeigherConfig};
use crate::domain::clock::{ClockRef, SystemClock};
use crate::domain::ids::generate_id;
use crate::domain::ports::{BackendId, CapabilityRequirements, StateStoreRef, WriteOp};
use crate::error::{Error, Result};
use crate::registry::CapabilityRegistry;
use crate::store::{keys, list_json};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Ranking weights
    #[serde(flatten)]
    pub weights: WeigherConfig,
    /// How long a pick counts against a backend in the ranking
    #[serde(with = "crate::registry::duration_secs")]
    pub recency_window: Duration,
    /// Upper bound on reservation races lost before giving up
    pub max_reservation_attempts: u32,
    /// Age past which a reservation no flow accounts for is swept
    #[serde(default = "default_reservation_ttl", with = "crate::registry::duration_secs")]
    pub reservation_ttl: Duration,
}

fn default_reservation_ttl() -> Duration {
    Duration::from_secs(600)
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            weights: WeigherConfig::default(),
            recency_window: Duration::from_secs(60),
            max_reservation_attempts: 16,
            reservation_ttl: default_reservation_ttl(),
        }
    }
}

// =============================================================================
// Request / Placement
// =============================================================================

/// What the scheduler is asked to place
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingRequest {
    pub volume_id: String,
    pub size_bytes: u64,
    pub capabilities: CapabilityRequirements,
}

/// Result of a successful selection
#[derive(Debug, Clone)]
pub struct Placement {
    pub backend_id: BackendId,
    pub reservation: Reservation,
    pub score: f64,
}

#[derive(Debug, Default)]
struct SchedulerCounters {
    placements: AtomicU64,
    no_capable_backend: AtomicU64,
    capacity_exhausted: AtomicU64,
    reservation_conflicts: AtomicU64,
}

/// Snapshot of scheduler statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub placements: u64,
    pub no_capable_backend: u64,
    pub capacity_exhausted: u64,
    pub reservation_conflicts: u64,
}

// =============================================================================
// Scheduler
// =============================================================================

/// Filter-and-weigh backend scheduler
pub struct Scheduler {
    config: SchedulerConfig,
    registry: Arc<CapabilityRegistry>,
    store: StateStoreRef,
    clock: ClockRef,
    recent: Mutex<HashMap<BackendId, VecDeque<DateTime<Utc>>>>,
    counters: SchedulerCounters,
}

impl Scheduler {
    /// Create a new scheduler on the wall clock
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<CapabilityRegistry>,
        store: StateStoreRef,
    ) -> Arc<Self> {
        Self::with_clock(config, registry, store, Arc::new(SystemClock))
    }

    /// Create a new scheduler on the given clock
    pub fn with_clock(
        config: SchedulerConfig,
        registry: Arc<CapabilityRegistry>,
        store: StateStoreRef,
        clock: ClockRef,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            store,
            clock,
            recent: Mutex::new(HashMap::new()),
            counters: SchedulerCounters::default(),
        })
    }

    fn attempts(&self) -> u32 {
        self.config.max_reservation_attempts.max(1)
    }

    /// Pick a backend and reserve capacity on it
    pub async fn select(&self, request: &SchedulingRequest) -> Result<Placement> {
        if request.size_bytes == 0 {
            return Err(Error::Validation("size must be greater than zero".into()));
        }

        let mut last_error = None;

        for attempt in 1..=self.attempts() {
            let snapshot = self.registry.snapshot();

            let capable = capability_filter(&snapshot, &request.capabilities);
            if capable.is_empty() {
                self.counters
                    .no_capable_backend
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    volume_id = %request.volume_id,
                    requirements = %request.capabilities,
                    backends = snapshot.len(),
                    "No backend satisfies requested capabilities"
                );
                return Err(Error::NoCapableBackend {
                    requirements: request.capabilities.to_string(),
                });
            }

            let mut candidates = Vec::with_capacity(capable.len());
            for backend in capable {
                let (ledger, ledger_version) =
                    load_ledger(self.store.as_ref(), &backend.backend_id).await?;
                let headroom_bytes = ledger.headroom(backend);
                candidates.push(Candidate {
                    backend: backend.clone(),
                    ledger,
                    ledger_version,
                    headroom_bytes,
                });
            }

            let best_available = candidates
                .iter()
                .map(|c| c.headroom_bytes)
                .max()
                .unwrap_or(0);

            let fitting = capacity_filter(candidates, request.size_bytes);
            if fitting.is_empty() {
                self.counters
                    .capacity_exhausted
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    volume_id = %request.volume_id,
                    requested = request.size_bytes,
                    best_available,
                    "No capable backend has enough headroom"
                );
                return Err(Error::CapacityExhausted {
                    requested: request.size_bytes,
                    available: best_available,
                });
            }

            let ranked = weigh(fitting, &self.config.weights, &self.recent_picks());
            let best = match ranked.into_iter().next() {
                Some(best) => best,
                None => return Err(Error::Internal("empty ranking".into())),
            };
            let backend_id = best.candidate.backend.backend_id.clone();

            match self
                .try_reserve(best.candidate, &request.volume_id, request.size_bytes)
                .await
            {
                Ok(reservation) => {
                    self.record_pick(&backend_id);
                    self.counters.placements.fetch_add(1, Ordering::Relaxed);
                    info!(
                        volume_id = %request.volume_id,
                        backend = %backend_id,
                        reservation = %reservation.id,
                        size = request.size_bytes,
                        score = best.score,
                        "Volume placed"
                    );
                    return Ok(Placement {
                        backend_id,
                        reservation,
                        score: best.score,
                    });
                }
                Err(e @ Error::Conflict { .. }) => {
                    self.counters
                        .reservation_conflicts
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(
                        volume_id = %request.volume_id,
                        backend = %backend_id,
                        attempt,
                        "Reservation raced, re-evaluating"
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Internal("no reservation attempt made".into())))
    }

    async fn try_reserve(
        &self,
        candidate: Candidate,
        volume_id: &str,
        size_bytes: u64,
    ) -> Result<Reservation> {
        let backend_id = candidate.backend.backend_id;
        let mut ledger = candidate.ledger;

        let reservation = Reservation {
            id: generate_id("rsv"),
            backend_id: backend_id.clone(),
            volume_id: volume_id.to_string(),
            size_bytes,
            created_at: self.clock.now(),
        };
        ledger.add_reservation(reservation.clone());

        self.store
            .commit(vec![ledger_write(
                &backend_id,
                &ledger,
                candidate.ledger_version,
            )?])
            .await?;

        Ok(reservation)
    }

    /// Reserve `delta_bytes` more on the backend that already hosts a volume
    ///
    /// Used by extend, which never moves a volume, and by clones, which land
    /// next to their source snapshot.
    pub async fn reserve_on(
        &self,
        backend_id: &BackendId,
        volume_id: &str,
        delta_bytes: u64,
    ) -> Result<Reservation> {
        let mut last_error = None;

        for _ in 0..self.attempts() {
            let snapshot = self.registry.snapshot();
            let backend = snapshot
                .get(backend_id)
                .ok_or_else(|| Error::BackendUnavailable {
                    backend: backend_id.to_string(),
                })?;

            let (ledger, ledger_version) = load_ledger(self.store.as_ref(), backend_id).await?;
            let headroom_bytes = ledger.headroom(backend);
            if headroom_bytes < delta_bytes {
                self.counters
                    .capacity_exhausted
                    .fetch_add(1, Ordering::Relaxed);
                return Err(Error::CapacityExhausted {
                    requested: delta_bytes,
                    available: headroom_bytes,
                });
            }

            let candidate = Candidate {
                backend: backend.clone(),
                ledger,
                ledger_version,
                headroom_bytes,
            };
            match self.try_reserve(candidate, volume_id, delta_bytes).await {
                Ok(reservation) => {
                    debug!(
                        volume_id,
                        backend = %backend_id,
                        delta = delta_bytes,
                        "Extension capacity reserved"
                    );
                    return Ok(reservation);
                }
                Err(e @ Error::Conflict { .. }) => {
                    self.counters
                        .reservation_conflicts
                        .fetch_add(1, Ordering::Relaxed);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Internal("no reservation attempt made".into())))
    }

    /// Drop a reservation
    ///
    /// Returns false when it was no longer active (already committed or
    /// released).
    pub async fn release(&self, reservation: &Reservation) -> Result<bool> {
        let mut last_error = None;

        for _ in 0..self.attempts() {
            let (mut ledger, version) =
                load_ledger(self.store.as_ref(), &reservation.backend_id).await?;
            if ledger.release(&reservation.id).is_none() {
                return Ok(false);
            }

            match self
                .store
                .commit(vec![ledger_write(&reservation.backend_id, &ledger, version)?])
                .await
            {
                Ok(_) => {
                    debug!(
                        reservation = %reservation.id,
                        backend = %reservation.backend_id,
                        "Reservation released"
                    );
                    return Ok(true);
                }
                Err(e @ Error::Conflict { .. }) => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Internal("no release attempt made".into())))
    }

    /// Ledger write turning a reservation into committed usage
    ///
    /// `None` when the reservation is no longer active. The write is not
    /// committed here; callers bundle it with their own writes.
    pub async fn commit_op(
        &self,
        backend_id: &BackendId,
        reservation_id: &str,
    ) -> Result<Option<WriteOp>> {
        let (mut ledger, version) = load_ledger(self.store.as_ref(), backend_id).await?;
        if !ledger.commit(reservation_id) {
            return Ok(None);
        }
        Ok(Some(ledger_write(backend_id, &ledger, version)?))
    }

    /// Ledger write returning committed usage after a delete
    pub async fn free_op(&self, backend_id: &BackendId, bytes: u64) -> Result<WriteOp> {
        let (mut ledger, version) = load_ledger(self.store.as_ref(), backend_id).await?;
        ledger.free(bytes);
        ledger_write(backend_id, &ledger, version)
    }

    /// Active reservations older than the configured TTL, across all backends
    pub async fn expired_reservations(&self) -> Result<Vec<Reservation>> {
        let ttl = chrono::Duration::from_std(self.config.reservation_ttl)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = self.clock.now() - ttl;

        Ok(list_json::<CapacityLedger>(self.store.as_ref(), keys::CAPACITY)
            .await?
            .into_iter()
            .flat_map(|(ledger, _)| ledger.reservations.into_values())
            .filter(|reservation| reservation.created_at < cutoff)
            .collect())
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Current ledger of a backend
    pub async fn ledger(&self, backend_id: &BackendId) -> Result<CapacityLedger> {
        Ok(load_ledger(self.store.as_ref(), backend_id).await?.0)
    }

    fn record_pick(&self, backend_id: &BackendId) {
        let now = self.clock.now();
        self.recent
            .lock()
            .entry(backend_id.clone())
            .or_default()
            .push_back(now);
    }

    fn recent_picks(&self) -> HashMap<BackendId, u32> {
        let window = chrono::Duration::from_std(self.config.recency_window)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = self.clock.now() - window;

        let mut recent = self.recent.lock();
        recent.retain(|_, picks| {
            while picks.front().map(|t| *t < cutoff).unwrap_or(false) {
                picks.pop_front();
            }
            !picks.is_empty()
        });

        recent
            .iter()
            .map(|(id, picks)| (id.clone(), picks.len() as u32))
            .collect()
    }

    /// Get scheduler statistics
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            placements: self.counters.placements.load(Ordering::Relaxed),
            no_capable_backend: self.counters.no_capable_backend.load(Ordering::Relaxed),
            capacity_exhausted: self.counters.capacity_exhausted.load(Ordering::Relaxed),
            reservation_conflicts: self.counters.reservation_conflicts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::ManualClock;
    use crate::domain::ports::{BackendKind, CapabilitySet, CapacityReport, StateStore};
    use crate::registry::{BackendReport, RegistryConfig};
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn report(id: &str, free: u64, total: u64) -> BackendReport {
        BackendReport {
            backend_id: BackendId::new(id),
            kind: BackendKind::Lvm,
            capacity: CapacityReport {
                free_bytes: free,
                total_bytes: total,
                utilization_percent: 10,
                ..Default::default()
            },
            capabilities: CapabilitySet {
                volume_types: ["ssd".to_string()].into(),
                max_replication: 1,
                ..Default::default()
            },
            reserved_percentage: 0,
            sequence_no: 1,
        }
    }

    fn setup(reports: Vec<BackendReport>) -> (Arc<Scheduler>, Arc<MemoryStore>) {
        let registry = CapabilityRegistry::new(RegistryConfig::default());
        for r in reports {
            registry.report(r).unwrap();
        }
        let store = Arc::new(MemoryStore::new());
        let scheduler = Scheduler::new(SchedulerConfig::default(), registry, store.clone());
        (scheduler, store)
    }

    fn request(volume_id: &str, size: u64) -> SchedulingRequest {
        SchedulingRequest {
            volume_id: volume_id.into(),
            size_bytes: size,
            capabilities: CapabilityRequirements {
                volume_type: Some("ssd".into()),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_places_on_backend_with_room() {
        let (scheduler, _) = setup(vec![
            report("a", 15 * GIB, 15 * GIB),
            report("b", 5 * GIB, 5 * GIB),
        ]);

        let placement = scheduler.select(&request("vol-1", 10 * GIB)).await.unwrap();
        assert_eq!(placement.backend_id.as_str(), "a");

        let ledger = scheduler.ledger(&BackendId::new("a")).await.unwrap();
        assert_eq!(ledger.reserved_bytes(), 10 * GIB);

        // A second 10 GiB request cannot fit anywhere now
        let err = scheduler.select(&request("vol-2", 10 * GIB)).await.unwrap_err();
        assert_matches!(
            err,
            Error::CapacityExhausted { requested, available }
                if requested == 10 * GIB && available == 5 * GIB
        );
    }

    #[tokio::test]
    async fn test_no_capable_backend() {
        let (scheduler, _) = setup(vec![report("a", 15 * GIB, 15 * GIB)]);

        let mut req = request("vol-1", GIB);
        req.capabilities.encrypted = true;
        assert_matches!(
            scheduler.select(&req).await,
            Err(Error::NoCapableBackend { .. })
        );
        assert_eq!(scheduler.stats().no_capable_backend, 1);
    }

    #[tokio::test]
    async fn test_reserved_percentage_shrinks_headroom() {
        let mut r = report("a", 10 * GIB, 10 * GIB);
        r.reserved_percentage = 50;
        let (scheduler, _) = setup(vec![r]);

        assert_matches!(
            scheduler.select(&request("vol-1", 6 * GIB)).await,
            Err(Error::CapacityExhausted { .. })
        );
        assert!(scheduler.select(&request("vol-1", 5 * GIB)).await.is_ok());
    }

    #[tokio::test]
    async fn test_release_and_commit() {
        let (scheduler, store) = setup(vec![report("a", 10 * GIB, 10 * GIB)]);
        let backend = BackendId::new("a");

        let placement = scheduler.select(&request("vol-1", 4 * GIB)).await.unwrap();
        let op = scheduler
            .commit_op(&backend, &placement.reservation.id)
            .await
            .unwrap()
            .unwrap();
        store.commit(vec![op]).await.unwrap();

        let ledger = scheduler.ledger(&backend).await.unwrap();
        assert_eq!(ledger.committed_bytes, 4 * GIB);
        assert_eq!(ledger.reserved_bytes(), 0);

        // Already committed: nothing left to commit or release
        assert!(scheduler
            .commit_op(&backend, &placement.reservation.id)
            .await
            .unwrap()
            .is_none());
        assert!(!scheduler.release(&placement.reservation).await.unwrap());

        let placement = scheduler.select(&request("vol-2", 2 * GIB)).await.unwrap();
        assert!(scheduler.release(&placement.reservation).await.unwrap());
        assert_eq!(scheduler.ledger(&backend).await.unwrap().reserved_bytes(), 0);
    }

    #[tokio::test]
    async fn test_reserve_on_existing_backend() {
        let (scheduler, _) = setup(vec![
            report("a", 4 * GIB, 4 * GIB),
            report("b", 50 * GIB, 50 * GIB),
        ]);
        let backend = BackendId::new("a");

        let reservation = scheduler.reserve_on(&backend, "vol-1", 3 * GIB).await.unwrap();
        assert_eq!(reservation.backend_id, backend);

        // Never spills over to another backend
        assert_matches!(
            scheduler.reserve_on(&backend, "vol-1", 2 * GIB).await,
            Err(Error::CapacityExhausted { .. })
        );
        assert_matches!(
            scheduler
                .reserve_on(&BackendId::new("missing"), "vol-1", GIB)
                .await,
            Err(Error::BackendUnavailable { .. })
        );
    }

    #[tokio::test]
    async fn test_expired_reservations() {
        let registry = CapabilityRegistry::new(RegistryConfig::default());
        registry.report(report("a", 10 * GIB, 10 * GIB)).unwrap();
        registry.report(report("b", 10 * GIB, 10 * GIB)).unwrap();
        let clock = ManualClock::new(Utc::now());
        let config = SchedulerConfig {
            reservation_ttl: Duration::from_secs(60),
            ..Default::default()
        };
        let scheduler = Scheduler::with_clock(
            config,
            registry,
            Arc::new(MemoryStore::new()),
            clock.clone(),
        );

        let old = scheduler.select(&request("vol-old", GIB)).await.unwrap();
        clock.advance(Duration::from_secs(45));
        let young = scheduler.select(&request("vol-young", GIB)).await.unwrap();
        assert!(scheduler.expired_reservations().await.unwrap().is_empty());

        clock.advance(Duration::from_secs(30));
        let expired = scheduler.expired_reservations().await.unwrap();
        assert_eq!(expired, vec![old.reservation.clone()]);

        // Committed reservations are no longer swept
        let op = scheduler
            .commit_op(&old.backend_id, &old.reservation.id)
            .await
            .unwrap()
            .unwrap();
        scheduler.store.commit(vec![op]).await.unwrap();
        clock.advance(Duration::from_secs(30));
        let expired = scheduler.expired_reservations().await.unwrap();
        assert_eq!(expired, vec![young.reservation]);
    }

    #[tokio::test]
    async fn test_recent_picks_spread_load() {
        let (scheduler, _) = setup(vec![
            report("a", 100 * GIB, 100 * GIB),
            report("b", 100 * GIB, 100 * GIB),
        ]);

        let first = scheduler.select(&request("vol-1", GIB)).await.unwrap();
        let second = scheduler.select(&request("vol-2", GIB)).await.unwrap();
        assert_eq!(first.backend_id.as_str(), "a");
        assert_eq!(second.backend_id.as_str(), "b");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_selects_never_overcommit() {
        let registry = CapabilityRegistry::new(RegistryConfig::default());
        registry.report(report("a", 10 * GIB, 10 * GIB)).unwrap();
        let store = Arc::new(MemoryStore::new());
        let config = SchedulerConfig {
            max_reservation_attempts: 100,
            ..Default::default()
        };
        let scheduler = Scheduler::new(config, registry, store);

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let scheduler = scheduler.clone();
                tokio::spawn(async move { scheduler.select(&request(&format!("vol-{}", i), GIB)).await })
            })
            .collect();

        let mut placed = 0;
        for task in futures::future::join_all(tasks).await {
            match task.unwrap() {
                Ok(_) => placed += 1,
                Err(e) => assert_matches!(e, Error::CapacityExhausted { .. }),
            }
        }

        assert_eq!(placed, 10);
        let ledger = scheduler.ledger(&BackendId::new("a")).await.unwrap();
        assert_eq!(ledger.reserved_bytes(), 10 * GIB);
    }
}
