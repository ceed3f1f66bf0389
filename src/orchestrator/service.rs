//! Orchestrator - entry point for volume lifecycle requests
//!
//! ```text
//! validate -> lock volume/<id> -> schedule -> begin + flow record (one commit)
//!          -> steps -> resolve + ledger + flow status (one commit)
//!          -> release lock -> one terminal event
//! ```
//!
//! `Busy` and `Conflict` are retried with bounded exponential backoff,
//! re-reading the volume on every attempt. A flow this worker could not
//! drive to a terminal status (lost its lease, store unreachable) is left
//! to `resume_pending`, which also reports its terminal event. A flow whose
//! first write never landed left nothing behind: its reservation is handed
//! back here and the failure is reported here.

use super::completion::VolumeCompletion;
use super::config::OrchestratorConfig;
use super::flows::VolumeFlows;
use super::request::{VolumeHandle, VolumeOperation, VolumeRequest};
use crate::domain::clock::{ClockRef, SystemClock};
use crate::domain::events::{OperationKind, RequestOutcome, VolumeEvent};
use crate::domain::ids::generate_id;
use crate::domain::ports::{BackendId, EventPublisherRef, StateStoreRef, WriteOp};
use crate::drivers::{DriverEntry, DriverSet};
use crate::error::{Error, ErrorAction, Result};
use crate::locking::{volume_resource, LockHandle, LockService, LockStats};
use crate::metrics::OrchestratorMetrics;
use crate::registry::{BackendDescriptor, BackendReport, CapabilityRegistry, RegistryStats};
use crate::scheduler::{Placement, Reservation, Scheduler, SchedulerStats, SchedulingRequest};
use crate::store::{keys, list_json, load_json};
use crate::taskflow::{
    FlowBuilder, FlowContext, FlowEngine, FlowOutcome, FlowRecord, FlowStats, FlowStatus,
    RunOptions,
};
use crate::volume::{Snapshot, SnapshotStatus, Volume, VolumeStateMachine};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Status
// =============================================================================

/// Orchestrator status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    pub healthy: bool,
    pub worker_id: String,
    pub version: String,
    pub backends: RegistryStats,
    pub volumes_by_state: BTreeMap<String, u64>,
    pub pending_flows: u64,
    pub flows: FlowStats,
    pub scheduler: SchedulerStats,
    pub locks: LockStats,
    /// Live leases held by any worker sharing the store
    pub live_locks: u64,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Coordinates registry, scheduler, locks, flows and the volume state machine
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: StateStoreRef,
    clock: ClockRef,
    registry: Arc<CapabilityRegistry>,
    locks: Arc<LockService>,
    scheduler: Arc<Scheduler>,
    engine: Arc<FlowEngine>,
    machine: Arc<VolumeStateMachine>,
    drivers: Arc<DriverSet>,
    flows: VolumeFlows,
    events: EventPublisherRef,
    metrics: Arc<OrchestratorMetrics>,
    /// Cancellation tokens of requests in flight, by request id
    inflight: DashMap<String, CancellationToken>,
}

impl Orchestrator {
    /// Create a new orchestrator
    pub fn new(
        config: OrchestratorConfig,
        store: StateStoreRef,
        drivers: Arc<DriverSet>,
        events: EventPublisherRef,
    ) -> Result<Arc<Self>> {
        Self::with_clock(config, store, drivers, events, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: OrchestratorConfig,
        store: StateStoreRef,
        drivers: Arc<DriverSet>,
        events: EventPublisherRef,
        clock: ClockRef,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let registry = CapabilityRegistry::with_clock(config.registry.clone(), clock.clone());
        let locks = LockService::with_clock(config.locking.clone(), store.clone(), clock.clone());
        let scheduler = Scheduler::with_clock(
            config.scheduler.clone(),
            registry.clone(),
            store.clone(),
            clock.clone(),
        );
        let engine = FlowEngine::with_clock(
            config.flows.clone(),
            store.clone(),
            locks.clone(),
            clock.clone(),
        );
        let machine = VolumeStateMachine::with_clock(store.clone(), clock.clone());
        let flows = VolumeFlows::new(drivers.clone(), scheduler.clone());
        let metrics = OrchestratorMetrics::new()?;

        info!(
            worker_id = %config.worker_id,
            backends = drivers.len(),
            "Orchestrator created"
        );

        Ok(Arc::new(Self {
            config,
            store,
            clock,
            registry,
            locks,
            scheduler,
            engine,
            machine,
            drivers,
            flows,
            events,
            metrics,
            inflight: DashMap::new(),
        }))
    }

    /// Pull a first round of backend reports and settle flows left behind
    pub async fn initialize(&self) -> Result<()> {
        let polled = self.poll_backends().await;
        let resumed = self.resume_pending().await?;
        info!(polled, resumed, "Orchestrator initialized");
        Ok(())
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn locks(&self) -> &Arc<LockService> {
        &self.locks
    }

    pub fn engine(&self) -> &Arc<FlowEngine> {
        &self.engine
    }

    pub fn drivers(&self) -> &Arc<DriverSet> {
        &self.drivers
    }

    pub fn metrics(&self) -> &Arc<OrchestratorMetrics> {
        &self.metrics
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Run a lifecycle request to its terminal result
    ///
    /// Exactly one `VolumeEvent` is published for the request: here, or by
    /// `resume_pending` when the flow outlived this worker.
    pub async fn handle(&self, request: VolumeRequest) -> Result<VolumeHandle> {
        let operation = request.operation.kind();
        let volume_id = request
            .operation
            .volume_id()
            .map(str::to_string)
            .unwrap_or_else(|| generate_id("vol"));
        let flow_id = generate_id("flow");
        let token = CancellationToken::new();
        self.inflight
            .insert(request.request_id.clone(), token.clone());

        info!(
            request_id = %request.request_id,
            %operation,
            %volume_id,
            "Handling request"
        );

        let deferred = AtomicBool::new(false);
        let result = match request.operation.validate() {
            Ok(()) => {
                self.execute(&request, &volume_id, &flow_id, &token, &deferred)
                    .await
            }
            Err(e) => Err(e),
        };
        self.inflight.remove(&request.request_id);

        match &result {
            Ok(_) => {
                self.metrics.request_finished(operation, "completed");
                info!(request_id = %request.request_id, %operation, %volume_id, "Request completed");
            }
            Err(e) => {
                self.metrics.request_finished(operation, e.code());
                warn!(
                    request_id = %request.request_id,
                    %operation,
                    %volume_id,
                    error = %e,
                    "Request failed"
                );
            }
        }

        if result.is_err() && deferred.load(Ordering::SeqCst) {
            warn!(
                request_id = %request.request_id,
                %flow_id,
                "Flow left for resumption, terminal event deferred"
            );
        } else {
            let outcome = match &result {
                Ok(_) => RequestOutcome::Completed,
                Err(e) => RequestOutcome::Failed {
                    code: e.code().to_string(),
                    reason: e.to_string(),
                },
            };
            self.emit(&request.request_id, &volume_id, operation, outcome)
                .await;
        }

        result
    }

    /// Cancel a request that has not started its flow yet
    ///
    /// Returns false for unknown or already finished requests. A request
    /// whose flow is running finishes regardless.
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.inflight.get(request_id) {
            Some(token) => {
                token.cancel();
                info!(request_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    async fn execute(
        &self,
        request: &VolumeRequest,
        volume_id: &str,
        flow_id: &str,
        token: &CancellationToken,
        deferred: &AtomicBool,
    ) -> Result<VolumeHandle> {
        backoff::future::retry(self.config.retry.backoff(), || async move {
            if token.is_cancelled() {
                return Err(backoff::Error::permanent(Error::FlowCancelled {
                    flow_id: flow_id.to_string(),
                }));
            }

            self.attempt(request, volume_id, flow_id, token, deferred)
                .await
                .map_err(|e| {
                    // A started flow belongs to its resumer from here on
                    if e.is_transient() && !deferred.load(Ordering::SeqCst) {
                        debug!(volume_id, error = %e, "Contention, backing off");
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
        })
        .await
    }

    async fn attempt(
        &self,
        request: &VolumeRequest,
        volume_id: &str,
        flow_id: &str,
        token: &CancellationToken,
        deferred: &AtomicBool,
    ) -> Result<VolumeHandle> {
        // Only volumes that exist or are being created get a lock record
        if request.operation.kind() != OperationKind::Create {
            self.machine.get(volume_id).await?;
        }

        let mut lock = self
            .locks
            .acquire(&volume_resource(volume_id), &self.config.worker_id, None)
            .await?;

        let result = self
            .run_locked(request, volume_id, flow_id, token, &mut lock, deferred)
            .await;

        self.unlock(volume_id, &lock).await;
        result
    }

    /// Release a volume lock, dropping its record when no volume was written
    async fn unlock(&self, volume_id: &str, lock: &LockHandle) {
        let result = match self.machine.get(volume_id).await {
            Err(Error::VolumeNotFound { .. }) => self.locks.retire(lock).await,
            _ => self.locks.release(lock).await,
        };
        if let Err(e) = result {
            warn!(volume_id, error = %e, "Failed to release volume lock");
        }
    }

    async fn run_locked(
        &self,
        request: &VolumeRequest,
        volume_id: &str,
        flow_id: &str,
        token: &CancellationToken,
        lock: &mut LockHandle,
        deferred: &AtomicBool,
    ) -> Result<VolumeHandle> {
        let fence = lock.fencing_token();
        let (ctx, begin) = self.prepare(request, volume_id, flow_id, fence).await?;
        let reservation = ctx.reservation.clone();
        let operation = ctx.operation;
        let definition = self.flows.build(operation);
        let completion = self.completion(fence);
        let started = Instant::now();

        let run = self
            .engine
            .run(
                &definition,
                ctx,
                RunOptions {
                    lock: Some(lock),
                    cancel: Some(token.clone()),
                    initial_writes: vec![begin],
                    completion: Some(&completion),
                },
            )
            .await;

        let outcome = match run {
            Ok(outcome) => outcome,
            Err(e @ Error::FlowNotStarted { .. }) => {
                if let Some(reservation) = &reservation {
                    self.release_reservation(reservation).await;
                }
                return Err(e.into_cause());
            }
            Err(e) => {
                deferred.store(true, Ordering::SeqCst);
                return Err(e);
            }
        };

        self.metrics.flow_finished(
            operation,
            &outcome.status().to_string(),
            started.elapsed().as_secs_f64(),
        );

        match outcome {
            FlowOutcome::Success(ctx) => self.finish(request, flow_id, ctx).await,
            FlowOutcome::Failed { error, status, .. } => {
                if let Some(reservation) = &reservation {
                    self.release_reservation(reservation).await;
                }
                if status == FlowStatus::CompensationFailed {
                    error!(
                        %flow_id,
                        %volume_id,
                        error = %error,
                        "Compensation failed, volume needs operator attention"
                    );
                }
                Err(error)
            }
        }
    }

    /// Flow context and the write that moves the volume into progress
    async fn prepare(
        &self,
        request: &VolumeRequest,
        volume_id: &str,
        flow_id: &str,
        fence: u64,
    ) -> Result<(FlowContext, WriteOp)> {
        let operation = request.operation.kind();
        let ctx = FlowContext::new(flow_id, &request.request_id, volume_id, operation, fence);

        match &request.operation {
            VolumeOperation::Create {
                name,
                size_bytes,
                capabilities,
                ..
            } => {
                let fresh = Volume::new(
                    volume_id,
                    name.clone(),
                    *size_bytes,
                    capabilities.clone(),
                    self.clock.now(),
                );
                self.prepare_create(ctx, fresh, None).await
            }
            VolumeOperation::CreateFromSnapshot {
                name,
                snapshot_id,
                size_bytes,
                ..
            } => {
                let snapshot = self.get_snapshot(snapshot_id).await?;
                let snapshot_ref = match (&snapshot.status, &snapshot.snapshot_ref) {
                    (SnapshotStatus::Available, Some(snapshot_ref)) => snapshot_ref.clone(),
                    _ => {
                        return Err(Error::Validation(format!(
                            "snapshot {} is not available",
                            snapshot_id
                        )))
                    }
                };
                let size_bytes = size_bytes.unwrap_or(snapshot.size_bytes);
                if size_bytes < snapshot.size_bytes {
                    return Err(Error::Validation(format!(
                        "snapshot {} is {} bytes, a clone cannot be smaller",
                        snapshot_id, snapshot.size_bytes
                    )));
                }

                // Clones keep the source volume's requirements
                let source = self.machine.get(&snapshot.volume_id).await?;
                let fresh = Volume::new(
                    volume_id,
                    name.clone(),
                    size_bytes,
                    source.requirements,
                    self.clock.now(),
                );
                self.prepare_create(ctx, fresh, Some((snapshot.backend_id, snapshot_ref)))
                    .await
            }
            _ => self.prepare_existing(request, volume_id, ctx).await,
        }
    }

    /// Place a new volume, or a retried one, and write it into `creating`
    ///
    /// A clone source pins placement to the snapshot's backend.
    async fn prepare_create(
        &self,
        mut ctx: FlowContext,
        fresh: Volume,
        source: Option<(BackendId, String)>,
    ) -> Result<(FlowContext, WriteOp)> {
        let (volume, begin) = match self.machine.get(&fresh.id).await {
            Ok(existing) => self.machine.begin_op(&existing, ctx.operation, ctx.fence)?,
            Err(Error::VolumeNotFound { .. }) => self.machine.create_op(fresh, ctx.fence)?,
            Err(e) => return Err(e),
        };

        let (backend_id, reservation) = match source {
            Some((backend_id, snapshot_ref)) => {
                let reservation = self
                    .scheduler
                    .reserve_on(&backend_id, &volume.id, volume.size_bytes)
                    .await
                    .map_err(|e| self.scheduling_failed(e))?;
                ctx.source_snapshot_ref = Some(snapshot_ref);
                (backend_id, reservation)
            }
            None => {
                let placement = self
                    .schedule(&SchedulingRequest {
                        volume_id: volume.id.clone(),
                        size_bytes: volume.size_bytes,
                        capabilities: volume.requirements.clone(),
                    })
                    .await?;
                (placement.backend_id, placement.reservation)
            }
        };

        ctx.name = volume.name;
        ctx.size_bytes = volume.size_bytes;
        ctx.requirements = volume.requirements;
        ctx.backend_id = Some(backend_id);
        ctx.reservation = Some(reservation);
        Ok((ctx, begin))
    }

    async fn prepare_existing(
        &self,
        request: &VolumeRequest,
        volume_id: &str,
        mut ctx: FlowContext,
    ) -> Result<(FlowContext, WriteOp)> {
        let (operation, fence) = (ctx.operation, ctx.fence);

        let volume = self.machine.get(volume_id).await?;
        match &request.operation {
            VolumeOperation::Extend { new_size_bytes, .. } if *new_size_bytes <= volume.size_bytes => {
                return Err(Error::Validation(format!(
                    "volume {} is {} bytes, extend must grow it",
                    volume_id, volume.size_bytes
                )));
            }
            VolumeOperation::Detach { attachment_id, .. } if volume.attachment(attachment_id).is_none() => {
                return Err(Error::Validation(format!(
                    "volume {} has no attachment {}",
                    volume_id, attachment_id
                )));
            }
            _ => {}
        }

        let (_, begin) = self.machine.begin_op(&volume, operation, fence)?;
        ctx.name = volume.name.clone();
        ctx.size_bytes = volume.size_bytes;
        ctx.requirements = volume.requirements.clone();
        ctx.backend_id = volume.backend_id.clone();
        ctx.driver_ref = volume.driver_ref.clone();

        match &request.operation {
            VolumeOperation::Delete { .. } => {
                ctx.snapshot_refs = self
                    .list_snapshots(volume_id)
                    .await?
                    .into_iter()
                    .filter_map(|snapshot| snapshot.snapshot_ref)
                    .collect();
            }
            VolumeOperation::Snapshot { name, .. } => {
                ctx.name = name.clone();
                ctx.snapshot_id = Some(generate_id("snap"));
            }
            VolumeOperation::Extend { new_size_bytes, .. } => {
                let backend_id = volume.backend_id.clone().ok_or_else(|| {
                    Error::Internal(format!("volume {} has no backend", volume_id))
                })?;
                let reservation = self
                    .scheduler
                    .reserve_on(&backend_id, volume_id, new_size_bytes - volume.size_bytes)
                    .await
                    .map_err(|e| self.scheduling_failed(e))?;
                ctx.new_size_bytes = Some(*new_size_bytes);
                ctx.reservation = Some(reservation);
            }
            VolumeOperation::Attach { connector, .. } => {
                ctx.connector = Some(connector.clone());
            }
            VolumeOperation::Detach { attachment_id, .. } => {
                ctx.attachment_id = Some(attachment_id.clone());
            }
            VolumeOperation::Create { .. } | VolumeOperation::CreateFromSnapshot { .. } => {}
        }

        Ok((ctx, begin))
    }

    async fn schedule(&self, request: &SchedulingRequest) -> Result<Placement> {
        self.scheduler
            .select(request)
            .await
            .map_err(|e| self.scheduling_failed(e))
    }

    fn scheduling_failed(&self, error: Error) -> Error {
        if matches!(
            error,
            Error::NoCapableBackend { .. } | Error::CapacityExhausted { .. }
        ) {
            self.metrics.scheduling_failed(error.code());
        }
        error
    }

    async fn finish(
        &self,
        request: &VolumeRequest,
        flow_id: &str,
        ctx: FlowContext,
    ) -> Result<VolumeHandle> {
        let volume = self.machine.get(&ctx.volume_id).await?;
        let snapshot = match &ctx.snapshot_id {
            Some(snapshot_id) => Some(self.get_snapshot(snapshot_id).await?),
            None => None,
        };

        Ok(VolumeHandle {
            request_id: request.request_id.clone(),
            flow_id: flow_id.to_string(),
            volume,
            snapshot,
            connection: ctx.connection,
        })
    }

    fn completion(&self, fence: u64) -> VolumeCompletion {
        VolumeCompletion {
            machine: self.machine.clone(),
            scheduler: self.scheduler.clone(),
            store: self.store.clone(),
            clock: self.clock.clone(),
            fence,
        }
    }

    /// Hand a reservation back, retrying store outages
    ///
    /// One still held after the retries is left to the reservation sweep.
    async fn release_reservation(&self, reservation: &Reservation) {
        let released = backoff::future::retry(self.config.retry.backoff(), || async move {
            self.scheduler.release(reservation).await.map_err(|e| {
                if e.is_transient() || matches!(e, Error::BackendUnavailable { .. }) {
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await;

        match released {
            Ok(released) => debug!(reservation = %reservation.id, released, "Reservation settled"),
            Err(e) => warn!(
                reservation = %reservation.id,
                backend = %reservation.backend_id,
                error = %e,
                "Failed to release reservation"
            ),
        }
    }


    async fn emit(
        &self,
        request_id: &str,
        volume_id: &str,
        operation: OperationKind,
        outcome: RequestOutcome,
    ) {
        let final_state = self.machine.get(volume_id).await.ok().map(|v| v.state);
        let event = VolumeEvent {
            request_id: request_id.to_string(),
            volume_id: final_state.map(|_| volume_id.to_string()),
            operation,
            final_state,
            outcome,
            emitted_at: self.clock.now(),
        };

        if let Err(e) = self.events.publish(event).await {
            warn!(request_id, error = %e, "Failed to publish volume event");
        }
    }

    // =========================================================================
    // Resumption
    // =========================================================================

    /// Drive flows other workers left behind to a terminal status
    ///
    /// Flows whose volume lock is still held are skipped; they become
    /// resumable once the holder's lease expires. Returns the number of
    /// flows finished.
    pub async fn resume_pending(&self) -> Result<usize> {
        let pending = self.engine.pending_flows().await?;
        let mut finished = 0;

        for record in &pending {
            match self.resume_flow(record).await {
                Ok(true) => finished += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    flow_id = %record.flow_id,
                    volume_id = %record.volume_id,
                    error = %e,
                    "Flow resumption failed"
                ),
            }
        }

        if !pending.is_empty() {
            info!(pending = pending.len(), finished, "Resumption pass complete");
        }

        if let Err(e) = self.sweep_reservations().await {
            warn!(error = %e, "Reservation sweep failed");
        }
        Ok(finished)
    }

    /// Release expired reservations that no flow or lock accounts for
    ///
    /// A reservation lives from scheduling to its flow's terminal commit.
    /// One past the TTL whose volume has neither a resumable flow nor a live
    /// lock lost its owner in between. Returns the number released.
    pub async fn sweep_reservations(&self) -> Result<usize> {
        let expired = self.scheduler.expired_reservations().await?;
        if expired.is_empty() {
            return Ok(0);
        }

        let active: HashSet<String> = self
            .engine
            .pending_flows()
            .await?
            .into_iter()
            .map(|record| record.volume_id)
            .collect();

        let mut released = 0;
        for reservation in &expired {
            if active.contains(&reservation.volume_id) {
                continue;
            }
            let resource = volume_resource(&reservation.volume_id);
            if self.locks.holder(&resource).await?.is_some() {
                continue;
            }
            if self.scheduler.release(reservation).await? {
                released += 1;
                self.metrics.reservation_swept();
                warn!(
                    reservation = %reservation.id,
                    backend = %reservation.backend_id,
                    volume_id = %reservation.volume_id,
                    bytes = reservation.size_bytes,
                    "Released orphaned reservation"
                );
            }
        }
        Ok(released)
    }

    async fn resume_flow(&self, record: &FlowRecord) -> Result<bool> {
        let mut lock = match self
            .locks
            .acquire(&volume_resource(&record.volume_id), &self.config.worker_id, None)
            .await
        {
            Ok(lock) => lock,
            Err(Error::Busy { holder, .. }) => {
                debug!(flow_id = %record.flow_id, %holder, "Flow still owned");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let completion = self.completion(lock.fencing_token());
        let started = Instant::now();
        let result = self
            .engine
            .resume(
                &record.flow_id,
                &self.flows,
                RunOptions {
                    lock: Some(&mut lock),
                    completion: Some(&completion),
                    ..Default::default()
                },
            )
            .await;

        if let Err(e) = self.locks.release(&lock).await {
            warn!(flow_id = %record.flow_id, error = %e, "Failed to release volume lock");
        }
        let outcome = result?;

        self.metrics.flow_finished(
            record.kind,
            &outcome.status().to_string(),
            started.elapsed().as_secs_f64(),
        );

        let context = outcome.context().clone();
        let request_outcome = match outcome {
            FlowOutcome::Success(_) => RequestOutcome::Completed,
            FlowOutcome::Failed { error, .. } => {
                if let Some(reservation) = &context.reservation {
                    self.release_reservation(reservation).await;
                }
                RequestOutcome::Failed {
                    code: error.code().to_string(),
                    reason: error.to_string(),
                }
            }
        };

        info!(
            flow_id = %record.flow_id,
            request_id = %context.request_id,
            completed = matches!(request_outcome, RequestOutcome::Completed),
            "Resumed flow finished"
        );
        self.emit(&context.request_id, &context.volume_id, record.kind, request_outcome)
            .await;
        Ok(true)
    }

    // =========================================================================
    // Backend Reports
    // =========================================================================

    /// Feed one backend report into the registry
    pub fn ingest_report(&self, report: BackendReport) -> Result<()> {
        let result = self.registry.report(report);
        if let Err(e @ Error::StaleReport { .. }) = &result {
            self.metrics.stale_report();
            debug!(error = %e, "Dropped stale report");
        }

        let stats = self.registry.stats();
        self.metrics
            .set_backends(stats.fresh_backends, stats.total_backends);
        result
    }

    /// Pull capacity and capabilities from every registered driver
    ///
    /// Returns the number of reports accepted. Unreachable backends are
    /// skipped and age out of scheduling through the staleness threshold.
    pub async fn poll_backends(&self) -> usize {
        let entries = self.drivers.entries();
        let results = join_all(entries.iter().map(|entry| self.poll_backend(entry))).await;

        let mut accepted = 0;
        for (entry, result) in entries.iter().zip(results) {
            match result {
                Ok(()) => accepted += 1,
                Err(e) if e.action() == ErrorAction::Drop => {
                    debug!(backend = %entry.driver.backend_id(), error = %e, "Report dropped");
                }
                Err(e) => {
                    warn!(backend = %entry.driver.backend_id(), error = %e, "Backend poll failed");
                }
            }
        }
        accepted
    }

    async fn poll_backend(&self, entry: &DriverEntry) -> Result<()> {
        let driver = &entry.driver;
        let capacity = driver.report_capacity().await?;
        let capabilities = driver.probe_capability().await?;

        self.ingest_report(BackendReport {
            backend_id: driver.backend_id().clone(),
            kind: driver.kind(),
            capacity,
            capabilities,
            reserved_percentage: entry.reserved_percentage,
            sequence_no: entry.next_sequence(),
        })
    }

    /// Health of every registered backend
    pub async fn backends_health(&self) -> BTreeMap<BackendId, bool> {
        let entries = self.drivers.entries();
        let checks = join_all(entries.iter().map(|entry| entry.driver.health_check())).await;

        entries
            .iter()
            .zip(checks)
            .map(|(entry, healthy)| (entry.driver.backend_id().clone(), healthy.unwrap_or(false)))
            .collect()
    }

    // =========================================================================
    // Read APIs
    // =========================================================================

    pub async fn get_volume(&self, volume_id: &str) -> Result<Volume> {
        self.machine.get(volume_id).await
    }

    /// All volumes, deleted tombstones included
    pub async fn list_volumes(&self) -> Result<Vec<Volume>> {
        self.machine.list().await
    }

    pub async fn get_snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
        load_json::<Snapshot>(self.store.as_ref(), &keys::snapshot(snapshot_id))
            .await?
            .map(|(snapshot, _)| snapshot)
            .ok_or_else(|| Error::SnapshotNotFound {
                snapshot_id: snapshot_id.to_string(),
            })
    }

    pub async fn list_snapshots(&self, volume_id: &str) -> Result<Vec<Snapshot>> {
        Ok(list_json::<Snapshot>(self.store.as_ref(), keys::SNAPSHOTS)
            .await?
            .into_iter()
            .map(|(snapshot, _)| snapshot)
            .filter(|snapshot| snapshot.volume_id == volume_id)
            .collect())
    }

    pub fn list_backends(&self) -> Vec<BackendDescriptor> {
        self.registry.all()
    }

    pub async fn get_flow(&self, flow_id: &str) -> Result<FlowRecord> {
        self.engine.get(flow_id).await
    }

    /// Get orchestrator status
    pub async fn status(&self) -> Result<OrchestratorStatus> {
        let mut volumes_by_state = BTreeMap::new();
        for volume in self.machine.list().await? {
            *volumes_by_state.entry(volume.state.to_string()).or_insert(0) += 1;
        }
        let pending_flows = self.engine.pending_flows().await?.len() as u64;
        let backends = self.registry.stats();

        Ok(OrchestratorStatus {
            healthy: backends.fresh_backends > 0,
            worker_id: self.config.worker_id.clone(),
            version: crate::VERSION.to_string(),
            backends,
            volumes_by_state,
            pending_flows,
            flows: self.engine.stats(),
            scheduler: self.scheduler.stats(),
            locks: self.locks.stats(),
            live_locks: self.locks.live_count().await?,
        })
    }

    // =========================================================================
    // Background Work
    // =========================================================================

    /// Spawn the backend poller and the resumption loop
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        poll_interval: Duration,
        resume_interval: Duration,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let poller = {
            let this = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(poll_interval.max(Duration::from_secs(1)));
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            let accepted = this.poll_backends().await;
                            debug!(accepted, "Backend poll complete");
                        }
                    }
                }
                debug!("Backend poller stopped");
            })
        };

        let resumer = {
            let this = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(resume_interval.max(Duration::from_secs(1)));
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = this.resume_pending().await {
                                warn!(error = %e, "Resumption pass failed");
                            }
                        }
                    }
                }
                debug!("Flow resumer stopped");
            })
        };

        vec![poller, resumer]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::ManualClock;
    use crate::domain::ports::{
        BackendKind, CapabilityRequirements, CapabilitySet, CapacityReport, Connector, StateStore,
        Versioned, VolumeDriver,
    };
    use crate::drivers::scripted::ScriptedDriver;
    use crate::drivers::{BackendSpec, LvmDriver};
    use crate::orchestrator::config::RetryConfig;
    use crate::orchestrator::events::EventBus;
    use crate::store::MemoryStore;
    use crate::taskflow::StepOutcome;
    use crate::volume::{SnapshotStatus, VolumeState};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::broadcast;

    const GIB: u64 = 1024 * 1024 * 1024;

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        events: broadcast::Receiver<VolumeEvent>,
        big: Arc<ScriptedDriver>,
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            worker_id: "worker-a".into(),
            retry: RetryConfig {
                initial_interval_ms: 1,
                max_interval_ms: 1,
                max_elapsed_ms: 0,
            },
            ..Default::default()
        }
    }

    fn lvm(id: &str, total: u64) -> Arc<ScriptedDriver> {
        ScriptedDriver::wrap(Arc::new(LvmDriver::new(&BackendSpec::new(
            id,
            BackendKind::Lvm,
            total,
        ))))
    }

    /// Two LVM backends: 15 GiB and 5 GiB
    fn backends() -> (Arc<DriverSet>, Arc<ScriptedDriver>) {
        let big = lvm("lvm-big", 15 * GIB);
        let drivers = DriverSet::new();
        drivers.register(big.clone(), 0);
        drivers.register(lvm("lvm-small", 5 * GIB), 0);
        (drivers, big)
    }

    async fn orchestrator_on(
        config: OrchestratorConfig,
        store: StateStoreRef,
        drivers: Arc<DriverSet>,
        clock: Arc<ManualClock>,
    ) -> (Arc<Orchestrator>, broadcast::Receiver<VolumeEvent>) {
        let bus = EventBus::new(64);
        let events = bus.subscribe();
        let orchestrator = Orchestrator::with_clock(config, store, drivers, bus, clock).unwrap();
        assert_eq!(orchestrator.poll_backends().await, 2);
        (orchestrator, events)
    }

    async fn harness_with(config: OrchestratorConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        let (drivers, big) = backends();
        let (orchestrator, events) =
            orchestrator_on(config, store.clone(), drivers, clock.clone()).await;

        Harness {
            orchestrator,
            store,
            clock,
            events,
            big,
        }
    }

    async fn harness() -> Harness {
        harness_with(config()).await
    }

    fn create(request_id: &str, size_bytes: u64) -> VolumeRequest {
        VolumeRequest::new(
            request_id,
            VolumeOperation::Create {
                name: "db".into(),
                size_bytes,
                capabilities: CapabilityRequirements::default(),
                volume_id: None,
            },
        )
    }

    fn drain(events: &mut broadcast::Receiver<VolumeEvent>) -> Vec<VolumeEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    async fn ledger(h: &Harness, backend: &str) -> crate::scheduler::CapacityLedger {
        h.orchestrator
            .scheduler()
            .ledger(&BackendId::new(backend))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_lands_on_backend_with_room() {
        let mut h = harness().await;

        let handle = h.orchestrator.handle(create("req-1", 10 * GIB)).await.unwrap();

        assert_eq!(handle.volume.state, VolumeState::Available);
        assert_eq!(handle.volume.backend_id, Some(BackendId::new("lvm-big")));
        assert_eq!(
            handle.volume.driver_ref,
            Some(format!("cinder-volumes/volume-{}", handle.volume.id))
        );

        let big = ledger(&h, "lvm-big").await;
        assert_eq!(big.committed_bytes, 10 * GIB);
        assert!(big.reservations.is_empty());

        let events = drain(&mut h.events);
        assert_eq!(events.len(), 1);
        assert!(events[0].is_success());
        assert_eq!(events[0].request_id, "req-1");
        assert_eq!(events[0].final_state, Some(VolumeState::Available));
    }

    #[tokio::test]
    async fn test_create_fails_when_no_backend_has_room() {
        let mut h = harness().await;
        h.orchestrator.handle(create("req-1", 10 * GIB)).await.unwrap();
        drain(&mut h.events);

        let result = h.orchestrator.handle(create("req-2", 10 * GIB)).await;

        assert_matches!(
            result,
            Err(Error::CapacityExhausted { requested, available }) if requested == 10 * GIB && available == 5 * GIB
        );
        // Scheduling runs before any record is written
        assert_eq!(h.orchestrator.list_volumes().await.unwrap().len(), 1);
        assert_eq!(h.store.list(keys::LOCKS).await.unwrap().len(), 1);

        let events = drain(&mut h.events);
        assert_eq!(events.len(), 1);
        assert_matches!(&events[0].outcome, RequestOutcome::Failed { code, .. } if code == "capacity_exhausted");
        assert_eq!(events[0].volume_id, None);
    }

    #[tokio::test]
    async fn test_no_capable_backend() {
        let h = harness().await;
        let request = VolumeRequest::new(
            "req-1",
            VolumeOperation::Create {
                name: "shared".into(),
                size_bytes: GIB,
                capabilities: CapabilityRequirements {
                    multiattach: true,
                    ..Default::default()
                },
                volume_id: None,
            },
        );

        assert_matches!(
            h.orchestrator.handle(request).await,
            Err(Error::NoCapableBackend { .. })
        );
    }

    #[tokio::test]
    async fn test_create_step_two_failure_rolls_back_reservation() {
        let mut h = harness().await;
        h.big.fail_next("create", 1);

        let result = h.orchestrator.handle(create("req-1", 10 * GIB)).await;
        assert_matches!(result, Err(Error::Driver { operation, .. }) if operation == "create");

        let volumes = h.orchestrator.list_volumes().await.unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].state, VolumeState::ErrorCreating);
        assert_eq!(volumes[0].backend_id, None);

        // Capacity as if the request never happened
        let big = ledger(&h, "lvm-big").await;
        assert_eq!(big.committed_bytes, 0);
        assert!(big.reservations.is_empty());
        // The failed step itself is never compensated
        assert_eq!(h.big.count("delete"), 0);

        let flows = list_json::<FlowRecord>(h.store.as_ref(), keys::FLOWS)
            .await
            .unwrap();
        assert_eq!(flows.len(), 1);
        let (flow, _) = &flows[0];
        assert_eq!(flow.status, FlowStatus::Compensated);
        let outcomes: Vec<_> = flow.steps.iter().map(|s| s.outcome).collect();
        assert_eq!(
            outcomes,
            vec![StepOutcome::Compensated, StepOutcome::Failed, StepOutcome::Pending]
        );

        let events = drain(&mut h.events);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].final_state, Some(VolumeState::ErrorCreating));

        // Retrying the create on the same volume succeeds
        let retry = VolumeRequest::new(
            "req-2",
            VolumeOperation::Create {
                name: "db".into(),
                size_bytes: 10 * GIB,
                capabilities: CapabilityRequirements::default(),
                volume_id: Some(volumes[0].id.clone()),
            },
        );
        let handle = h.orchestrator.handle(retry).await.unwrap();
        assert_eq!(handle.volume.id, volumes[0].id);
        assert_eq!(handle.volume.state, VolumeState::Available);
        assert_eq!(ledger(&h, "lvm-big").await.committed_bytes, 10 * GIB);
    }

    #[tokio::test]
    async fn test_create_step_three_failure_removes_backend_volume() {
        let h = harness().await;
        h.big.fail_next("health_check", 1);

        let result = h.orchestrator.handle(create("req-1", 10 * GIB)).await;
        assert_matches!(result, Err(Error::Driver { operation, .. }) if operation == "health_check");

        assert_eq!(h.big.count("delete"), 1);
        let capacity = h.big.report_capacity().await.unwrap();
        assert_eq!(capacity.free_bytes, 15 * GIB);

        // An error_creating volume can still be deleted
        let volume = h.orchestrator.list_volumes().await.unwrap().remove(0);
        let deleted = h
            .orchestrator
            .handle(VolumeRequest::new(
                "req-2",
                VolumeOperation::Delete {
                    volume_id: volume.id.clone(),
                },
            ))
            .await
            .unwrap();
        assert_eq!(deleted.volume.state, VolumeState::Deleted);
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let mut h = harness().await;
        let created = h.orchestrator.handle(create("req-1", 2 * GIB)).await.unwrap();
        let volume_id = created.volume.id.clone();
        let backend = created.volume.backend_id.clone().unwrap();
        let request = |id: &str, operation| VolumeRequest::new(id, operation);

        let attach = VolumeOperation::Attach {
            volume_id: volume_id.clone(),
            connector: Connector {
                host: "node-1".into(),
                initiator: None,
            },
        };
        let attached = h.orchestrator.handle(request("req-2", attach.clone())).await.unwrap();
        assert_eq!(attached.volume.state, VolumeState::InUse);
        let attachment_id = attached.connection.unwrap().attachment_id;
        assert!(attached.volume.attachment(&attachment_id).is_some());

        // Not multiattach
        assert_matches!(
            h.orchestrator.handle(request("req-3", attach)).await,
            Err(Error::InvalidTransition { .. })
        );

        let snapped = h
            .orchestrator
            .handle(request(
                "req-4",
                VolumeOperation::Snapshot {
                    volume_id: volume_id.clone(),
                    name: "nightly".into(),
                },
            ))
            .await
            .unwrap();
        assert_eq!(snapped.volume.state, VolumeState::InUse);
        let snapshot = snapped.snapshot.unwrap();
        assert_eq!(snapshot.status, SnapshotStatus::Available);
        assert_eq!(snapshot.name, "nightly");

        let detached = h
            .orchestrator
            .handle(request(
                "req-5",
                VolumeOperation::Detach {
                    volume_id: volume_id.clone(),
                    attachment_id,
                },
            ))
            .await
            .unwrap();
        assert_eq!(detached.volume.state, VolumeState::Available);
        assert!(detached.volume.attachments.is_empty());

        let extended = h
            .orchestrator
            .handle(request(
                "req-6",
                VolumeOperation::Extend {
                    volume_id: volume_id.clone(),
                    new_size_bytes: 4 * GIB,
                },
            ))
            .await
            .unwrap();
        assert_eq!(extended.volume.size_bytes, 4 * GIB);
        assert_eq!(ledger(&h, backend.as_str()).await.committed_bytes, 4 * GIB);

        let deleted = h
            .orchestrator
            .handle(request("req-7", VolumeOperation::Delete { volume_id: volume_id.clone() }))
            .await
            .unwrap();
        assert_eq!(deleted.volume.state, VolumeState::Deleted);
        assert_eq!(ledger(&h, backend.as_str()).await.committed_bytes, 0);
        assert!(h.orchestrator.list_snapshots(&volume_id).await.unwrap().is_empty());

        // One event per request, the rejected attach included
        let events = drain(&mut h.events);
        assert_eq!(events.len(), 7);
        assert_eq!(events.iter().filter(|e| e.is_success()).count(), 6);
    }

    #[tokio::test]
    async fn test_request_validation() {
        let mut h = harness().await;
        let created = h.orchestrator.handle(create("req-1", 2 * GIB)).await.unwrap();

        let shrink = VolumeRequest::new(
            "req-2",
            VolumeOperation::Extend {
                volume_id: created.volume.id.clone(),
                new_size_bytes: GIB,
            },
        );
        assert_matches!(h.orchestrator.handle(shrink).await, Err(Error::Validation(_)));

        let unknown = VolumeRequest::new(
            "req-3",
            VolumeOperation::Delete {
                volume_id: "vol-missing".into(),
            },
        );
        assert_matches!(
            h.orchestrator.handle(unknown).await,
            Err(Error::VolumeNotFound { .. })
        );
        // Unknown volumes never get a lock record
        let locks = h.orchestrator.locks();
        assert_eq!(locks.current_token(&volume_resource("vol-missing")).await.unwrap(), 0);

        assert_matches!(
            h.orchestrator.handle(create("req-4", 0)).await,
            Err(Error::Validation(_))
        );
        assert_eq!(drain(&mut h.events).len(), 4);
    }

    #[tokio::test]
    async fn test_locked_volume_is_busy() {
        let mut h = harness().await;
        let created = h.orchestrator.handle(create("req-1", GIB)).await.unwrap();
        drain(&mut h.events);

        let _held = h
            .orchestrator
            .locks()
            .acquire(&volume_resource(&created.volume.id), "worker-b", None)
            .await
            .unwrap();

        let result = h
            .orchestrator
            .handle(VolumeRequest::new(
                "req-2",
                VolumeOperation::Delete {
                    volume_id: created.volume.id.clone(),
                },
            ))
            .await;

        assert_matches!(result, Err(Error::Busy { holder, .. }) if holder == "worker-b");
        let volume = h.orchestrator.get_volume(&created.volume.id).await.unwrap();
        assert_eq!(volume.state, VolumeState::Available);

        let events = drain(&mut h.events);
        assert_eq!(events.len(), 1);
        assert_matches!(&events[0].outcome, RequestOutcome::Failed { code, .. } if code == "busy");
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_lock() {
        let mut h = harness_with(OrchestratorConfig {
            retry: RetryConfig {
                initial_interval_ms: 5,
                max_interval_ms: 5,
                max_elapsed_ms: 5_000,
            },
            ..config()
        })
        .await;
        let created = h.orchestrator.handle(create("req-1", GIB)).await.unwrap();
        drain(&mut h.events);

        let _held = h
            .orchestrator
            .locks()
            .acquire(&volume_resource(&created.volume.id), "worker-b", None)
            .await
            .unwrap();

        let orchestrator = h.orchestrator.clone();
        let volume_id = created.volume.id.clone();
        let pending = tokio::spawn(async move {
            orchestrator
                .handle(VolumeRequest::new(
                    "req-2",
                    VolumeOperation::Delete { volume_id },
                ))
                .await
        });

        while !h.orchestrator.cancel("req-2") {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert_matches!(pending.await.unwrap(), Err(Error::FlowCancelled { .. }));
        let volume = h.orchestrator.get_volume(&created.volume.id).await.unwrap();
        assert_eq!(volume.state, VolumeState::Available);
        assert!(!h.orchestrator.cancel("req-2"));

        let events = drain(&mut h.events);
        assert_eq!(events.len(), 1);
        assert_matches!(&events[0].outcome, RequestOutcome::Failed { code, .. } if code == "cancelled");
    }

    #[tokio::test]
    async fn test_resume_after_worker_crash() {
        let mut h = harness().await;
        h.big.crash_store_on("create", h.store.clone());

        let result = h.orchestrator.handle(create("req-1", 10 * GIB)).await;
        assert_matches!(result, Err(Error::BackendUnavailable { .. }));
        // Deferred to whoever resumes the flow
        assert!(drain(&mut h.events).is_empty());

        h.store.set_available(true);
        let pending = h.orchestrator.engine().pending_flows().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, FlowStatus::Running);
        let volume_id = pending[0].volume_id.clone();

        // The crashed worker's lease is still live
        let resource = volume_resource(&volume_id);
        let locks = h.orchestrator.locks();
        assert_eq!(locks.holder(&resource).await.unwrap().as_deref(), Some("worker-a"));
        let stale_token = locks.current_token(&resource).await.unwrap();
        assert_eq!(h.orchestrator.resume_pending().await.unwrap(), 0);

        h.clock.advance(Duration::from_secs(31));
        assert_eq!(h.orchestrator.resume_pending().await.unwrap(), 1);

        let volume = h.orchestrator.get_volume(&volume_id).await.unwrap();
        assert_eq!(volume.state, VolumeState::Available);
        assert!(volume.last_fence > stale_token);
        assert_eq!(ledger(&h, "lvm-big").await.committed_bytes, 10 * GIB);
        assert_eq!(h.big.count("create"), 2);

        let events = drain(&mut h.events);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].request_id, "req-1");
        assert!(events[0].is_success());
        assert!(h.orchestrator.engine().pending_flows().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_never_overcommit() {
        let mut config = config();
        config.retry = RetryConfig {
            initial_interval_ms: 1,
            max_interval_ms: 20,
            max_elapsed_ms: 10_000,
        };
        config.scheduler.max_reservation_attempts = 64;
        config.flows.completion_attempts = 64;
        let h = harness_with(config).await;

        let tasks: Vec<_> = (0..12)
            .map(|i| {
                let orchestrator = h.orchestrator.clone();
                tokio::spawn(async move {
                    orchestrator
                        .handle(create(&format!("req-{}", i), 2 * GIB))
                        .await
                })
            })
            .collect();
        let results = join_all(tasks).await;

        let placed = results.iter().filter(|r| matches!(r, Ok(Ok(_)))).count();
        let exhausted = results
            .iter()
            .filter(|r| matches!(r, Ok(Err(Error::CapacityExhausted { .. }))))
            .count();
        assert_eq!(placed, 9);
        assert_eq!(exhausted, 3);

        let big = ledger(&h, "lvm-big").await;
        let small = ledger(&h, "lvm-small").await;
        assert!(big.committed_bytes <= 15 * GIB);
        assert!(small.committed_bytes <= 5 * GIB);
        assert_eq!(big.committed_bytes + small.committed_bytes, 18 * GIB);
    }

    #[tokio::test]
    async fn test_stale_report_is_dropped() {
        let h = harness().await;
        let report = BackendReport {
            backend_id: BackendId::new("lvm-big"),
            kind: BackendKind::Lvm,
            capacity: CapacityReport {
                free_bytes: GIB,
                total_bytes: 15 * GIB,
                utilization_percent: 90,
                ..Default::default()
            },
            capabilities: CapabilitySet::default(),
            reserved_percentage: 0,
            sequence_no: 1,
        };

        assert_matches!(
            h.orchestrator.ingest_report(report),
            Err(Error::StaleReport { .. })
        );
        let descriptor = h
            .orchestrator
            .registry()
            .get(&BackendId::new("lvm-big"))
            .unwrap();
        assert_eq!(descriptor.free_bytes, 15 * GIB);
    }

    /// Fails the first commit that writes a flow record
    struct FlowStartOutage {
        inner: Arc<MemoryStore>,
        tripped: AtomicBool,
    }

    #[async_trait]
    impl StateStore for FlowStartOutage {
        async fn get(&self, key: &str) -> Result<Option<Versioned>> {
            self.inner.get(key).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
            self.inner.list(prefix).await
        }

        async fn commit(&self, ops: Vec<WriteOp>) -> Result<Vec<u64>> {
            let starts_flow = ops.iter().any(|op| op.key.starts_with(keys::FLOWS));
            if starts_flow && !self.tripped.swap(true, Ordering::SeqCst) {
                return Err(Error::BackendUnavailable {
                    backend: "state-store".into(),
                });
            }
            self.inner.commit(ops).await
        }
    }

    #[tokio::test]
    async fn test_store_outage_at_flow_start_releases_reservation() {
        let store = Arc::new(MemoryStore::new());
        let outage = Arc::new(FlowStartOutage {
            inner: store.clone(),
            tripped: AtomicBool::new(false),
        });
        let (drivers, big) = backends();
        let (orchestrator, mut events) =
            orchestrator_on(config(), outage, drivers, ManualClock::new(Utc::now())).await;

        let result = orchestrator.handle(create("req-1", 10 * GIB)).await;
        assert_matches!(result, Err(Error::BackendUnavailable { .. }));

        // Nothing was persisted and nothing is left held
        assert!(list_json::<FlowRecord>(store.as_ref(), keys::FLOWS)
            .await
            .unwrap()
            .is_empty());
        assert!(orchestrator.list_volumes().await.unwrap().is_empty());
        assert!(store.list(keys::LOCKS).await.unwrap().is_empty());
        let big_ledger = orchestrator
            .scheduler()
            .ledger(&BackendId::new("lvm-big"))
            .await
            .unwrap();
        assert_eq!(big_ledger.reserved_bytes(), 0);
        assert_eq!(big.count("create"), 0);

        // Reported here, since no resumer will ever see the flow
        let seen = drain(&mut events);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].request_id, "req-1");
        assert_matches!(&seen[0].outcome, RequestOutcome::Failed { code, .. } if code == "backend_unavailable");
        assert_eq!(orchestrator.resume_pending().await.unwrap(), 0);
        assert!(drain(&mut events).is_empty());

        let handle = orchestrator.handle(create("req-2", 10 * GIB)).await.unwrap();
        assert_eq!(handle.volume.state, VolumeState::Available);
    }

    #[tokio::test]
    async fn test_workers_sharing_a_store_fence_each_other() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        let (drivers, _) = backends();
        let (a, _) = orchestrator_on(config(), store.clone(), drivers.clone(), clock.clone()).await;
        let (b, _) = orchestrator_on(
            OrchestratorConfig {
                worker_id: "worker-b".into(),
                ..config()
            },
            store.clone(),
            drivers,
            clock.clone(),
        )
        .await;

        let created = a.handle(create("req-1", GIB)).await.unwrap();
        let volume_id = created.volume.id.clone();
        let resource = volume_resource(&volume_id);
        let delete = |id: &str| {
            VolumeRequest::new(
                id,
                VolumeOperation::Delete {
                    volume_id: volume_id.clone(),
                },
            )
        };

        // A lease taken on one worker holds off the other
        let held = a.locks().acquire(&resource, "worker-a", None).await.unwrap();
        assert_matches!(
            b.handle(delete("req-2")).await,
            Err(Error::Busy { holder, .. }) if holder == "worker-a"
        );
        a.locks().release(&held).await.unwrap();

        // Tokens continue across workers
        let attached = b
            .handle(VolumeRequest::new(
                "req-3",
                VolumeOperation::Attach {
                    volume_id: volume_id.clone(),
                    connector: Connector {
                        host: "node-1".into(),
                        initiator: None,
                    },
                },
            ))
            .await
            .unwrap();
        assert!(attached.volume.last_fence > held.fencing_token());

        let detached = a
            .handle(VolumeRequest::new(
                "req-4",
                VolumeOperation::Detach {
                    volume_id: volume_id.clone(),
                    attachment_id: attached.connection.unwrap().attachment_id,
                },
            ))
            .await
            .unwrap();
        assert!(detached.volume.last_fence > attached.volume.last_fence);

        // A crashed worker's lease expires for everyone
        let _abandoned = a.locks().acquire(&resource, "worker-a", None).await.unwrap();
        assert_matches!(b.handle(delete("req-5")).await, Err(Error::Busy { .. }));
        clock.advance(Duration::from_secs(31));

        let deleted = b.handle(delete("req-6")).await.unwrap();
        assert_eq!(deleted.volume.state, VolumeState::Deleted);
        assert_eq!(b.locks().stats().takeovers, 1);
        assert_eq!(a.locks().live_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_create_from_snapshot() {
        let mut h = harness().await;
        // Only the big backend fits it
        let created = h.orchestrator.handle(create("req-1", 6 * GIB)).await.unwrap();
        let snapshot = h
            .orchestrator
            .handle(VolumeRequest::new(
                "req-2",
                VolumeOperation::Snapshot {
                    volume_id: created.volume.id.clone(),
                    name: "nightly".into(),
                },
            ))
            .await
            .unwrap()
            .snapshot
            .unwrap();
        let clone_request = |id: &str, size_bytes| {
            VolumeRequest::new(
                id,
                VolumeOperation::CreateFromSnapshot {
                    name: "db-copy".into(),
                    snapshot_id: snapshot.id.clone(),
                    size_bytes,
                    volume_id: None,
                },
            )
        };

        assert_matches!(
            h.orchestrator.handle(clone_request("req-3", Some(GIB))).await,
            Err(Error::Validation(_))
        );

        let cloned = h.orchestrator.handle(clone_request("req-4", None)).await.unwrap();
        assert_eq!(cloned.volume.state, VolumeState::Available);
        assert_ne!(cloned.volume.id, created.volume.id);
        assert_eq!(cloned.volume.size_bytes, 6 * GIB);
        assert_eq!(cloned.volume.backend_id, Some(BackendId::new("lvm-big")));
        assert_eq!(h.big.count("clone_volume"), 1);
        assert_eq!(h.big.count("create"), 1);
        assert_eq!(ledger(&h, "lvm-big").await.committed_bytes, 12 * GIB);

        // Its snapshot goes with the source volume
        h.orchestrator
            .handle(VolumeRequest::new(
                "req-5",
                VolumeOperation::Delete {
                    volume_id: created.volume.id.clone(),
                },
            ))
            .await
            .unwrap();
        assert_matches!(
            h.orchestrator.handle(clone_request("req-6", None)).await,
            Err(Error::SnapshotNotFound { .. })
        );
        let clone_volume = h.orchestrator.get_volume(&cloned.volume.id).await.unwrap();
        assert_eq!(clone_volume.state, VolumeState::Available);

        let events = drain(&mut h.events);
        assert_eq!(events.len(), 6);
        assert_eq!(events.iter().filter(|e| e.is_success()).count(), 4);
    }

    #[tokio::test]
    async fn test_sweep_releases_orphaned_reservations() {
        let h = harness().await;
        let scheduler = h.orchestrator.scheduler();
        let place = |volume_id: &str| SchedulingRequest {
            volume_id: volume_id.into(),
            size_bytes: 2 * GIB,
            capabilities: CapabilityRequirements::default(),
        };
        let orphan = scheduler.select(&place("vol-gone")).await.unwrap();
        let held = scheduler.select(&place("vol-held")).await.unwrap();
        let _lock = h
            .orchestrator
            .locks()
            .acquire(
                &volume_resource("vol-held"),
                "worker-b",
                Some(Duration::from_secs(3600)),
            )
            .await
            .unwrap();

        assert_eq!(h.orchestrator.sweep_reservations().await.unwrap(), 0);

        h.clock.advance(Duration::from_secs(601));
        assert_eq!(h.orchestrator.resume_pending().await.unwrap(), 0);

        let orphan_ledger = ledger(&h, orphan.backend_id.as_str()).await;
        assert!(!orphan_ledger.reservations.contains_key(&orphan.reservation.id));
        let held_ledger = ledger(&h, held.backend_id.as_str()).await;
        assert!(held_ledger.reservations.contains_key(&held.reservation.id));
        assert_eq!(h.orchestrator.metrics().swept_reservations(), 1);
    }

    #[tokio::test]
    async fn test_status() {
        let h = harness().await;
        h.orchestrator.handle(create("req-1", GIB)).await.unwrap();

        let status = h.orchestrator.status().await.unwrap();
        assert!(status.healthy);
        assert_eq!(status.worker_id, "worker-a");
        assert_eq!(status.backends.total_backends, 2);
        assert_eq!(status.volumes_by_state.get("available"), Some(&1));
        assert_eq!(status.pending_flows, 0);
        assert_eq!(status.flows.succeeded, 1);
        assert_eq!(status.locks.acquired, 1);
        assert_eq!(status.live_locks, 0);

        let health = h.orchestrator.backends_health().await;
        assert_eq!(health.len(), 2);
        assert!(health.values().all(|healthy| *healthy));
    }
}
