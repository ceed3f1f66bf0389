//! Flow Engine
//!
//! Drives a flow definition over a persisted `FlowRecord`:
//!
//! ```text
//! Pending -> Running -> Success
//!              |
//!              v
//!          Reverting -> Compensated | CompensationFailed
//! (none)  -> Cancelled
//! ```
//!
//! The record is written after every step transition, before the next step
//! starts. The first write carries the caller's `initial_writes`, so a flow
//! record exists exactly when the state it drives was moved into progress.
//! A run whose first write never landed fails with `FlowNotStarted`.
//!
//! Every write is guarded by the record's store version and, when a lock
//! handle is attached, by the handle's lease in the store.

use super::context::FlowContext;
use super::record::{FlowError, FlowRecord, FlowStatus, StepOutcome};
use super::step::{FlowBuilder, FlowCompletion, FlowDefinition};
use crate::domain::clock::{ClockRef, SystemClock};
use crate::domain::ports::{StateStoreRef, WriteOp};
use crate::error::{Error, Result};
use crate::locking::{LockHandle, LockService};
use crate::store::{keys, list_json, load_json};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Flow engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowEngineConfig {
    /// Attempts at the terminal commit when completion writes conflict
    pub completion_attempts: u32,
}

impl Default for FlowEngineConfig {
    fn default() -> Self {
        Self {
            completion_attempts: 8,
        }
    }
}

// =============================================================================
// Run Options / Outcome
// =============================================================================

/// Per-run collaborators
#[derive(Default)]
pub struct RunOptions<'a> {
    /// Lock the flow runs under; validated and renewed on every persist
    pub lock: Option<&'a mut LockHandle>,
    /// Checked once, before anything is persisted
    pub cancel: Option<CancellationToken>,
    /// Writes committed together with the `Pending` record
    pub initial_writes: Vec<WriteOp>,
    /// Writes committed together with the terminal status
    pub completion: Option<&'a dyn FlowCompletion>,
}

/// Result of a flow run
#[derive(Debug)]
pub enum FlowOutcome {
    Success(FlowContext),
    Failed {
        error: Error,
        status: FlowStatus,
        context: FlowContext,
    },
}

impl FlowOutcome {
    pub fn status(&self) -> FlowStatus {
        match self {
            FlowOutcome::Success(_) => FlowStatus::Success,
            FlowOutcome::Failed { status, .. } => *status,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, FlowOutcome::Success(_))
    }

    pub fn context(&self) -> &FlowContext {
        match self {
            FlowOutcome::Success(context) => context,
            FlowOutcome::Failed { context, .. } => context,
        }
    }

    /// Outcome of a flow that already reached a terminal status
    fn from_record(record: FlowRecord) -> Self {
        let error = match (record.status, record.last_error) {
            (FlowStatus::Cancelled, _) => Error::FlowCancelled {
                flow_id: record.flow_id.clone(),
            },
            (FlowStatus::CompensationFailed, Some(e)) => Error::CompensationFailed {
                flow_id: record.flow_id.clone(),
                step: e.step,
                reason: e.message,
            },
            (_, Some(e)) => Error::StepFailed {
                step: e.step,
                reason: e.message,
            },
            (status, None) => Error::Internal(format!(
                "flow {} ended {} without a recorded error",
                record.flow_id, status
            )),
        };

        match record.status {
            FlowStatus::Success => FlowOutcome::Success(record.context),
            status => FlowOutcome::Failed {
                error,
                status,
                context: record.context,
            },
        }
    }
}

fn not_started(flow_id: String, error: Error) -> Error {
    Error::FlowNotStarted {
        flow_id,
        source: Box::new(error),
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
struct FlowCounters {
    started: AtomicU64,
    resumed: AtomicU64,
    succeeded: AtomicU64,
    compensated: AtomicU64,
    compensation_failed: AtomicU64,
    cancelled: AtomicU64,
}

/// Snapshot of flow engine statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStats {
    pub started: u64,
    pub resumed: u64,
    pub succeeded: u64,
    pub compensated: u64,
    pub compensation_failed: u64,
    pub cancelled: u64,
}

// =============================================================================
// Flow Engine
// =============================================================================

/// Persistent saga executor
pub struct FlowEngine {
    config: FlowEngineConfig,
    store: StateStoreRef,
    locks: Arc<LockService>,
    clock: ClockRef,
    counters: FlowCounters,
}

impl FlowEngine {
    pub fn new(config: FlowEngineConfig, store: StateStoreRef, locks: Arc<LockService>) -> Arc<Self> {
        Self::with_clock(config, store, locks, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: FlowEngineConfig,
        store: StateStoreRef,
        locks: Arc<LockService>,
        clock: ClockRef,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            locks,
            clock,
            counters: FlowCounters::default(),
        })
    }

    /// Run a new flow to a terminal status
    ///
    /// Returns `Err` only when the flow could not be driven to a terminal
    /// status (lost its lock, store unavailable). The record is then left
    /// `Pending`, `Running` or `Reverting` for `resume`. When the very first
    /// write failed there is no record and the error is `FlowNotStarted`.
    pub async fn run(
        &self,
        definition: &FlowDefinition,
        context: FlowContext,
        mut opts: RunOptions<'_>,
    ) -> Result<FlowOutcome> {
        let mut record = FlowRecord::new(
            definition.kind,
            &definition.step_names(),
            context,
            self.clock.now(),
        );
        let cancelled = opts
            .cancel
            .as_ref()
            .map(|token| token.is_cancelled())
            .unwrap_or(false);

        if cancelled {
            info!(flow_id = %record.flow_id, "Flow cancelled before running");
            let error = Error::FlowCancelled {
                flow_id: record.flow_id.clone(),
            };
            record.last_error = Some(FlowError {
                step: String::new(),
                code: error.code().to_string(),
                message: error.to_string(),
            });
            let flow_id = record.flow_id.clone();
            let record = self
                .complete(record, 0, FlowStatus::Cancelled, &mut opts)
                .await
                .map_err(|e| not_started(flow_id, e))?;
            return Ok(FlowOutcome::Failed {
                error,
                status: FlowStatus::Cancelled,
                context: record.context,
            });
        }

        let mut version = 0;
        let initial = std::mem::take(&mut opts.initial_writes);
        let flow_id = record.flow_id.clone();
        self.persist(&mut record, &mut version, FlowStatus::Pending, &mut opts, initial)
            .await
            .map_err(|e| not_started(flow_id, e))?;
        self.counters.started.fetch_add(1, Ordering::Relaxed);
        info!(
            flow_id = %record.flow_id,
            kind = %record.kind,
            volume_id = %record.volume_id,
            steps = definition.len(),
            "Flow started"
        );

        self.start(definition, record, version, &mut opts).await
    }

    /// Resume a flow from its persisted step index
    ///
    /// A flow that already reached a terminal status is not touched; its
    /// recorded outcome is returned.
    pub async fn resume(
        &self,
        flow_id: &str,
        builder: &dyn FlowBuilder,
        mut opts: RunOptions<'_>,
    ) -> Result<FlowOutcome> {
        let (record, version) = self.load(flow_id).await?;

        if record.status.is_terminal() {
            debug!(flow_id, status = %record.status, "Flow already terminal");
            return Ok(FlowOutcome::from_record(record));
        }

        let definition = builder.build(record.kind);
        if definition.step_names() != record.steps.iter().map(|s| s.name.as_str()).collect::<Vec<_>>() {
            return Err(Error::Internal(format!(
                "flow {} steps do not match the {} definition",
                flow_id, record.kind
            )));
        }

        self.counters.resumed.fetch_add(1, Ordering::Relaxed);
        info!(
            flow_id,
            status = %record.status,
            step_index = record.step_index,
            "Resuming flow"
        );

        if record.status == FlowStatus::Pending {
            return self.start(&definition, record, version, &mut opts).await;
        }
        self.drive(&definition, record, version, &mut opts, None).await
    }

    /// Flows left `Pending`, `Running` or `Reverting`
    pub async fn pending_flows(&self) -> Result<Vec<FlowRecord>> {
        Ok(list_json::<FlowRecord>(self.store.as_ref(), keys::FLOWS)
            .await?
            .into_iter()
            .map(|(record, _)| record)
            .filter(|record| record.status.is_resumable())
            .collect())
    }

    /// Load a flow record
    pub async fn get(&self, flow_id: &str) -> Result<FlowRecord> {
        Ok(self.load(flow_id).await?.0)
    }

    async fn load(&self, flow_id: &str) -> Result<(FlowRecord, u64)> {
        load_json::<FlowRecord>(self.store.as_ref(), &keys::flow(flow_id))
            .await?
            .ok_or_else(|| Error::FlowNotFound {
                flow_id: flow_id.to_string(),
            })
    }

    /// Get flow statistics
    pub fn stats(&self) -> FlowStats {
        FlowStats {
            started: self.counters.started.load(Ordering::Relaxed),
            resumed: self.counters.resumed.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            compensated: self.counters.compensated.load(Ordering::Relaxed),
            compensation_failed: self.counters.compensation_failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
        }
    }

    // =========================================================================
    // Execution
    // =========================================================================

    async fn start(
        &self,
        definition: &FlowDefinition,
        mut record: FlowRecord,
        mut version: u64,
        opts: &mut RunOptions<'_>,
    ) -> Result<FlowOutcome> {
        self.persist(&mut record, &mut version, FlowStatus::Running, opts, Vec::new())
            .await?;
        self.drive(definition, record, version, opts, None).await
    }

    async fn drive(
        &self,
        definition: &FlowDefinition,
        mut record: FlowRecord,
        mut version: u64,
        opts: &mut RunOptions<'_>,
        mut failure: Option<Error>,
    ) -> Result<FlowOutcome> {
        if record.status == FlowStatus::Running {
            while record.step_index < definition.len() {
                let index = record.step_index;
                let step = &definition.steps[index];
                debug!(flow_id = %record.flow_id, step = step.name(), index, "Step forward");

                match step.forward(record.context.clone()).await {
                    Ok(context) => {
                        record.context = context;
                        record.steps[index].outcome = StepOutcome::Committed;
                        record.step_index = index + 1;
                        self.persist(&mut record, &mut version, FlowStatus::Running, opts, Vec::new())
                            .await?;
                    }
                    Err(e) => {
                        warn!(
                            flow_id = %record.flow_id,
                            step = step.name(),
                            error = %e,
                            "Step failed, reverting"
                        );
                        record.steps[index].outcome = StepOutcome::Failed;
                        record.last_error = Some(FlowError {
                            step: step.name().to_string(),
                            code: e.code().to_string(),
                            message: e.to_string(),
                        });
                        self.persist(&mut record, &mut version, FlowStatus::Reverting, opts, Vec::new())
                            .await?;
                        failure = Some(e);
                        break;
                    }
                }
            }

            if record.status == FlowStatus::Running {
                let record = self
                    .complete(record, version, FlowStatus::Success, opts)
                    .await?;
                return Ok(FlowOutcome::Success(record.context));
            }
        }

        // Reverting: unwind committed steps, newest first
        while record.step_index > 0 {
            let index = record.step_index - 1;
            if record.steps[index].outcome != StepOutcome::Committed {
                record.step_index = index;
                continue;
            }

            let step = &definition.steps[index];
            debug!(flow_id = %record.flow_id, step = step.name(), index, "Step compensate");

            match step.compensate(&record.context).await {
                Ok(()) => {
                    record.steps[index].outcome = StepOutcome::Compensated;
                    record.step_index = index;
                    self.persist(&mut record, &mut version, FlowStatus::Reverting, opts, Vec::new())
                        .await?;
                }
                Err(e) => {
                    error!(
                        flow_id = %record.flow_id,
                        step = step.name(),
                        error = %e,
                        "Compensation failed, operator intervention required"
                    );
                    let error = Error::CompensationFailed {
                        flow_id: record.flow_id.clone(),
                        step: step.name().to_string(),
                        reason: e.to_string(),
                    };
                    record.steps[index].outcome = StepOutcome::CompensationFailed;
                    record.last_error = Some(FlowError {
                        step: step.name().to_string(),
                        code: error.code().to_string(),
                        message: e.to_string(),
                    });
                    let record = self
                        .complete(record, version, FlowStatus::CompensationFailed, opts)
                        .await?;
                    return Ok(FlowOutcome::Failed {
                        error,
                        status: FlowStatus::CompensationFailed,
                        context: record.context,
                    });
                }
            }
        }

        let record = self
            .complete(record, version, FlowStatus::Compensated, opts)
            .await?;
        let error = match failure {
            Some(error) => error,
            None => match FlowOutcome::from_record(record.clone()) {
                FlowOutcome::Failed { error, .. } => error,
                FlowOutcome::Success(_) => Error::Internal("compensated flow recorded as success".into()),
            },
        };
        Ok(FlowOutcome::Failed {
            error,
            status: FlowStatus::Compensated,
            context: record.context,
        })
    }

    /// Commit a terminal status together with the completion writes
    async fn complete(
        &self,
        mut record: FlowRecord,
        mut version: u64,
        status: FlowStatus,
        opts: &mut RunOptions<'_>,
    ) -> Result<FlowRecord> {
        let flow_key = keys::flow(&record.flow_id);
        let hook = opts.completion;
        let attempts = self.config.completion_attempts.max(1);

        for attempt in 1..=attempts {
            let extra = match hook {
                Some(hook) => hook.writes(&record.context, status).await?,
                None => Vec::new(),
            };

            match self.persist(&mut record, &mut version, status, opts, extra).await {
                Ok(()) => {
                    self.count_terminal(status);
                    info!(
                        flow_id = %record.flow_id,
                        kind = %record.kind,
                        %status,
                        "Flow finished"
                    );
                    return Ok(record);
                }
                Err(Error::Conflict { key, .. }) if key != flow_key && attempt < attempts => {
                    debug!(flow_id = %record.flow_id, %key, attempt, "Completion write raced, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Internal(format!(
            "flow {} could not commit {}",
            record.flow_id, status
        )))
    }

    fn count_terminal(&self, status: FlowStatus) {
        let counter = match status {
            FlowStatus::Success => &self.counters.succeeded,
            FlowStatus::Compensated => &self.counters.compensated,
            FlowStatus::CompensationFailed => &self.counters.compensation_failed,
            FlowStatus::Cancelled => &self.counters.cancelled,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Write `record` with `status`, plus `extra`, in one commit
    ///
    /// `record` is only updated once the commit lands.
    async fn persist(
        &self,
        record: &mut FlowRecord,
        version: &mut u64,
        status: FlowStatus,
        opts: &mut RunOptions<'_>,
        extra: Vec<WriteOp>,
    ) -> Result<()> {
        if record.status.is_terminal() {
            return Err(Error::Internal(format!(
                "flow {} is {} and cannot move to {}",
                record.flow_id, record.status, status
            )));
        }

        if let Some(handle) = opts.lock.as_deref_mut() {
            self.locks.renew(handle).await?;
        }

        let mut next = record.clone();
        next.status = status;
        next.updated_at = self.clock.now();

        let mut ops = Vec::with_capacity(1 + extra.len());
        ops.push(WriteOp::put_json(
            keys::flow(&next.flow_id),
            &next,
            Some(*version),
        )?);
        ops.extend(extra);

        let versions = self.store.commit(ops).await?;
        *version = versions.first().copied().unwrap_or(*version + 1);
        *record = next;
        Ok(())
    }
}
