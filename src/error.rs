//! Error types for the Volume Orchestrator
//!
//! Provides structured error types for all orchestrator components including
//! scheduling, locking, task flows, the volume state machine and drivers.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the orchestrator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Request validation failed: {0}")]
    Validation(String),

    // =========================================================================
    // Scheduling Errors
    // =========================================================================
    #[error("No backend satisfies capabilities: {requirements}")]
    NoCapableBackend { requirements: String },

    #[error("Capacity exhausted: requested {requested} bytes, best backend has {available} bytes")]
    CapacityExhausted { requested: u64, available: u64 },

    // =========================================================================
    // Coordination Errors
    // =========================================================================
    #[error("Resource busy: {resource} held by {holder}")]
    Busy { resource: String, holder: String },

    #[error("Version conflict on {key}: expected {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("Fencing token {presented} rejected for {resource} (current {current})")]
    FencingTokenRejected {
        resource: String,
        presented: u64,
        current: u64,
    },

    // =========================================================================
    // Task Flow Errors
    // =========================================================================
    #[error("Step {step} failed: {reason}")]
    StepFailed { step: String, reason: String },

    #[error("Compensation failed for flow {flow_id} at step {step}: {reason}")]
    CompensationFailed {
        flow_id: String,
        step: String,
        reason: String,
    },

    #[error("Flow cancelled before running: {flow_id}")]
    FlowCancelled { flow_id: String },

    #[error("Flow not found: {flow_id}")]
    FlowNotFound { flow_id: String },

    /// The first write of a flow did not land, so nothing was persisted
    #[error("Flow {flow_id} not started: {source}")]
    FlowNotStarted {
        flow_id: String,
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Registry Errors
    // =========================================================================
    #[error("Stale report from {backend}: sequence {received} <= {last_accepted}")]
    StaleReport {
        backend: String,
        received: u64,
        last_accepted: u64,
    },

    #[error("Backend not found: {backend}")]
    BackendNotFound { backend: String },

    #[error("Backend unavailable: {backend}")]
    BackendUnavailable { backend: String },

    // =========================================================================
    // Volume Errors
    // =========================================================================
    #[error("Volume not found: {volume_id}")]
    VolumeNotFound { volume_id: String },

    #[error("Snapshot not found: {snapshot_id}")]
    SnapshotNotFound { snapshot_id: String },

    #[error("Volume {volume_id} cannot {operation} from state {from}")]
    InvalidTransition {
        volume_id: String,
        from: String,
        operation: String,
    },

    // =========================================================================
    // Driver Errors
    // =========================================================================
    #[error("Driver operation failed: {backend} - {operation}: {reason}")]
    Driver {
        backend: String,
        operation: String,
        reason: String,
    },

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Action to take on an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry locally with bounded exponential backoff
    RetryWithBackoff,
    /// Retry after a fixed delay
    RetryAfter(Duration),
    /// Log and drop, the caller keeps going
    Drop,
    /// Surface to the caller as the terminal result
    Surface,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            Error::FlowNotStarted { source, .. } => source.action(),

            // Contention - retry with backoff
            Error::Busy { .. } | Error::Conflict { .. } => ErrorAction::RetryWithBackoff,

            // Backend flapping - give it a moment
            Error::BackendUnavailable { .. } => ErrorAction::RetryAfter(Duration::from_secs(5)),

            // Out-of-order reports are expected under push/pull races
            Error::StaleReport { .. } => ErrorAction::Drop,

            _ => ErrorAction::Surface,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.action(),
            ErrorAction::RetryWithBackoff | ErrorAction::RetryAfter(_)
        )
    }

    /// Check if this error is transient contention
    pub fn is_transient(&self) -> bool {
        match self {
            Error::FlowNotStarted { source, .. } => source.is_transient(),
            other => matches!(other, Error::Busy { .. } | Error::Conflict { .. }),
        }
    }

    /// Unwrap a flow that never started into the error that stopped it
    pub fn into_cause(self) -> Error {
        match self {
            Error::FlowNotStarted { source, .. } => (*source).into_cause(),
            other => other,
        }
    }

    /// Persistently inconsistent state that needs a human
    pub fn requires_operator(&self) -> bool {
        matches!(self, Error::CompensationFailed { .. })
    }

    /// Short machine-readable code, used in events and API responses
    pub fn code(&self) -> &'static str {
        match self {
            Error::Internal(_) => "internal",
            Error::Configuration(_) => "configuration",
            Error::Validation(_) => "validation",
            Error::NoCapableBackend { .. } => "no_capable_backend",
            Error::CapacityExhausted { .. } => "capacity_exhausted",
            Error::Busy { .. } => "busy",
            Error::Conflict { .. } => "conflict",
            Error::FencingTokenRejected { .. } => "fencing_token_rejected",
            Error::StepFailed { .. } => "step_failed",
            Error::CompensationFailed { .. } => "compensation_failed",
            Error::FlowCancelled { .. } => "cancelled",
            Error::FlowNotFound { .. } => "flow_not_found",
            Error::FlowNotStarted { source, .. } => source.code(),
            Error::StaleReport { .. } => "stale_report",
            Error::BackendNotFound { .. } => "backend_not_found",
            Error::BackendUnavailable { .. } => "backend_unavailable",
            Error::VolumeNotFound { .. } => "volume_not_found",
            Error::SnapshotNotFound { .. } => "snapshot_not_found",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::Driver { .. } => "driver",
            Error::Serialization(_) => "serialization",
            Error::Yaml(_) => "yaml",
            Error::Io(_) => "io",
            Error::Metrics(_) => "metrics",
        }
    }
}

/// Result type alias for the orchestrator
pub type Result<T> = std::result::Result<T, Error>;
