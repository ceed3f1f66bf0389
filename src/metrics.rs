//! Prometheus metrics for the orchestrator
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `volume_orchestrator_requests_total` | Counter | `operation`, `outcome` |
//! | `volume_orchestrator_flows_total` | Counter | `operation`, `status` |
//! | `volume_orchestrator_flow_duration_seconds` | Histogram | `operation` |
//! | `volume_orchestrator_scheduling_failures_total` | Counter | `reason` |
//! | `volume_orchestrator_stale_reports_total` | Counter | |
//! | `volume_orchestrator_swept_reservations_total` | Counter | |
//! | `volume_orchestrator_backends` | Gauge | `freshness` |
//!
//! Metrics live in a registry owned by [`OrchestratorMetrics`] rather than
//! the process-global default, so several orchestrators (tests) can coexist.

use crate::domain::events::OperationKind;
use crate::error::{Error, Result};
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounter, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Flow duration buckets, in seconds
const FLOW_DURATION_BUCKETS: &[f64] = &[0.005, 0.025, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0];

/// Orchestrator metrics and the registry they are exported from
#[derive(Clone)]
pub struct OrchestratorMetrics {
    registry: Registry,
    requests_total: CounterVec,
    flows_total: CounterVec,
    flow_duration: HistogramVec,
    scheduling_failures_total: CounterVec,
    stale_reports_total: IntCounter,
    swept_reservations_total: IntCounter,
    backends: GaugeVec,
}

impl OrchestratorMetrics {
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new(
                "volume_orchestrator_requests_total",
                "Lifecycle requests by operation and outcome",
            ),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let flows_total = CounterVec::new(
            Opts::new(
                "volume_orchestrator_flows_total",
                "Task flows by operation and terminal status",
            ),
            &["operation", "status"],
        )?;
        registry.register(Box::new(flows_total.clone()))?;

        let flow_duration = HistogramVec::new(
            HistogramOpts::new(
                "volume_orchestrator_flow_duration_seconds",
                "Wall time from lock acquisition to terminal status",
            )
            .buckets(FLOW_DURATION_BUCKETS.to_vec()),
            &["operation"],
        )?;
        registry.register(Box::new(flow_duration.clone()))?;

        let scheduling_failures_total = CounterVec::new(
            Opts::new(
                "volume_orchestrator_scheduling_failures_total",
                "Placements that found no backend",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(scheduling_failures_total.clone()))?;

        let stale_reports_total = IntCounter::new(
            "volume_orchestrator_stale_reports_total",
            "Backend reports dropped as out of order",
        )?;
        registry.register(Box::new(stale_reports_total.clone()))?;

        let swept_reservations_total = IntCounter::new(
            "volume_orchestrator_swept_reservations_total",
            "Orphaned reservations released by the sweep",
        )?;
        registry.register(Box::new(swept_reservations_total.clone()))?;

        let backends = GaugeVec::new(
            Opts::new("volume_orchestrator_backends", "Registered backends"),
            &["freshness"],
        )?;
        registry.register(Box::new(backends.clone()))?;

        Ok(Arc::new(Self {
            registry,
            requests_total,
            flows_total,
            flow_duration,
            scheduling_failures_total,
            stale_reports_total,
            swept_reservations_total,
            backends,
        }))
    }

    pub fn request_finished(&self, operation: OperationKind, outcome: &str) {
        let operation = operation.to_string();
        self.requests_total
            .with_label_values(&[operation.as_str(), outcome])
            .inc();
    }

    pub fn flow_finished(&self, operation: OperationKind, status: &str, seconds: f64) {
        let operation = operation.to_string();
        self.flows_total
            .with_label_values(&[operation.as_str(), status])
            .inc();
        self.flow_duration
            .with_label_values(&[operation.as_str()])
            .observe(seconds);
    }

    pub fn scheduling_failed(&self, reason: &str) {
        self.scheduling_failures_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn stale_report(&self) {
        self.stale_reports_total.inc();
    }

    pub fn reservation_swept(&self) {
        self.swept_reservations_total.inc();
    }

    /// Reservations released by the sweep so far
    pub fn swept_reservations(&self) -> u64 {
        self.swept_reservations_total.get()
    }

    pub fn set_backends(&self, fresh: u64, total: u64) {
        self.backends.with_label_values(&["fresh"]).set(fresh as f64);
        self.backends
            .with_label_values(&["stale"])
            .set(total.saturating_sub(fresh) as f64);
    }

    /// Requests seen for `operation` with `outcome`
    pub fn requests(&self, operation: OperationKind, outcome: &str) -> f64 {
        let operation = operation.to_string();
        self.requests_total
            .with_label_values(&[operation.as_str(), outcome])
            .get()
    }

    /// Text exposition of every metric
    pub fn encode_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics encoding: {}", e)))
    }
}
