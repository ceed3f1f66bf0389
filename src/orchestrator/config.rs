//! Orchestrator configuration
//!
//! Loaded from an optional YAML file; every section falls back to its
//! defaults when omitted.

use crate::drivers::BackendSpec;
use crate::error::{Error, Result};
use crate::locking::LockConfig;
use crate::registry::RegistryConfig;
use crate::scheduler::SchedulerConfig;
use crate::taskflow::FlowEngineConfig;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Retry
// =============================================================================

/// Bounded exponential backoff for `Busy` and `Conflict`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    /// Total time spent retrying before the last error surfaces
    pub max_elapsed_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 50,
            max_interval_ms: 2_000,
            max_elapsed_ms: 10_000,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.initial_interval_ms))
            .with_max_interval(Duration::from_millis(self.max_interval_ms))
            .with_max_elapsed_time(Some(Duration::from_millis(self.max_elapsed_ms)))
            .build()
    }
}

// =============================================================================
// Orchestrator Configuration
// =============================================================================

/// Configuration for the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Lock holder name of this worker
    pub worker_id: String,
    /// Backend fleet
    pub backends: Vec<BackendSpec>,
    pub registry: RegistryConfig,
    pub locking: LockConfig,
    pub scheduler: SchedulerConfig,
    pub flows: FlowEngineConfig,
    pub retry: RetryConfig,
    /// Terminal event channel capacity
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("orchestrator-{}", std::process::id()),
            backends: Vec::new(),
            registry: RegistryConfig::default(),
            locking: LockConfig::default(),
            scheduler: SchedulerConfig::default(),
            flows: FlowEngineConfig::default(),
            retry: RetryConfig::default(),
            event_capacity: 1024,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_yaml_str(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_id.is_empty() {
            return Err(Error::Configuration("worker_id must not be empty".into()));
        }
        if self.event_capacity == 0 {
            return Err(Error::Configuration("event_capacity must be positive".into()));
        }

        let mut seen = BTreeSet::new();
        for spec in &self.backends {
            spec.validate()?;
            if !seen.insert(spec.id.clone()) {
                return Err(Error::Configuration(format!(
                    "backend {} is configured twice",
                    spec.id
                )));
            }
        }
        Ok(())
    }
}
