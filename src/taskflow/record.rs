//! Persisted flow records

use super::context::FlowContext;
use crate::domain::events::OperationKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Pending,
    Running,
    Reverting,
    Success,
    Compensated,
    CompensationFailed,
    Cancelled,
}

impl FlowStatus {
    /// No transition out of a terminal status is ever persisted
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowStatus::Success
                | FlowStatus::Compensated
                | FlowStatus::CompensationFailed
                | FlowStatus::Cancelled
        )
    }

    /// Left behind by a worker that stopped mid-flow
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            FlowStatus::Pending | FlowStatus::Running | FlowStatus::Reverting
        )
    }
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FlowStatus::Pending => "pending",
            FlowStatus::Running => "running",
            FlowStatus::Reverting => "reverting",
            FlowStatus::Success => "success",
            FlowStatus::Compensated => "compensated",
            FlowStatus::CompensationFailed => "compensation_failed",
            FlowStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Pending,
    Committed,
    Failed,
    Compensated,
    CompensationFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub outcome: StepOutcome,
}

/// Error as persisted with a flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowError {
    pub step: String,
    pub code: String,
    pub message: String,
}

/// Durable state of one flow
///
/// In the forward direction every step before `step_index` has committed.
/// While reverting, every step at or after `step_index` has been
/// compensated or never committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub flow_id: String,
    pub kind: OperationKind,
    pub volume_id: String,
    pub status: FlowStatus,
    pub step_index: usize,
    pub steps: Vec<StepRecord>,
    pub context: FlowContext,
    #[serde(default)]
    pub last_error: Option<FlowError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlowRecord {
    pub fn new(kind: OperationKind, step_names: &[&str], context: FlowContext, now: DateTime<Utc>) -> Self {
        Self {
            flow_id: context.flow_id.clone(),
            kind,
            volume_id: context.volume_id.clone(),
            status: FlowStatus::Pending,
            step_index: 0,
            steps: step_names
                .iter()
                .map(|name| StepRecord {
                    name: name.to_string(),
                    outcome: StepOutcome::Pending,
                })
                .collect(),
            context,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn committed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.outcome == StepOutcome::Committed)
            .count()
    }
}
