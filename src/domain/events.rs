//! Volume Events
//!
//! Terminal events emitted once per lifecycle request, consumed by upstream
//! request routing and notification.

use crate::volume::VolumeState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle operations a request can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Delete,
    Snapshot,
    Extend,
    Attach,
    Detach,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Create => write!(f, "create"),
            OperationKind::Delete => write!(f, "delete"),
            OperationKind::Snapshot => write!(f, "snapshot"),
            OperationKind::Extend => write!(f, "extend"),
            OperationKind::Attach => write!(f, "attach"),
            OperationKind::Detach => write!(f, "detach"),
        }
    }
}

/// How a request ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RequestOutcome {
    Completed,
    Failed { code: String, reason: String },
}

/// The single terminal event of a request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeEvent {
    pub request_id: String,
    pub volume_id: Option<String>,
    pub operation: OperationKind,
    /// Volume state after the request, when a volume exists
    pub final_state: Option<VolumeState>,
    pub outcome: RequestOutcome,
    pub emitted_at: DateTime<Utc>,
}

impl VolumeEvent {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RequestOutcome::Completed)
    }
}
