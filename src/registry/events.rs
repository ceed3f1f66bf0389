//! Registry Events
//!
//! Events emitted by the capability registry for external consumers to react
//! to backend lifecycle changes.

use serde::{Deserialize, Serialize};

/// Events emitted by the capability registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegistryEvent {
    /// A report was accepted
    BackendReported {
        backend_id: String,
        sequence_no: u64,
        free_bytes: u64,
        total_bytes: u64,
    },

    /// A report was dropped as out of order
    ReportRejected {
        backend_id: String,
        sequence_no: u64,
        last_accepted: u64,
    },

    /// A backend was first seen
    BackendAdded { backend_id: String },

    /// A backend was removed by an operator
    BackendRemoved { backend_id: String },
}

impl RegistryEvent {
    /// Get the backend ID associated with this event
    pub fn backend_id(&self) -> &str {
        match self {
            RegistryEvent::BackendReported { backend_id, .. } => backend_id,
            RegistryEvent::ReportRejected { backend_id, .. } => backend_id,
            RegistryEvent::BackendAdded { backend_id } => backend_id,
            RegistryEvent::BackendRemoved { backend_id } => backend_id,
        }
    }

    /// Check if this event changed registry contents
    pub fn is_mutation(&self) -> bool {
        !matches!(self, RegistryEvent::ReportRejected { .. })
    }
}
