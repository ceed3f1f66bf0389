//! Flow context
//!
//! Everything a step needs travels in the context, and the context is
//! persisted with the flow record. Steps hold no state of their own, so a
//! resumed flow sees exactly what the crashed worker saw.

use crate::domain::events::OperationKind;
use crate::domain::ports::{BackendId, CapabilityRequirements, ConnectionInfo, Connector};
use crate::scheduler::Reservation;
use serde::{Deserialize, Serialize};

/// Serializable state threaded through the steps of a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowContext {
    pub flow_id: String,
    pub request_id: String,
    pub volume_id: String,
    pub operation: OperationKind,
    /// Fencing token of the volume lock the flow runs under
    pub fence: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub requirements: CapabilityRequirements,
    #[serde(default)]
    pub backend_id: Option<BackendId>,
    #[serde(default)]
    pub driver_ref: Option<String>,
    #[serde(default)]
    pub reservation: Option<Reservation>,
    #[serde(default)]
    pub new_size_bytes: Option<u64>,
    #[serde(default)]
    pub connector: Option<Connector>,
    #[serde(default)]
    pub connection: Option<ConnectionInfo>,
    #[serde(default)]
    pub attachment_id: Option<String>,
    #[serde(default)]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub snapshot_ref: Option<String>,
    /// Driver references of snapshots removed along with the volume
    #[serde(default)]
    pub snapshot_refs: Vec<String>,
    /// Snapshot a create copies from instead of starting empty
    #[serde(default)]
    pub source_snapshot_ref: Option<String>,
}

impl FlowContext {
    pub fn new(
        flow_id: impl Into<String>,
        request_id: impl Into<String>,
        volume_id: impl Into<String>,
        operation: OperationKind,
        fence: u64,
    ) -> Self {
        Self {
            flow_id: flow_id.into(),
            request_id: request_id.into(),
            volume_id: volume_id.into(),
            operation,
            fence,
            name: String::new(),
            size_bytes: 0,
            requirements: CapabilityRequirements::default(),
            backend_id: None,
            driver_ref: None,
            reservation: None,
            new_size_bytes: None,
            connector: None,
            connection: None,
            attachment_id: None,
            snapshot_id: None,
            snapshot_ref: None,
            snapshot_refs: Vec::new(),
            source_snapshot_ref: None,
        }
    }

    /// Operation id handed to drivers for `step`
    ///
    /// Stable across resumes, which is what makes repeated driver calls
    /// idempotent.
    pub fn op_id(&self, step: &str) -> String {
        format!("{}:{}", self.flow_id, step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_id_stable() {
        let ctx = FlowContext::new("flow-1", "req-1", "vol-1", OperationKind::Create, 3);
        assert_eq!(ctx.op_id("create_backend_volume"), "flow-1:create_backend_volume");
        assert_eq!(ctx.clone().op_id("x"), ctx.op_id("x"));
    }
}
