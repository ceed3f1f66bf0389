//! Lifecycle requests and their results

use crate::domain::events::OperationKind;
use crate::domain::ports::{CapabilityRequirements, ConnectionInfo, Connector};
use crate::error::{Error, Result};
use crate::volume::{Snapshot, Volume};
use serde::{Deserialize, Serialize};

/// Operation a request asks for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum VolumeOperation {
    Create {
        name: String,
        size_bytes: u64,
        #[serde(default)]
        capabilities: CapabilityRequirements,
        /// Caller-chosen id; naming an `error_creating` volume retries it
        #[serde(default)]
        volume_id: Option<String>,
    },
    /// New volume copied from a snapshot, on the snapshot's backend
    CreateFromSnapshot {
        name: String,
        snapshot_id: String,
        /// Defaults to the snapshot's size; may not be smaller
        #[serde(default)]
        size_bytes: Option<u64>,
        #[serde(default)]
        volume_id: Option<String>,
    },
    Delete {
        volume_id: String,
    },
    Snapshot {
        volume_id: String,
        name: String,
    },
    Extend {
        volume_id: String,
        new_size_bytes: u64,
    },
    Attach {
        volume_id: String,
        connector: Connector,
    },
    Detach {
        volume_id: String,
        attachment_id: String,
    },
}

impl VolumeOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            VolumeOperation::Create { .. } | VolumeOperation::CreateFromSnapshot { .. } => {
                OperationKind::Create
            }
            VolumeOperation::Delete { .. } => OperationKind::Delete,
            VolumeOperation::Snapshot { .. } => OperationKind::Snapshot,
            VolumeOperation::Extend { .. } => OperationKind::Extend,
            VolumeOperation::Attach { .. } => OperationKind::Attach,
            VolumeOperation::Detach { .. } => OperationKind::Detach,
        }
    }

    /// Target volume; `None` for a create whose id is assigned on intake
    pub fn volume_id(&self) -> Option<&str> {
        match self {
            VolumeOperation::Create { volume_id, .. }
            | VolumeOperation::CreateFromSnapshot { volume_id, .. } => volume_id.as_deref(),
            VolumeOperation::Delete { volume_id }
            | VolumeOperation::Snapshot { volume_id, .. }
            | VolumeOperation::Extend { volume_id, .. }
            | VolumeOperation::Attach { volume_id, .. }
            | VolumeOperation::Detach { volume_id, .. } => Some(volume_id),
        }
    }

    /// Shape checks that need no stored state
    pub fn validate(&self) -> Result<()> {
        if let Some(volume_id) = self.volume_id() {
            if volume_id.is_empty() {
                return Err(Error::Validation("volume_id must not be empty".into()));
            }
        }

        match self {
            VolumeOperation::Create { name, size_bytes, .. } => {
                if name.trim().is_empty() {
                    return Err(Error::Validation("volume name must not be empty".into()));
                }
                if *size_bytes == 0 {
                    return Err(Error::Validation("size_bytes must be positive".into()));
                }
            }
            VolumeOperation::CreateFromSnapshot {
                name,
                snapshot_id,
                size_bytes,
                ..
            } => {
                if name.trim().is_empty() {
                    return Err(Error::Validation("volume name must not be empty".into()));
                }
                if snapshot_id.is_empty() {
                    return Err(Error::Validation("snapshot_id must not be empty".into()));
                }
                if *size_bytes == Some(0) {
                    return Err(Error::Validation("size_bytes must be positive".into()));
                }
            }
            VolumeOperation::Snapshot { name, .. } if name.trim().is_empty() => {
                return Err(Error::Validation("snapshot name must not be empty".into()));
            }
            VolumeOperation::Extend { new_size_bytes: 0, .. } => {
                return Err(Error::Validation("new_size_bytes must be positive".into()));
            }
            VolumeOperation::Attach { connector, .. } if connector.host.is_empty() => {
                return Err(Error::Validation("connector host must not be empty".into()));
            }
            VolumeOperation::Detach { attachment_id, .. } if attachment_id.is_empty() => {
                return Err(Error::Validation("attachment_id must not be empty".into()));
            }
            _ => {}
        }
        Ok(())
    }
}

/// A lifecycle request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRequest {
    /// Caller-chosen id; the terminal event carries it back
    pub request_id: String,
    #[serde(flatten)]
    pub operation: VolumeOperation,
}

impl VolumeRequest {
    pub fn new(request_id: impl Into<String>, operation: VolumeOperation) -> Self {
        Self {
            request_id: request_id.into(),
            operation,
        }
    }
}

/// Result of a completed request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeHandle {
    pub request_id: String,
    pub flow_id: String,
    /// Volume as left by the request
    pub volume: Volume,
    /// Snapshot taken, for snapshot requests
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Snapshot>,
    /// Connection details, for attach requests
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_request_json_shape() {
        let json = r#"{
            "request_id": "req-1",
            "operation": "create",
            "name": "db",
            "size_bytes": 1024,
            "capabilities": { "volume_type": "lvm" }
        }"#;
        let request: VolumeRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.operation.kind(), OperationKind::Create);
        assert_matches!(
            &request.operation,
            VolumeOperation::Create { capabilities, .. } if capabilities.volume_type.as_deref() == Some("lvm")
        );
    }

    #[test]
    fn test_validation() {
        let empty_name = VolumeOperation::Create {
            name: " ".into(),
            size_bytes: 1,
            capabilities: CapabilityRequirements::default(),
            volume_id: None,
        };
        assert_matches!(empty_name.validate(), Err(Error::Validation(_)));

        let zero = VolumeOperation::Create {
            name: "db".into(),
            size_bytes: 0,
            capabilities: CapabilityRequirements::default(),
            volume_id: None,
        };
        assert_matches!(zero.validate(), Err(Error::Validation(_)));

        let no_volume = VolumeOperation::Delete {
            volume_id: String::new(),
        };
        assert_matches!(no_volume.validate(), Err(Error::Validation(_)));

        let attach = VolumeOperation::Attach {
            volume_id: "vol-1".into(),
            connector: Connector {
                host: "node-1".into(),
                initiator: None,
            },
        };
        assert!(attach.validate().is_ok());
        assert_eq!(attach.volume_id(), Some("vol-1"));

        let clone = VolumeOperation::CreateFromSnapshot {
            name: "db-copy".into(),
            snapshot_id: String::new(),
            size_bytes: None,
            volume_id: None,
        };
        assert_matches!(clone.validate(), Err(Error::Validation(_)));
        assert_eq!(clone.kind(), OperationKind::Create);
    }

    #[test]
    fn test_create_from_snapshot_json() {
        let json = r#"{
            "request_id": "req-2",
            "operation": "create_from_snapshot",
            "name": "db-copy",
            "snapshot_id": "snap-1"
        }"#;
        let request: VolumeRequest = serde_json::from_str(json).unwrap();
        assert_matches!(
            &request.operation,
            VolumeOperation::CreateFromSnapshot { snapshot_id, size_bytes: None, .. } if snapshot_id == "snap-1"
        );
        assert_eq!(request.operation.volume_id(), None);
    }
}
