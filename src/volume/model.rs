//! Volume and snapshot records as persisted in the state store

use crate::domain::ports::{BackendId, CapabilityRequirements};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Volume State
// =============================================================================

/// Lifecycle state of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeState {
    Creating,
    Available,
    Attaching,
    InUse,
    Detaching,
    Extending,
    Deleting,
    Deleted,
    ErrorCreating,
    ErrorDeleting,
    ErrorExtending,
}

impl VolumeState {
    /// An operation is in flight on the volume
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            VolumeState::Creating
                | VolumeState::Attaching
                | VolumeState::Detaching
                | VolumeState::Extending
                | VolumeState::Deleting
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            VolumeState::ErrorCreating | VolumeState::ErrorDeleting | VolumeState::ErrorExtending
        )
    }
}

impl std::fmt::Display for VolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VolumeState::Creating => "creating",
            VolumeState::Available => "available",
            VolumeState::Attaching => "attaching",
            VolumeState::InUse => "in_use",
            VolumeState::Detaching => "detaching",
            VolumeState::Extending => "extending",
            VolumeState::Deleting => "deleting",
            VolumeState::Deleted => "deleted",
            VolumeState::ErrorCreating => "error_creating",
            VolumeState::ErrorDeleting => "error_deleting",
            VolumeState::ErrorExtending => "error_extending",
        };
        write!(f, "{}", s)
    }
}

// =============================================================================
// Volume Record
// =============================================================================

/// A host export of a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub attachment_id: String,
    pub host: String,
    pub attached_at: DateTime<Utc>,
}

/// Persisted volume record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub size_bytes: u64,
    pub requirements: CapabilityRequirements,
    pub state: VolumeState,
    /// State before the in-flight operation began
    #[serde(default)]
    pub previous_state: Option<VolumeState>,
    /// Owning backend, set once scheduled
    #[serde(default)]
    pub backend_id: Option<BackendId>,
    /// Driver reference, set once created
    #[serde(default)]
    pub driver_ref: Option<String>,
    /// Store version of this record
    pub version: u64,
    /// Highest fencing token that wrote this record
    pub last_fence: u64,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Volume {
    /// A fresh record, not yet persisted
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        size_bytes: u64,
        requirements: CapabilityRequirements,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            size_bytes,
            requirements,
            state: VolumeState::Creating,
            previous_state: None,
            backend_id: None,
            driver_ref: None,
            version: 0,
            last_fence: 0,
            attachments: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_multiattach(&self) -> bool {
        self.requirements.multiattach
    }

    pub fn attachment(&self, attachment_id: &str) -> Option<&Attachment> {
        self.attachments
            .iter()
            .find(|a| a.attachment_id == attachment_id)
    }
}

// =============================================================================
// Snapshot Record
// =============================================================================

/// Lifecycle state of a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Creating,
    Available,
    Error,
}

/// Persisted snapshot record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub volume_id: String,
    pub name: String,
    pub backend_id: BackendId,
    #[serde(default)]
    pub snapshot_ref: Option<String>,
    pub size_bytes: u64,
    pub status: SnapshotStatus,
    pub created_at: DateTime<Utc>,
}
