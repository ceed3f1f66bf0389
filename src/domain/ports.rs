//! Domain Ports - Core trait definitions for the volume orchestrator
//!
//! These traits define the boundaries between the orchestration engine and
//! external systems: storage backend drivers, the durable state store and
//! the event bus. Adapters implement these traits to provide concrete
//! functionality.

use crate::domain::events::VolumeEvent;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

// =============================================================================
// Backend Identity
// =============================================================================

/// Unique identifier for a storage backend
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendId(pub String);

impl BackendId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BackendId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for BackendId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for BackendId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Closed set of driver implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// LVM thin pool exported over iSCSI
    Lvm,
    /// File-backed volumes on an NFS share
    Nfs,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Lvm => write!(f, "lvm"),
            BackendKind::Nfs => write!(f, "nfs"),
        }
    }
}

// =============================================================================
// Capabilities
// =============================================================================

/// Capabilities a backend advertises
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    /// Volume types this backend can host
    pub volume_types: BTreeSet<String>,
    /// QoS tags this backend honors
    pub qos_tags: BTreeSet<String>,
    /// Highest replication factor supported
    pub max_replication: u32,
    /// At-rest encryption support
    pub encryption: bool,
    /// A volume may be attached to several hosts at once
    pub multiattach: bool,
    /// Thin provisioned volumes
    pub thin_provisioning: bool,
}

/// Capabilities a volume request requires
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRequirements {
    /// Required volume type
    #[serde(default)]
    pub volume_type: Option<String>,
    /// Required QoS tags
    #[serde(default)]
    pub qos_tags: BTreeSet<String>,
    /// Required replication factor (0 and 1 both mean unreplicated)
    #[serde(default)]
    pub replication: u32,
    /// Require encryption
    #[serde(default)]
    pub encrypted: bool,
    /// Require multiattach
    #[serde(default)]
    pub multiattach: bool,
    /// Require thin provisioning
    #[serde(default)]
    pub thin_provisioning: bool,
}

impl CapabilitySet {
    /// True when this set is a superset of the requirements
    pub fn satisfies(&self, req: &CapabilityRequirements) -> bool {
        if let Some(volume_type) = &req.volume_type {
            if !self.volume_types.contains(volume_type) {
                return false;
            }
        }

        req.qos_tags.is_subset(&self.qos_tags)
            && req.replication.max(1) <= self.max_replication.max(1)
            && (!req.encrypted || self.encryption)
            && (!req.multiattach || self.multiattach)
            && (!req.thin_provisioning || self.thin_provisioning)
    }
}

impl std::fmt::Display for CapabilityRequirements {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "type={} qos=[{}] replication={} encrypted={} multiattach={} thin={}",
            self.volume_type.as_deref().unwrap_or("any"),
            self.qos_tags.iter().cloned().collect::<Vec<_>>().join(","),
            self.replication,
            self.encrypted,
            self.multiattach,
            self.thin_provisioning
        )
    }
}

// =============================================================================
// Driver Contract Types
// =============================================================================

/// Capacity as reported by a backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityReport {
    pub free_bytes: u64,
    pub total_bytes: u64,
    /// Controller utilization (0-100)
    pub utilization_percent: u8,
    /// Sum of the sizes of every volume on the backend; exceeds
    /// `total_bytes - free_bytes` on thin pools
    #[serde(default)]
    pub provisioned_bytes: u64,
}

/// Volume handed to a driver for creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub volume_id: String,
    pub name: String,
    pub size_bytes: u64,
    pub requirements: CapabilityRequirements,
}

/// Host-side description of an attach request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connector {
    pub host: String,
    #[serde(default)]
    pub initiator: Option<String>,
}

/// Connection details returned by a successful attach
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub attachment_id: String,
    pub protocol: String,
    pub target: String,
    pub details: BTreeMap<String, String>,
}

// =============================================================================
// Volume Driver Port
// =============================================================================

/// Port for backend driver operations
///
/// Every mutating call takes a caller-supplied operation id and must be safe
/// to repeat with the same input: the task flow engine re-invokes calls after
/// a crash-resume. Deleting something that is already gone succeeds.
#[async_trait]
pub trait VolumeDriver: Send + Sync {
    /// Backend this driver serves
    fn backend_id(&self) -> &BackendId;

    /// Driver variant
    fn kind(&self) -> BackendKind;

    /// Capabilities the backend can currently satisfy
    async fn probe_capability(&self) -> Result<CapabilitySet>;

    /// Current free/total capacity
    async fn report_capacity(&self) -> Result<CapacityReport>;

    /// Create a volume, returning the driver's reference to it
    async fn create(&self, op_id: &str, spec: &VolumeSpec) -> Result<String>;

    /// Create a volume as a copy of a snapshot held on this backend
    async fn clone_volume(&self, op_id: &str, snapshot_ref: &str, spec: &VolumeSpec)
        -> Result<String>;

    /// Delete a volume
    async fn delete(&self, op_id: &str, driver_ref: &str) -> Result<()>;

    /// Snapshot a volume, returning the snapshot reference
    async fn snapshot(&self, op_id: &str, driver_ref: &str) -> Result<String>;

    /// Delete a snapshot
    async fn delete_snapshot(&self, op_id: &str, snapshot_ref: &str) -> Result<()>;

    /// Grow a volume
    async fn extend(&self, op_id: &str, driver_ref: &str, new_size_bytes: u64) -> Result<()>;

    /// Export a volume to a host
    async fn attach(
        &self,
        op_id: &str,
        driver_ref: &str,
        connector: &Connector,
    ) -> Result<ConnectionInfo>;

    /// Remove an export
    async fn detach(&self, op_id: &str, driver_ref: &str, attachment_id: &str) -> Result<()>;

    /// Check if backend is reachable
    async fn health_check(&self) -> Result<bool>;
}

// =============================================================================
// State Store Port
// =============================================================================

/// A value together with its store version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    pub version: u64,
}

/// Payload of a single write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteKind {
    Put(Vec<u8>),
    Delete,
}

/// A single write inside an atomic commit
///
/// `expected_version` guards the write: `None` writes unconditionally,
/// `Some(0)` requires the key to be absent, `Some(v)` requires the stored
/// version to equal `v`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOp {
    pub key: String,
    pub kind: WriteKind,
    pub expected_version: Option<u64>,
}

impl WriteOp {
    /// Serialize `value` as JSON and put it under `key`
    pub fn put_json<T: Serialize>(
        key: impl Into<String>,
        value: &T,
        expected_version: Option<u64>,
    ) -> Result<Self> {
        Ok(Self {
            key: key.into(),
            kind: WriteKind::Put(serde_json::to_vec(value)?),
            expected_version,
        })
    }

    /// Delete `key`
    pub fn delete(key: impl Into<String>, expected_version: Option<u64>) -> Self {
        Self {
            key: key.into(),
            kind: WriteKind::Delete,
            expected_version,
        }
    }
}

/// Port for the durable key-value store
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read a key
    async fn get(&self, key: &str) -> Result<Option<Versioned>>;

    /// List all keys under a prefix, in key order
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned)>>;

    /// Apply all writes atomically or none of them
    ///
    /// Returns the new version of each written key, in input order
    /// (0 for deletes). Fails with `Conflict` on the first guard mismatch.
    async fn commit(&self, ops: Vec<WriteOp>) -> Result<Vec<u64>>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for terminal request events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: VolumeEvent) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type VolumeDriverRef = Arc<dyn VolumeDriver>;
pub type StateStoreRef = Arc<dyn StateStore>;
pub type EventPublisherRef = Arc<dyn EventPublisher>;
