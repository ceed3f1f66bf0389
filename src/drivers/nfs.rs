//! NFS File-backed Volume Driver
//!
//! Each volume is a sparse file on a shared export. Any number of hosts can
//! mount the share, so volumes are multiattach capable. Online extend is not
//! supported; the volume state machine only extends detached volumes.

use super::pool::SimulatedPool;
use super::BackendSpec;
use crate::domain::ids::generate_id;
use crate::domain::ports::{
    BackendId, BackendKind, CapabilitySet, CapacityReport, ConnectionInfo, Connector,
    VolumeDriver, VolumeSpec,
};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Configuration for the NFS driver
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NfsConfig {
    /// `server:/path` of the export
    pub share: String,
    /// Options handed to the host's mount
    pub mount_options: String,
}

impl Default for NfsConfig {
    fn default() -> Self {
        Self {
            share: "127.0.0.1:/export/volumes".to_string(),
            mount_options: "vers=4.1".to_string(),
        }
    }
}

/// Driver for NFS-backed volumes
pub struct NfsDriver {
    id: BackendId,
    config: NfsConfig,
    capabilities: CapabilitySet,
    pool: SimulatedPool,
}

impl NfsDriver {
    pub fn new(spec: &BackendSpec) -> Self {
        let volume_types = if spec.volume_types.is_empty() {
            BTreeSet::from(["nfs".to_string()])
        } else {
            spec.volume_types.clone()
        };

        Self {
            id: spec.id.clone(),
            config: spec.nfs.clone(),
            capabilities: CapabilitySet {
                volume_types,
                qos_tags: spec.qos_tags.clone(),
                max_replication: 1,
                encryption: spec.encryption,
                multiattach: true,
                thin_provisioning: true,
            },
            pool: SimulatedPool::new(spec.id.clone(), "nfs", spec.total_bytes),
        }
    }

    fn file_path(&self, volume_id: &str) -> String {
        format!("{}/volume-{}", self.config.share, volume_id)
    }

    pub fn set_available(&self, available: bool) {
        self.pool.set_available(available);
    }
}

#[async_trait]
impl VolumeDriver for NfsDriver {
    fn backend_id(&self) -> &BackendId {
        &self.id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Nfs
    }

    async fn probe_capability(&self) -> Result<CapabilitySet> {
        self.pool.ensure_available()?;
        Ok(self.capabilities.clone())
    }

    async fn report_capacity(&self) -> Result<CapacityReport> {
        self.pool.ensure_available()?;
        Ok(CapacityReport {
            free_bytes: self.pool.free_bytes(),
            total_bytes: self.pool.total_bytes(),
            utilization_percent: self.pool.utilization_percent(),
            provisioned_bytes: self.pool.provisioned_bytes(),
        })
    }

    async fn create(&self, op_id: &str, spec: &VolumeSpec) -> Result<String> {
        let path = self.file_path(&spec.volume_id);
        let driver_ref = self.pool.allocate(op_id, &path, spec.size_bytes)?;
        info!(backend = %self.id, file = %driver_ref, size = spec.size_bytes, "Created backing file");
        Ok(driver_ref)
    }

    /// Server-side file clone of the snapshot onto the same share
    async fn clone_volume(
        &self,
        op_id: &str,
        snapshot_ref: &str,
        spec: &VolumeSpec,
    ) -> Result<String> {
        let path = self.file_path(&spec.volume_id);
        self.pool
            .clone_from(op_id, snapshot_ref, &path, spec.size_bytes)
    }

    async fn delete(&self, _op_id: &str, driver_ref: &str) -> Result<()> {
        if !self.pool.release(driver_ref)? {
            debug!(backend = %self.id, file = %driver_ref, "Backing file already absent");
        }
        Ok(())
    }

    async fn snapshot(&self, op_id: &str, driver_ref: &str) -> Result<String> {
        let snapshot_ref = format!("{}.{}", driver_ref, generate_id("snapshot"));
        self.pool.snapshot(op_id, driver_ref, &snapshot_ref)
    }

    async fn delete_snapshot(&self, _op_id: &str, snapshot_ref: &str) -> Result<()> {
        if !self.pool.release_snapshot(snapshot_ref)? {
            debug!(backend = %self.id, snapshot = %snapshot_ref, "Snapshot file already absent");
        }
        Ok(())
    }

    async fn extend(&self, _op_id: &str, driver_ref: &str, new_size_bytes: u64) -> Result<()> {
        self.pool.resize(driver_ref, new_size_bytes)
    }

    async fn attach(
        &self,
        op_id: &str,
        driver_ref: &str,
        connector: &Connector,
    ) -> Result<ConnectionInfo> {
        let attachment_id = self
            .pool
            .export_to(op_id, driver_ref, &connector.host, generate_id("att"))?;

        let mut details = BTreeMap::new();
        details.insert("export".to_string(), self.config.share.clone());
        details.insert("options".to_string(), self.config.mount_options.clone());

        Ok(ConnectionInfo {
            attachment_id,
            protocol: "nfs".to_string(),
            target: driver_ref.to_string(),
            details,
        })
    }

    async fn detach(&self, _op_id: &str, _driver_ref: &str, attachment_id: &str) -> Result<()> {
        self.pool.unexport(attachment_id)?;
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.pool.is_available())
    }
}
