//! LVM Block Storage Driver
//!
//! Logical volumes in a thin pool, exported as iSCSI targets.

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

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the LVM driver
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LvmConfig {
    /// Volume group holding the thin pool
    pub volume_group: String,
    /// IQN prefix of exported targets
    pub target_prefix: String,
    /// iSCSI portal address
    pub target_portal: String,
    /// Thin provisioning
    pub thin: bool,
}

impl Default for LvmConfig {
    fn default() -> Self {
        Self {
            volume_group: "cinder-volumes".to_string(),
            target_prefix: "iqn.2010-10.org.openstack:".to_string(),
            target_portal: "127.0.0.1:3260".to_string(),
            thin: true,
        }
    }
}

// =============================================================================
// LVM Driver
// =============================================================================

/// Driver for LVM thin pools
pub struct LvmDriver {
    id: BackendId,
    config: LvmConfig,
    capabilities: CapabilitySet,
    pool: SimulatedPool,
}

impl LvmDriver {
    pub fn new(spec: &BackendSpec) -> Self {
        let volume_types = if spec.volume_types.is_empty() {
            BTreeSet::from(["lvm".to_string()])
        } else {
            spec.volume_types.clone()
        };
        let capabilities = CapabilitySet {
            volume_types,
            qos_tags: spec.qos_tags.clone(),
            max_replication: 1,
            encryption: spec.encryption,
            multiattach: false,
            thin_provisioning: spec.lvm.thin,
        };

        Self {
            id: spec.id.clone(),
            config: spec.lvm.clone(),
            capabilities,
            pool: SimulatedPool::new(spec.id.clone(), "lvm", spec.total_bytes),
        }
    }

    fn lv_path(&self, volume_id: &str) -> String {
        format!("{}/volume-{}", self.config.volume_group, volume_id)
    }

    fn target_iqn(&self, driver_ref: &str) -> String {
        let lv_name = driver_ref.rsplit('/').next().unwrap_or(driver_ref);
        format!("{}{}", self.config.target_prefix, lv_name)
    }

    /// Simulate the backend going away
    pub fn set_available(&self, available: bool) {
        self.pool.set_available(available);
    }

    pub fn volume_size(&self, driver_ref: &str) -> Option<u64> {
        self.pool.volume_size(driver_ref)
    }
}

#[async_trait]
impl VolumeDriver for LvmDriver {
    fn backend_id(&self) -> &BackendId {
        &self.id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Lvm
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
        let path = self.lv_path(&spec.volume_id);
        let driver_ref = self.pool.allocate(op_id, &path, spec.size_bytes)?;
        info!(backend = %self.id, lv = %driver_ref, size = spec.size_bytes, "Created logical volume");
        Ok(driver_ref)
    }

    async fn clone_volume(
        &self,
        op_id: &str,
        snapshot_ref: &str,
        spec: &VolumeSpec,
    ) -> Result<String> {
        let path = self.lv_path(&spec.volume_id);
        let driver_ref = self
            .pool
            .clone_from(op_id, snapshot_ref, &path, spec.size_bytes)?;
        info!(backend = %self.id, lv = %driver_ref, snapshot = %snapshot_ref, "Created logical volume from snapshot");
        Ok(driver_ref)
    }

    async fn delete(&self, _op_id: &str, driver_ref: &str) -> Result<()> {
        if self.pool.release(driver_ref)? {
            info!(backend = %self.id, lv = %driver_ref, "Removed logical volume");
        } else {
            debug!(backend = %self.id, lv = %driver_ref, "Logical volume already absent");
        }
        Ok(())
    }

    async fn snapshot(&self, op_id: &str, driver_ref: &str) -> Result<String> {
        let snapshot_ref = format!("{}-snap-{}", driver_ref, generate_id("lv"));
        let snapshot_ref = self.pool.snapshot(op_id, driver_ref, &snapshot_ref)?;
        debug!(backend = %self.id, snapshot = %snapshot_ref, "Created thin snapshot");
        Ok(snapshot_ref)
    }

    async fn delete_snapshot(&self, _op_id: &str, snapshot_ref: &str) -> Result<()> {
        self.pool.release_snapshot(snapshot_ref)?;
        Ok(())
    }

    async fn extend(&self, _op_id: &str, driver_ref: &str, new_size_bytes: u64) -> Result<()> {
        self.pool.resize(driver_ref, new_size_bytes)?;
        info!(backend = %self.id, lv = %driver_ref, new_size = new_size_bytes, "Extended logical volume");
        Ok(())
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
        details.insert("target_portal".to_string(), self.config.target_portal.clone());
        details.insert("target_lun".to_string(), "0".to_string());
        if let Some(initiator) = &connector.initiator {
            details.insert("initiator".to_string(), initiator.clone());
        }

        Ok(ConnectionInfo {
            attachment_id,
            protocol: "iscsi".to_string(),
            target: self.target_iqn(driver_ref),
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
