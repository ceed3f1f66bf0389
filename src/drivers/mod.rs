//! Storage Backend Drivers
//!
//! A closed set of driver variants behind the `VolumeDriver` port:
//! - LVM: thin pools exported over iSCSI
//! - NFS: sparse files on a share, multiattach capable
//!
//! Both variants simulate their backend in memory while keeping the driver
//! contract, including idempotence by operation id.

pub mod lvm;
pub mod nfs;
mod pool;
#[cfg(test)]
pub mod scripted;

pub use lvm::*;
pub use nfs::*;

use crate::domain::ports::{BackendId, BackendKind, VolumeDriverRef};
use crate::error::{Error, Result};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// =============================================================================
// Backend Configuration
// =============================================================================

/// One configured backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSpec {
    pub id: BackendId,
    pub kind: BackendKind,
    pub total_bytes: u64,
    /// Share of total capacity never handed to the scheduler
    #[serde(default)]
    pub reserved_percentage: u8,
    #[serde(default)]
    pub volume_types: BTreeSet<String>,
    #[serde(default)]
    pub qos_tags: BTreeSet<String>,
    #[serde(default)]
    pub encryption: bool,
    #[serde(default)]
    pub lvm: LvmConfig,
    #[serde(default)]
    pub nfs: NfsConfig,
}

impl BackendSpec {
    pub fn new(id: impl Into<BackendId>, kind: BackendKind, total_bytes: u64) -> Self {
        Self {
            id: id.into(),
            kind,
            total_bytes,
            reserved_percentage: 0,
            volume_types: BTreeSet::new(),
            qos_tags: BTreeSet::new(),
            encryption: false,
            lvm: LvmConfig::default(),
            nfs: NfsConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().is_empty() {
            return Err(Error::Configuration("backend id must not be empty".into()));
        }
        if self.total_bytes == 0 {
            return Err(Error::Configuration(format!(
                "backend {} has zero capacity",
                self.id
            )));
        }
        if self.reserved_percentage > 100 {
            return Err(Error::Configuration(format!(
                "backend {} reserved_percentage {} exceeds 100",
                self.id, self.reserved_percentage
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Builds drivers by backend kind
pub struct DriverFactory;

impl DriverFactory {
    pub fn create(spec: &BackendSpec) -> Result<VolumeDriverRef> {
        spec.validate()?;
        Ok(match spec.kind {
            BackendKind::Lvm => Arc::new(LvmDriver::new(spec)),
            BackendKind::Nfs => Arc::new(NfsDriver::new(spec)),
        })
    }
}

// =============================================================================
// Driver Set
// =============================================================================

/// A registered driver with its report bookkeeping
pub struct DriverEntry {
    pub driver: VolumeDriverRef,
    pub reserved_percentage: u8,
    last_sequence: AtomicU64,
}

impl DriverEntry {
    /// Next report sequence number
    ///
    /// Seeded from wall-clock milliseconds so numbers keep increasing across
    /// process restarts.
    pub fn next_sequence(&self) -> u64 {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let mut current = self.last_sequence.load(Ordering::Relaxed);
        loop {
            let next = now.max(current + 1);
            match self.last_sequence.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Drivers by backend id
#[derive(Default)]
pub struct DriverSet {
    drivers: RwLock<BTreeMap<BackendId, Arc<DriverEntry>>>,
}

impl DriverSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Build drivers for every spec
    pub fn from_specs(specs: &[BackendSpec]) -> Result<Arc<Self>> {
        let set = Self::new();
        for spec in specs {
            set.register(DriverFactory::create(spec)?, spec.reserved_percentage);
        }
        Ok(set)
    }

    pub fn register(&self, driver: VolumeDriverRef, reserved_percentage: u8) {
        let id = driver.backend_id().clone();
        self.drivers.write().insert(
            id,
            Arc::new(DriverEntry {
                driver,
                reserved_percentage,
                last_sequence: AtomicU64::new(0),
            }),
        );
    }

    pub fn remove(&self, backend_id: &BackendId) -> bool {
        self.drivers.write().remove(backend_id).is_some()
    }

    pub fn get(&self, backend_id: &BackendId) -> Result<VolumeDriverRef> {
        self.entry(backend_id).map(|e| e.driver.clone())
    }

    pub fn entry(&self, backend_id: &BackendId) -> Result<Arc<DriverEntry>> {
        self.drivers
            .read()
            .get(backend_id)
            .cloned()
            .ok_or_else(|| Error::BackendNotFound {
                backend: backend_id.to_string(),
            })
    }

    pub fn entries(&self) -> Vec<Arc<DriverEntry>> {
        self.drivers.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.drivers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_by_kind() {
        let lvm = DriverFactory::create(&BackendSpec::new("lvm-a", BackendKind::Lvm, 100)).unwrap();
        assert_eq!(lvm.kind(), BackendKind::Lvm);
        assert_eq!(lvm.backend_id().as_str(), "lvm-a");

        let nfs = DriverFactory::create(&BackendSpec::new("nfs-a", BackendKind::Nfs, 100)).unwrap();
        assert_eq!(nfs.kind(), BackendKind::Nfs);
    }

    #[test]
    fn test_invalid_spec_rejected() {
        let mut spec = BackendSpec::new("lvm-a", BackendKind::Lvm, 100);
        spec.reserved_percentage = 120;
        assert!(matches!(DriverFactory::create(&spec), Err(Error::Configuration(_))));
        assert!(DriverFactory::create(&BackendSpec::new("x", BackendKind::Lvm, 0)).is_err());
    }

    #[test]
    fn test_driver_set_lookup() {
        let set = DriverSet::from_specs(&[
            BackendSpec::new("lvm-a", BackendKind::Lvm, 100),
            BackendSpec::new("nfs-a", BackendKind::Nfs, 100),
        ])
        .unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.get(&BackendId::new("lvm-a")).is_ok());
        assert!(matches!(
            set.get(&BackendId::new("missing")),
            Err(Error::BackendNotFound { .. })
        ));
    }

    #[test]
    fn test_sequence_strictly_increases() {
        let set = DriverSet::from_specs(&[BackendSpec::new("lvm-a", BackendKind::Lvm, 100)]).unwrap();
        let entry = set.entry(&BackendId::new("lvm-a")).unwrap();
        let a = entry.next_sequence();
        let b = entry.next_sequence();
        assert!(b > a);
    }

    #[test]
    fn test_spec_from_yaml() {
        let yaml = r#"
id: nfs-gold
kind: nfs
total_bytes: 1099511627776
reserved_percentage: 10
volume_types: [standard]
nfs:
  share: "filer:/export/gold"
"#;
        let spec: BackendSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.kind, BackendKind::Nfs);
        assert_eq!(spec.nfs.share, "filer:/export/gold");
        assert_eq!(spec.lvm.volume_group, LvmConfig::default().volume_group);
    }
}
