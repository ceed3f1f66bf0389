//! Simulated storage pool shared by the in-memory drivers
//!
//! Tracks allocations and exports, and remembers the result of every
//! mutating operation id so a repeated call returns the first answer.

use crate::domain::ports::BackendId;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone)]
pub(crate) struct Export {
    pub driver_ref: String,
    pub host: String,
}

#[derive(Debug, Default)]
struct PoolState {
    /// driver ref -> allocated bytes
    volumes: BTreeMap<String, u64>,
    /// snapshot ref -> source driver ref
    snapshots: BTreeMap<String, String>,
    /// attachment id -> export
    exports: BTreeMap<String, Export>,
    /// op id -> result of the first successful call
    completed: HashMap<String, String>,
}

/// In-memory allocation table
pub(crate) struct SimulatedPool {
    backend: BackendId,
    operation_prefix: &'static str,
    total_bytes: u64,
    state: Mutex<PoolState>,
    available: AtomicBool,
}

impl SimulatedPool {
    pub fn new(backend: BackendId, operation_prefix: &'static str, total_bytes: u64) -> Self {
        Self {
            backend,
            operation_prefix,
            total_bytes,
            state: Mutex::new(PoolState::default()),
            available: AtomicBool::new(true),
        }
    }

    fn fail(&self, operation: &str, reason: impl Into<String>) -> Error {
        Error::Driver {
            backend: self.backend.to_string(),
            operation: format!("{}.{}", self.operation_prefix, operation),
            reason: reason.into(),
        }
    }

    pub fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(Error::BackendUnavailable {
                backend: self.backend.to_string(),
            })
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn used_bytes(&self) -> u64 {
        self.state.lock().volumes.values().sum()
    }

    /// Allocated plus what every snapshot pins of its source
    pub fn provisioned_bytes(&self) -> u64 {
        let state = self.state.lock();
        let pinned: u64 = state
            .snapshots
            .values()
            .filter_map(|source| state.volumes.get(source))
            .sum();
        state.volumes.values().sum::<u64>() + pinned
    }

    pub fn free_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.used_bytes())
    }

    pub fn utilization_percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 0;
        }
        ((self.used_bytes() as u128 * 100) / self.total_bytes as u128).min(100) as u8
    }

    pub fn volume_size(&self, driver_ref: &str) -> Option<u64> {
        self.state.lock().volumes.get(driver_ref).copied()
    }

    pub fn contains_snapshot(&self, snapshot_ref: &str) -> bool {
        self.state.lock().snapshots.contains_key(snapshot_ref)
    }

    pub fn export(&self, attachment_id: &str) -> Option<Export> {
        self.state.lock().exports.get(attachment_id).cloned()
    }

    pub fn allocate(&self, op_id: &str, driver_ref: &str, size_bytes: u64) -> Result<String> {
        self.ensure_available()?;
        let mut state = self.state.lock();

        if let Some(done) = state.completed.get(op_id) {
            return Ok(done.clone());
        }
        if state.volumes.contains_key(driver_ref) {
            state.completed.insert(op_id.to_string(), driver_ref.to_string());
            return Ok(driver_ref.to_string());
        }

        let used: u64 = state.volumes.values().sum();
        let free = self.total_bytes.saturating_sub(used);
        if size_bytes > free {
            return Err(self.fail(
                "create",
                format!("insufficient space: need {} bytes, {} free", size_bytes, free),
            ));
        }

        state.volumes.insert(driver_ref.to_string(), size_bytes);
        state.completed.insert(op_id.to_string(), driver_ref.to_string());
        Ok(driver_ref.to_string())
    }

    /// Missing volumes count as already deleted
    pub fn release(&self, driver_ref: &str) -> Result<bool> {
        self.ensure_available()?;
        let mut state = self.state.lock();
        if state.exports.values().any(|e| e.driver_ref == driver_ref) {
            return Err(self.fail("delete", format!("{} is still exported", driver_ref)));
        }
        state.snapshots.retain(|_, source| source != driver_ref);
        Ok(state.volumes.remove(driver_ref).is_some())
    }

    pub fn snapshot(&self, op_id: &str, driver_ref: &str, snapshot_ref: &str) -> Result<String> {
        self.ensure_available()?;
        let mut state = self.state.lock();

        if let Some(done) = state.completed.get(op_id) {
            return Ok(done.clone());
        }
        if !state.volumes.contains_key(driver_ref) {
            return Err(self.fail("snapshot", format!("source {} not found", driver_ref)));
        }

        state
            .snapshots
            .insert(snapshot_ref.to_string(), driver_ref.to_string());
        state
            .completed
            .insert(op_id.to_string(), snapshot_ref.to_string());
        Ok(snapshot_ref.to_string())
    }

    /// Allocate `driver_ref` as a copy of a snapshot, at least as large as
    /// the snapshot's source
    pub fn clone_from(
        &self,
        op_id: &str,
        snapshot_ref: &str,
        driver_ref: &str,
        size_bytes: u64,
    ) -> Result<String> {
        self.ensure_available()?;
        let source_size = {
            let state = self.state.lock();
            if let Some(done) = state.completed.get(op_id) {
                return Ok(done.clone());
            }
            match state
                .snapshots
                .get(snapshot_ref)
                .and_then(|source| state.volumes.get(source))
            {
                Some(size) => *size,
                None => {
                    return Err(self.fail("clone", format!("snapshot {} not found", snapshot_ref)))
                }
            }
        };
        if size_bytes < source_size {
            return Err(self.fail(
                "clone",
                format!("{} bytes is smaller than the {} byte source", size_bytes, source_size),
            ));
        }
        self.allocate(op_id, driver_ref, size_bytes)
    }

    pub fn release_snapshot(&self, snapshot_ref: &str) -> Result<bool> {
        self.ensure_available()?;
        Ok(self.state.lock().snapshots.remove(snapshot_ref).is_some())
    }

    pub fn resize(&self, driver_ref: &str, new_size_bytes: u64) -> Result<()> {
        self.ensure_available()?;
        let mut state = self.state.lock();

        let current = match state.volumes.get(driver_ref) {
            Some(size) => *size,
            None => return Err(self.fail("extend", format!("{} not found", driver_ref))),
        };
        if new_size_bytes <= current {
            return Ok(());
        }

        let used: u64 = state.volumes.values().sum();
        let delta = new_size_bytes - current;
        if used + delta > self.total_bytes {
            return Err(self.fail("extend", "insufficient space"));
        }

        state.volumes.insert(driver_ref.to_string(), new_size_bytes);
        Ok(())
    }

    /// Returns the attachment id, the same one for a repeated `op_id`
    pub fn export_to(&self, op_id: &str, driver_ref: &str, host: &str, attachment_id: String) -> Result<String> {
        self.ensure_available()?;
        let mut state = self.state.lock();

        if let Some(done) = state.completed.get(op_id) {
            return Ok(done.clone());
        }
        if !state.volumes.contains_key(driver_ref) {
            return Err(self.fail("attach", format!("{} not found", driver_ref)));
        }

        state.exports.insert(
            attachment_id.clone(),
            Export {
                driver_ref: driver_ref.to_string(),
                host: host.to_string(),
            },
        );
        state.completed.insert(op_id.to_string(), attachment_id.clone());
        Ok(attachment_id)
    }

    pub fn unexport(&self, attachment_id: &str) -> Result<bool> {
        self.ensure_available()?;
        Ok(self.state.lock().exports.remove(attachment_id).is_some())
    }
}
