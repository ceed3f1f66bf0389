//! Fault-injecting driver for tests
//!
//! Wraps a real driver, records every call and fails the operations it was
//! told to fail. Can also take the state store down mid-call, like a worker
//! dying while a driver call is in flight.

use crate::domain::ports::{
    BackendId, BackendKind, CapabilitySet, CapacityReport, ConnectionInfo, Connector,
    VolumeDriver, VolumeDriverRef, VolumeSpec,
};
use crate::error::{Error, Result};
use crate::store::MemoryStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub struct ScriptedDriver {
    inner: VolumeDriverRef,
    failures: Mutex<HashMap<&'static str, u32>>,
    crash: Mutex<Option<(&'static str, Arc<MemoryStore>)>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedDriver {
    pub fn wrap(inner: VolumeDriverRef) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failures: Mutex::new(HashMap::new()),
            crash: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Fail the next `times` calls of `operation`
    pub fn fail_next(&self, operation: &'static str, times: u32) {
        self.failures.lock().insert(operation, times);
    }

    /// On the next call of `operation`, make `store` unavailable and fail
    pub fn crash_store_on(&self, operation: &'static str, store: Arc<MemoryStore>) {
        *self.crash.lock() = Some((operation, store));
    }

    /// Operations called so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == operation).count()
    }

    fn enter(&self, operation: &'static str) -> Result<()> {
        self.calls.lock().push(operation.to_string());

        let crash = {
            let mut armed = self.crash.lock();
            if armed.as_ref().map(|(op, _)| *op == operation).unwrap_or(false) {
                armed.take()
            } else {
                None
            }
        };
        if let Some((_, store)) = crash {
            store.set_available(false);
            return Err(Error::Internal("worker crashed".to_string()));
        }

        let mut failures = self.failures.lock();
        if let Some(remaining) = failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Driver {
                    backend: self.inner.backend_id().to_string(),
                    operation: operation.to_string(),
                    reason: "injected failure".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl VolumeDriver for ScriptedDriver {
    fn backend_id(&self) -> &BackendId {
        self.inner.backend_id()
    }

    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    async fn probe_capability(&self) -> Result<CapabilitySet> {
        self.enter("probe_capability")?;
        self.inner.probe_capability().await
    }

    async fn report_capacity(&self) -> Result<CapacityReport> {
        self.enter("report_capacity")?;
        self.inner.report_capacity().await
    }

    async fn create(&self, op_id: &str, spec: &VolumeSpec) -> Result<String> {
        self.enter("create")?;
        self.inner.create(op_id, spec).await
    }

    async fn clone_volume(
        &self,
        op_id: &str,
        snapshot_ref: &str,
        spec: &VolumeSpec,
    ) -> Result<String> {
        self.enter("clone_volume")?;
        self.inner.clone_volume(op_id, snapshot_ref, spec).await
    }

    async fn delete(&self, op_id: &str, driver_ref: &str) -> Result<()> {
        self.enter("delete")?;
        self.inner.delete(op_id, driver_ref).await
    }

    async fn snapshot(&self, op_id: &str, driver_ref: &str) -> Result<String> {
        self.enter("snapshot")?;
        self.inner.snapshot(op_id, driver_ref).await
    }

    async fn delete_snapshot(&self, op_id: &str, snapshot_ref: &str) -> Result<()> {
        self.enter("delete_snapshot")?;
        self.inner.delete_snapshot(op_id, snapshot_ref).await
    }

    async fn extend(&self, op_id: &str, driver_ref: &str, new_size_bytes: u64) -> Result<()> {
        self.enter("extend")?;
        self.inner.extend(op_id, driver_ref, new_size_bytes).await
    }

    async fn attach(
        &self,
        op_id: &str,
        driver_ref: &str,
        connector: &Connector,
    ) -> Result<ConnectionInfo> {
        self.enter("attach")?;
        self.inner.attach(op_id, driver_ref, connector).await
    }

    async fn detach(&self, op_id: &str, driver_ref: &str, attachment_id: &str) -> Result<()> {
        self.enter("detach")?;
        self.inner.detach(op_id, driver_ref, attachment_id).await
    }

    async fn health_check(&self) -> Result<bool> {
        self.enter("health_check")?;
        self.inner.health_check().await
    }
}
