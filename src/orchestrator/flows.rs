//! Volume flows
//!
//! | Operation | Steps |
//! |-----------|-------|
//! | create | `reserve_capacity`, `create_backend_volume`, `verify_backend_volume` |
//! | delete | `delete_snapshots`, `delete_backend_volume` |
//! | snapshot | `create_backend_snapshot` |
//! | extend | `reserve_capacity`, `extend_backend_volume` |
//! | attach | `export_volume` |
//! | detach | `unexport_volume` |
//!
//! A create carrying a `source_snapshot_ref` clones that snapshot in
//! `create_backend_volume`; the steps are the same either way.
//!
//! Driver calls use `FlowContext::op_id(step)` so a forward repeated after a
//! resume hits the driver's idempotence path.

use crate::domain::events::OperationKind;
use crate::domain::ports::{VolumeDriverRef, VolumeSpec};
use crate::drivers::DriverSet;
use crate::error::{Error, Result};
use crate::scheduler::Scheduler;
use crate::taskflow::{FlowBuilder, FlowContext, FlowDefinition, Step};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

fn driver_for(drivers: &DriverSet, ctx: &FlowContext) -> Result<VolumeDriverRef> {
    let backend_id = ctx.backend_id.as_ref().ok_or_else(|| {
        Error::Internal(format!("flow {} has no backend", ctx.flow_id))
    })?;
    drivers.get(backend_id)
}

fn driver_ref(ctx: &FlowContext) -> Result<&str> {
    ctx.driver_ref
        .as_deref()
        .ok_or_else(|| Error::Internal(format!("flow {} has no driver reference", ctx.flow_id)))
}

// =============================================================================
// Capacity
// =============================================================================

/// Holds the reservation taken at scheduling time
///
/// Forward only confirms the reservation is still in the ledger; undo
/// hands it back.
pub struct ReserveCapacity {
    scheduler: Arc<Scheduler>,
}

#[async_trait]
impl Step for ReserveCapacity {
    fn name(&self) -> &'static str {
        "reserve_capacity"
    }

    async fn forward(&self, ctx: FlowContext) -> Result<FlowContext> {
        let reservation = ctx.reservation.as_ref().ok_or_else(|| {
            Error::Internal(format!("flow {} carries no reservation", ctx.flow_id))
        })?;

        let ledger = self.scheduler.ledger(&reservation.backend_id).await?;
        if !ledger.reservations.contains_key(&reservation.id) {
            return Err(Error::StepFailed {
                step: self.name().to_string(),
                reason: format!("reservation {} is no longer held", reservation.id),
            });
        }
        Ok(ctx)
    }

    async fn compensate(&self, ctx: &FlowContext) -> Result<()> {
        if let Some(reservation) = &ctx.reservation {
            let released = self.scheduler.release(reservation).await?;
            debug!(reservation = %reservation.id, released, "Reservation handed back");
        }
        Ok(())
    }
}

// =============================================================================
// Volume
// =============================================================================

pub struct CreateBackendVolume {
    drivers: Arc<DriverSet>,
}

#[async_trait]
impl Step for CreateBackendVolume {
    fn name(&self) -> &'static str {
        "create_backend_volume"
    }

    async fn forward(&self, mut ctx: FlowContext) -> Result<FlowContext> {
        let driver = driver_for(&self.drivers, &ctx)?;
        let spec = VolumeSpec {
            volume_id: ctx.volume_id.clone(),
            name: ctx.name.clone(),
            size_bytes: ctx.size_bytes,
            requirements: ctx.requirements.clone(),
        };
        let op_id = ctx.op_id(self.name());
        let driver_ref = match ctx.source_snapshot_ref.as_deref() {
            Some(snapshot_ref) => driver.clone_volume(&op_id, snapshot_ref, &spec).await?,
            None => driver.create(&op_id, &spec).await?,
        };
        info!(
            volume_id = %ctx.volume_id,
            backend = %driver.backend_id(),
            %driver_ref,
            cloned = ctx.source_snapshot_ref.is_some(),
            "Backend volume created"
        );
        ctx.driver_ref = Some(driver_ref);
        Ok(ctx)
    }

    async fn compensate(&self, ctx: &FlowContext) -> Result<()> {
        let Some(driver_ref) = ctx.driver_ref.as_deref() else {
            return Ok(());
        };
        let driver = driver_for(&self.drivers, ctx)?;
        driver
            .delete(&ctx.op_id("undo_create_backend_volume"), driver_ref)
            .await?;
        info!(volume_id = %ctx.volume_id, %driver_ref, "Backend volume removed");
        Ok(())
    }
}

/// Confirms the backend is still answering after the create
pub struct VerifyBackendVolume {
    drivers: Arc<DriverSet>,
}

#[async_trait]
impl Step for VerifyBackendVolume {
    fn name(&self) -> &'static str {
        "verify_backend_volume"
    }

    async fn forward(&self, ctx: FlowContext) -> Result<FlowContext> {
        let driver = driver_for(&self.drivers, &ctx)?;
        if !driver.health_check().await? {
            return Err(Error::BackendUnavailable {
                backend: driver.backend_id().to_string(),
            });
        }
        Ok(ctx)
    }

    async fn compensate(&self, _ctx: &FlowContext) -> Result<()> {
        Ok(())
    }
}

pub struct DeleteSnapshots {
    drivers: Arc<DriverSet>,
}

#[async_trait]
impl Step for DeleteSnapshots {
    fn name(&self) -> &'static str {
        "delete_snapshots"
    }

    async fn forward(&self, ctx: FlowContext) -> Result<FlowContext> {
        if ctx.snapshot_refs.is_empty() {
            return Ok(ctx);
        }
        let driver = driver_for(&self.drivers, &ctx)?;
        for (index, snapshot_ref) in ctx.snapshot_refs.iter().enumerate() {
            let op_id = format!("{}:{}", ctx.op_id(self.name()), index);
            driver.delete_snapshot(&op_id, snapshot_ref).await?;
        }
        Ok(ctx)
    }

    async fn compensate(&self, ctx: &FlowContext) -> Result<()> {
        if !ctx.snapshot_refs.is_empty() {
            warn!(
                volume_id = %ctx.volume_id,
                snapshots = ctx.snapshot_refs.len(),
                "Deleted snapshots cannot be restored"
            );
        }
        Ok(())
    }
}

pub struct DeleteBackendVolume {
    drivers: Arc<DriverSet>,
}

#[async_trait]
impl Step for DeleteBackendVolume {
    fn name(&self) -> &'static str {
        "delete_backend_volume"
    }

    async fn forward(&self, ctx: FlowContext) -> Result<FlowContext> {
        // A volume whose create never reached the backend has nothing to remove
        let Some(driver_ref) = ctx.driver_ref.as_deref() else {
            return Ok(ctx);
        };
        let driver = driver_for(&self.drivers, &ctx)?;
        driver.delete(&ctx.op_id(self.name()), driver_ref).await?;
        info!(volume_id = %ctx.volume_id, %driver_ref, "Backend volume deleted");
        Ok(ctx)
    }

    async fn compensate(&self, _ctx: &FlowContext) -> Result<()> {
        Ok(())
    }
}

pub struct ExtendBackendVolume {
    drivers: Arc<DriverSet>,
}

#[async_trait]
impl Step for ExtendBackendVolume {
    fn name(&self) -> &'static str {
        "extend_backend_volume"
    }

    async fn forward(&self, ctx: FlowContext) -> Result<FlowContext> {
        let new_size = ctx.new_size_bytes.ok_or_else(|| {
            Error::Internal(format!("flow {} has no target size", ctx.flow_id))
        })?;
        let driver = driver_for(&self.drivers, &ctx)?;
        driver
            .extend(&ctx.op_id(self.name()), driver_ref(&ctx)?, new_size)
            .await?;
        info!(volume_id = %ctx.volume_id, new_size, "Backend volume extended");
        Ok(ctx)
    }

    // Volumes never shrink
    async fn compensate(&self, ctx: &FlowContext) -> Result<()> {
        warn!(volume_id = %ctx.volume_id, "Extend is not reverted on the backend");
        Ok(())
    }
}

// =============================================================================
// Snapshot
// =============================================================================

pub struct CreateBackendSnapshot {
    drivers: Arc<DriverSet>,
}

#[async_trait]
impl Step for CreateBackendSnapshot {
    fn name(&self) -> &'static str {
        "create_backend_snapshot"
    }

    async fn forward(&self, mut ctx: FlowContext) -> Result<FlowContext> {
        let driver = driver_for(&self.drivers, &ctx)?;
        let snapshot_ref = driver
            .snapshot(&ctx.op_id(self.name()), driver_ref(&ctx)?)
            .await?;
        info!(volume_id = %ctx.volume_id, %snapshot_ref, "Backend snapshot created");
        ctx.snapshot_ref = Some(snapshot_ref);
        Ok(ctx)
    }

    async fn compensate(&self, ctx: &FlowContext) -> Result<()> {
        let Some(snapshot_ref) = ctx.snapshot_ref.as_deref() else {
            return Ok(());
        };
        let driver = driver_for(&self.drivers, ctx)?;
        driver
            .delete_snapshot(&ctx.op_id("undo_create_backend_snapshot"), snapshot_ref)
            .await
    }
}

// =============================================================================
// Export
// =============================================================================

pub struct ExportVolume {
    drivers: Arc<DriverSet>,
}

#[async_trait]
impl Step for ExportVolume {
    fn name(&self) -> &'static str {
        "export_volume"
    }

    async fn forward(&self, mut ctx: FlowContext) -> Result<FlowContext> {
        let connector = ctx.connector.clone().ok_or_else(|| {
            Error::Internal(format!("flow {} has no connector", ctx.flow_id))
        })?;
        let driver = driver_for(&self.drivers, &ctx)?;
        let connection = driver
            .attach(&ctx.op_id(self.name()), driver_ref(&ctx)?, &connector)
            .await?;
        info!(
            volume_id = %ctx.volume_id,
            host = %connector.host,
            attachment_id = %connection.attachment_id,
            "Volume exported"
        );
        ctx.attachment_id = Some(connection.attachment_id.clone());
        ctx.connection = Some(connection);
        Ok(ctx)
    }

    async fn compensate(&self, ctx: &FlowContext) -> Result<()> {
        let Some(attachment_id) = ctx.attachment_id.as_deref() else {
            return Ok(());
        };
        let driver = driver_for(&self.drivers, ctx)?;
        driver
            .detach(&ctx.op_id("undo_export_volume"), driver_ref(ctx)?, attachment_id)
            .await
    }
}

pub struct UnexportVolume {
    drivers: Arc<DriverSet>,
}

#[async_trait]
impl Step for UnexportVolume {
    fn name(&self) -> &'static str {
        "unexport_volume"
    }

    async fn forward(&self, ctx: FlowContext) -> Result<FlowContext> {
        let attachment_id = ctx.attachment_id.as_deref().ok_or_else(|| {
            Error::Internal(format!("flow {} has no attachment", ctx.flow_id))
        })?;
        let driver = driver_for(&self.drivers, &ctx)?;
        driver
            .detach(&ctx.op_id(self.name()), driver_ref(&ctx)?, attachment_id)
            .await?;
        info!(volume_id = %ctx.volume_id, %attachment_id, "Volume unexported");
        Ok(ctx)
    }

    async fn compensate(&self, _ctx: &FlowContext) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Flow definitions for every volume operation
#[derive(Clone)]
pub struct VolumeFlows {
    drivers: Arc<DriverSet>,
    scheduler: Arc<Scheduler>,
}

impl VolumeFlows {
    pub fn new(drivers: Arc<DriverSet>, scheduler: Arc<Scheduler>) -> Self {
        Self { drivers, scheduler }
    }

    fn reserve(&self) -> Arc<ReserveCapacity> {
        Arc::new(ReserveCapacity {
            scheduler: self.scheduler.clone(),
        })
    }
}

impl FlowBuilder for VolumeFlows {
    fn build(&self, kind: OperationKind) -> FlowDefinition {
        let drivers = self.drivers.clone();
        let flow = FlowDefinition::new(kind);
        match kind {
            OperationKind::Create => flow
                .step(self.reserve())
                .step(Arc::new(CreateBackendVolume { drivers: drivers.clone() }))
                .step(Arc::new(VerifyBackendVolume { drivers })),
            OperationKind::Delete => flow
                .step(Arc::new(DeleteSnapshots { drivers: drivers.clone() }))
                .step(Arc::new(DeleteBackendVolume { drivers })),
            OperationKind::Snapshot => flow.step(Arc::new(CreateBackendSnapshot { drivers })),
            OperationKind::Extend => flow
                .step(self.reserve())
                .step(Arc::new(ExtendBackendVolume { drivers })),
            OperationKind::Attach => flow.step(Arc::new(ExportVolume { drivers })),
            OperationKind::Detach => flow.step(Arc::new(UnexportVolume { drivers })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{BackendKind, StateStoreRef};
    use crate::drivers::{BackendSpec, LvmDriver};
    use crate::registry::{CapabilityRegistry, RegistryConfig};
    use crate::scheduler::SchedulerConfig;
    use crate::store::MemoryStore;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn flows() -> (VolumeFlows, Arc<DriverSet>) {
        let drivers = DriverSet::new();
        drivers.register(
            Arc::new(LvmDriver::new(&BackendSpec::new("lvm-a", BackendKind::Lvm, 10 * GIB))),
            0,
        );
        let store: StateStoreRef = Arc::new(MemoryStore::new());
        let scheduler = Scheduler::new(
            SchedulerConfig::default(),
            CapabilityRegistry::new(RegistryConfig::default()),
            store,
        );
        (VolumeFlows::new(drivers.clone(), scheduler), drivers)
    }

    fn ctx(operation: OperationKind) -> FlowContext {
        let mut ctx = FlowContext::new("flow-1", "req-1", "vol-1", operation, 1);
        ctx.backend_id = Some("lvm-a".into());
        ctx.name = "db".into();
        ctx.size_bytes = GIB;
        ctx
    }

    #[test]
    fn test_flow_shapes() {
        let (flows, _) = flows();
        assert_eq!(
            flows.build(OperationKind::Create).step_names(),
            vec!["reserve_capacity", "create_backend_volume", "verify_backend_volume"]
        );
        assert_eq!(
            flows.build(OperationKind::Delete).step_names(),
            vec!["delete_snapshots", "delete_backend_volume"]
        );
        assert_eq!(flows.build(OperationKind::Attach).len(), 1);
    }

    #[tokio::test]
    async fn test_create_forward_is_idempotent() {
        let (_, drivers) = flows();
        let step = CreateBackendVolume { drivers };

        let first = step.forward(ctx(OperationKind::Create)).await.unwrap();
        let again = step.forward(ctx(OperationKind::Create)).await.unwrap();
        assert_eq!(first.driver_ref, again.driver_ref);
        assert_eq!(first.driver_ref.as_deref(), Some("cinder-volumes/volume-vol-1"));
    }

    #[tokio::test]
    async fn test_create_from_snapshot_clones() {
        let (_, drivers) = flows();
        let step = CreateBackendVolume { drivers: drivers.clone() };
        let source = step.forward(ctx(OperationKind::Create)).await.unwrap();

        let mut snapshot = ctx(OperationKind::Snapshot);
        snapshot.driver_ref = source.driver_ref;
        let snapshot = CreateBackendSnapshot { drivers }.forward(snapshot).await.unwrap();

        let mut clone = FlowContext::new("flow-2", "req-2", "vol-2", OperationKind::Create, 1);
        clone.backend_id = Some("lvm-a".into());
        clone.name = "db-copy".into();
        clone.size_bytes = GIB;
        clone.source_snapshot_ref = snapshot.snapshot_ref;

        let cloned = step.forward(clone).await.unwrap();
        assert_eq!(cloned.driver_ref.as_deref(), Some("cinder-volumes/volume-vol-2"));
    }

    #[tokio::test]
    async fn test_delete_without_backend_volume() {
        let (_, drivers) = flows();
        let step = DeleteBackendVolume { drivers };
        let mut context = ctx(OperationKind::Delete);
        context.backend_id = None;

        assert!(step.forward(context).await.is_ok());
    }

    #[tokio::test]
    async fn test_export_then_undo() {
        let (_, drivers) = flows();
        let created = CreateBackendVolume { drivers: drivers.clone() }
            .forward(ctx(OperationKind::Create))
            .await
            .unwrap();

        let mut attach = ctx(OperationKind::Attach);
        attach.driver_ref = created.driver_ref;
        attach.connector = Some(crate::domain::ports::Connector {
            host: "node-1".into(),
            initiator: None,
        });

        let step = ExportVolume { drivers };
        let exported = step.forward(attach).await.unwrap();
        assert_eq!(exported.connection.as_ref().unwrap().protocol, "iscsi");
        assert!(exported.attachment_id.is_some());
        step.compensate(&exported).await.unwrap();
    }
}
