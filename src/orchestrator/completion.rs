//! Terminal writes of volume flows
//!
//! Resolves the volume, settles the capacity ledger and records snapshots in
//! the same commit as the flow's terminal status.

use crate::domain::clock::ClockRef;
use crate::domain::events::OperationKind;
use crate::domain::ports::{StateStoreRef, WriteOp};
use crate::error::Result;
use crate::scheduler::Scheduler;
use crate::store::{keys, list_json};
use crate::taskflow::{FlowCompletion, FlowContext, FlowStatus};
use crate::volume::{Attachment, Resolution, Snapshot, SnapshotStatus, VolumeStateMachine, VolumeUpdate};
use async_trait::async_trait;
use std::sync::Arc;

pub(crate) struct VolumeCompletion {
    pub machine: Arc<VolumeStateMachine>,
    pub scheduler: Arc<Scheduler>,
    pub store: StateStoreRef,
    pub clock: ClockRef,
    /// Token of the lock the finishing worker holds
    pub fence: u64,
}

impl VolumeCompletion {
    fn update(&self, ctx: &FlowContext) -> VolumeUpdate {
        match ctx.operation {
            OperationKind::Create => VolumeUpdate {
                backend_id: ctx.backend_id.clone(),
                driver_ref: ctx.driver_ref.clone(),
                ..Default::default()
            },
            OperationKind::Extend => VolumeUpdate {
                size_bytes: ctx.new_size_bytes,
                ..Default::default()
            },
            OperationKind::Attach => VolumeUpdate {
                add_attachment: ctx.attachment_id.clone().map(|attachment_id| Attachment {
                    attachment_id,
                    host: ctx
                        .connector
                        .as_ref()
                        .map(|c| c.host.clone())
                        .unwrap_or_default(),
                    attached_at: self.clock.now(),
                }),
                ..Default::default()
            },
            OperationKind::Detach => VolumeUpdate {
                remove_attachment: ctx.attachment_id.clone(),
                ..Default::default()
            },
            OperationKind::Delete | OperationKind::Snapshot => VolumeUpdate::default(),
        }
    }

    /// Delete every snapshot record of the volume
    async fn drop_snapshot_records(&self, volume_id: &str) -> Result<Vec<WriteOp>> {
        Ok(list_json::<Snapshot>(self.store.as_ref(), keys::SNAPSHOTS)
            .await?
            .into_iter()
            .filter(|(snapshot, _)| snapshot.volume_id == volume_id)
            .map(|(snapshot, version)| WriteOp::delete(keys::snapshot(&snapshot.id), Some(version)))
            .collect())
    }

    fn snapshot_record(&self, ctx: &FlowContext, size_bytes: u64, success: bool) -> Result<Option<WriteOp>> {
        let (Some(snapshot_id), Some(backend_id)) = (&ctx.snapshot_id, &ctx.backend_id) else {
            return Ok(None);
        };
        let snapshot = Snapshot {
            id: snapshot_id.clone(),
            volume_id: ctx.volume_id.clone(),
            name: ctx.name.clone(),
            backend_id: backend_id.clone(),
            snapshot_ref: if success { ctx.snapshot_ref.clone() } else { None },
            size_bytes,
            status: if success {
                SnapshotStatus::Available
            } else {
                SnapshotStatus::Error
            },
            created_at: self.clock.now(),
        };
        Ok(Some(WriteOp::put_json(keys::snapshot(&snapshot.id), &snapshot, Some(0))?))
    }
}

#[async_trait]
impl FlowCompletion for VolumeCompletion {
    async fn writes(&self, ctx: &FlowContext, status: FlowStatus) -> Result<Vec<WriteOp>> {
        let success = match status {
            FlowStatus::Success => true,
            FlowStatus::Compensated | FlowStatus::CompensationFailed => false,
            // Cancelled flows never touched the volume
            _ => return Ok(Vec::new()),
        };

        let volume = self.machine.get(&ctx.volume_id).await?;
        let resolution = if success {
            Resolution::Success(self.update(ctx))
        } else {
            Resolution::Failure
        };
        let (_, resolved) = self
            .machine
            .resolve_op(&volume, ctx.operation, &resolution, self.fence)?;
        let mut ops = vec![resolved];

        match ctx.operation {
            OperationKind::Create | OperationKind::Extend if success => {
                if let Some(reservation) = &ctx.reservation {
                    if let Some(op) = self
                        .scheduler
                        .commit_op(&reservation.backend_id, &reservation.id)
                        .await?
                    {
                        ops.push(op);
                    }
                }
            }
            OperationKind::Delete if success => {
                if let Some(backend_id) = &volume.backend_id {
                    ops.push(self.scheduler.free_op(backend_id, volume.size_bytes).await?);
                }
                ops.extend(self.drop_snapshot_records(&volume.id).await?);
            }
            OperationKind::Snapshot => {
                if let Some(op) = self.snapshot_record(ctx, volume.size_bytes, success)? {
                    ops.push(op);
                }
            }
            _ => {}
        }

        Ok(ops)
    }
}
