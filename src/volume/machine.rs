//! Volume State Machine
//!
//! Every change to a volume record goes through here. A transition is
//! accepted only when:
//! - the caller's expected version matches the stored one (`Conflict`)
//! - the caller's fencing token is not lower than the last one written
//!   (`FencingTokenRejected`)
//! - the operation is legal from the current state (`InvalidTransition`)
//!
//! Each accepted transition bumps the version by exactly one. The `*_op`
//! variants return the write without committing it so it can be bundled
//! into a larger atomic commit.

use super::model::{Attachment, Volume, VolumeState};
use crate::domain::clock::{ClockRef, SystemClock};
use crate::domain::events::OperationKind;
use crate::domain::ports::{BackendId, StateStoreRef, WriteOp};
use crate::error::{Error, Result};
use crate::locking::volume_resource;
use crate::store::{keys, list_json, load_json};
use std::sync::Arc;
use tracing::debug;

// =============================================================================
// Transition Inputs
// =============================================================================

/// Record changes carried by a successful operation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VolumeUpdate {
    pub backend_id: Option<BackendId>,
    pub driver_ref: Option<String>,
    pub size_bytes: Option<u64>,
    pub add_attachment: Option<Attachment>,
    pub remove_attachment: Option<String>,
}

/// How the operation that began a transition ended
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Success(VolumeUpdate),
    Failure,
}

// =============================================================================
// Transition Table
// =============================================================================

fn invalid(volume: &Volume, operation: OperationKind) -> Error {
    Error::InvalidTransition {
        volume_id: volume.id.clone(),
        from: volume.state.to_string(),
        operation: operation.to_string(),
    }
}

/// State entered when `operation` begins on `volume`
pub fn begin_state(volume: &Volume, operation: OperationKind) -> Result<VolumeState> {
    use VolumeState::*;

    let next = match (operation, volume.state) {
        (OperationKind::Create, ErrorCreating) => Creating,
        (OperationKind::Delete, Available | ErrorCreating | ErrorDeleting | ErrorExtending) => {
            Deleting
        }
        (OperationKind::Extend, Available | ErrorExtending) => Extending,
        (OperationKind::Attach, Available) => Attaching,
        (OperationKind::Attach, InUse) if volume.is_multiattach() => Attaching,
        (OperationKind::Detach, InUse) => Detaching,
        (OperationKind::Snapshot, state @ (Available | InUse)) => state,
        _ => return Err(invalid(volume, operation)),
    };
    Ok(next)
}

/// State entered when `operation` ends on `volume`
///
/// `remaining_attachments` is the attachment count after the update is
/// applied; it decides where a successful detach lands.
pub fn resolve_state(
    volume: &Volume,
    operation: OperationKind,
    success: bool,
    remaining_attachments: usize,
) -> Result<VolumeState> {
    use VolumeState::*;

    let next = match (operation, volume.state, success) {
        (OperationKind::Create, Creating, true) => Available,
        (OperationKind::Create, Creating, false) => ErrorCreating,
        (OperationKind::Delete, Deleting, true) => Deleted,
        (OperationKind::Delete, Deleting, false) => ErrorDeleting,
        (OperationKind::Extend, Extending, true) => Available,
        (OperationKind::Extend, Extending, false) => ErrorExtending,
        (OperationKind::Attach, Attaching, true) => InUse,
        (OperationKind::Attach, Attaching, false) => volume.previous_state.unwrap_or(Available),
        (OperationKind::Detach, Detaching, true) if remaining_attachments > 0 => InUse,
        (OperationKind::Detach, Detaching, true) => Available,
        (OperationKind::Detach, Detaching, false) => InUse,
        (OperationKind::Snapshot, state @ (Available | InUse), _) => state,
        _ => return Err(invalid(volume, operation)),
    };
    Ok(next)
}

// =============================================================================
// State Machine
// =============================================================================

/// Guarded writer of volume records
pub struct VolumeStateMachine {
    store: StateStoreRef,
    clock: ClockRef,
}

impl VolumeStateMachine {
    pub fn new(store: StateStoreRef) -> Arc<Self> {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: StateStoreRef, clock: ClockRef) -> Arc<Self> {
        Arc::new(Self { store, clock })
    }

    /// Load a volume
    pub async fn get(&self, volume_id: &str) -> Result<Volume> {
        match load_json::<Volume>(self.store.as_ref(), &keys::volume(volume_id)).await? {
            Some((mut volume, version)) => {
                volume.version = version;
                Ok(volume)
            }
            None => Err(Error::VolumeNotFound {
                volume_id: volume_id.to_string(),
            }),
        }
    }

    /// All volume records, tombstones included, ordered by id
    pub async fn list(&self) -> Result<Vec<Volume>> {
        Ok(list_json::<Volume>(self.store.as_ref(), keys::VOLUMES)
            .await?
            .into_iter()
            .map(|(mut volume, version)| {
                volume.version = version;
                volume
            })
            .collect())
    }

    fn check_fence(&self, volume: &Volume, fence: u64) -> Result<()> {
        if fence < volume.last_fence {
            return Err(Error::FencingTokenRejected {
                resource: volume_resource(&volume.id),
                presented: fence,
                current: volume.last_fence,
            });
        }
        Ok(())
    }

    fn check_version(&self, volume: &Volume, expected_version: u64) -> Result<()> {
        if volume.version != expected_version {
            return Err(Error::Conflict {
                key: keys::volume(&volume.id),
                expected: expected_version,
                actual: volume.version,
            });
        }
        Ok(())
    }

    fn write(&self, current_version: u64, mut next: Volume, fence: u64) -> Result<(Volume, WriteOp)> {
        next.version = current_version + 1;
        next.last_fence = fence;
        next.updated_at = self.clock.now();
        let op = WriteOp::put_json(keys::volume(&next.id), &next, Some(current_version))?;
        Ok((next, op))
    }

    /// Write for a brand-new record in `Creating`
    pub fn create_op(&self, volume: Volume, fence: u64) -> Result<(Volume, WriteOp)> {
        let mut next = volume;
        next.state = VolumeState::Creating;
        next.previous_state = None;
        self.write(0, next, fence)
    }

    /// Persist a brand-new record in `Creating`
    ///
    /// Fails with `Conflict` if a record with the same id exists.
    pub async fn create(&self, volume: Volume, fence: u64) -> Result<Volume> {
        let (next, op) = self.create_op(volume, fence)?;
        self.store.commit(vec![op]).await?;
        debug!(volume_id = %next.id, "Volume record created");
        Ok(next)
    }

    /// Write that enters the in-progress state of `operation`
    pub fn begin_op(
        &self,
        current: &Volume,
        operation: OperationKind,
        fence: u64,
    ) -> Result<(Volume, WriteOp)> {
        self.check_fence(current, fence)?;
        let state = begin_state(current, operation)?;

        let mut next = current.clone();
        next.previous_state = Some(current.state);
        next.state = state;
        self.write(current.version, next, fence)
    }

    /// Enter the in-progress state of `operation`
    pub async fn begin(
        &self,
        volume_id: &str,
        operation: OperationKind,
        expected_version: u64,
        fence: u64,
    ) -> Result<Volume> {
        let current = self.get(volume_id).await?;
        self.check_version(&current, expected_version)?;

        let (next, op) = self.begin_op(&current, operation, fence)?;
        self.store.commit(vec![op]).await?;

        debug!(
            volume_id,
            %operation,
            from = %current.state,
            to = %next.state,
            version = next.version,
            "Volume transition begun"
        );
        Ok(next)
    }

    /// Write that applies the outcome of `operation`
    pub fn resolve_op(
        &self,
        current: &Volume,
        operation: OperationKind,
        resolution: &Resolution,
        fence: u64,
    ) -> Result<(Volume, WriteOp)> {
        self.check_fence(current, fence)?;

        let mut next = current.clone();
        let success = match resolution {
            Resolution::Success(update) => {
                if let Some(backend_id) = &update.backend_id {
                    next.backend_id = Some(backend_id.clone());
                }
                if let Some(driver_ref) = &update.driver_ref {
                    next.driver_ref = Some(driver_ref.clone());
                }
                if let Some(size) = update.size_bytes {
                    next.size_bytes = size;
                }
                if let Some(attachment) = &update.add_attachment {
                    next.attachments
                        .retain(|a| a.attachment_id != attachment.attachment_id);
                    next.attachments.push(attachment.clone());
                }
                if let Some(attachment_id) = &update.remove_attachment {
                    next.attachments.retain(|a| &a.attachment_id != attachment_id);
                }
                true
            }
            Resolution::Failure => false,
        };

        next.state = resolve_state(current, operation, success, next.attachments.len())?;
        next.previous_state = None;
        self.write(current.version, next, fence)
    }

    /// Apply the outcome of `operation`
    pub async fn resolve(
        &self,
        volume_id: &str,
        operation: OperationKind,
        resolution: &Resolution,
        expected_version: u64,
        fence: u64,
    ) -> Result<Volume> {
        let current = self.get(volume_id).await?;
        self.check_version(&current, expected_version)?;

        let (next, op) = self.resolve_op(&current, operation, resolution, fence)?;
        self.store.commit(vec![op]).await?;

        debug!(
            volume_id,
            %operation,
            from = %current.state,
            to = %next.state,
            version = next.version,
            "Volume transition resolved"
        );
        Ok(next)
    }
}
