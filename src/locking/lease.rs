//! Lease Locks
//!
//! One record per resource, kept in the state store under `locks/` and only
//! ever changed by compare-and-swap. Every worker sharing the store sees the
//! same holder, lease and token sequence, so a lease that expired on one
//! worker can be taken over by any other.
//!
//! A record is removed only through `retire`, for resources whose volume
//! never came to exist; otherwise the fencing token keeps increasing across
//! release, expiry and re-acquisition.

use crate::domain::clock::{ClockRef, SystemClock};
use crate::domain::ports::{StateStoreRef, WriteOp};
use crate::error::{Error, Result};
use crate::store::{keys, list_json, load_json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the locking service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lease used when the caller does not pass one
    #[serde(with = "crate::registry::duration_secs")]
    pub default_lease: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_lease: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Lock Handle
// =============================================================================

/// Proof of holding a resource
///
/// Not `Clone`: callers borrow the handle they were given.
#[derive(Debug, PartialEq, Eq)]
pub struct LockHandle {
    resource: String,
    holder: String,
    token: u64,
    lease: Duration,
    expires_at: DateTime<Utc>,
}

impl LockHandle {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Fencing token, strictly increasing per resource
    pub fn fencing_token(&self) -> u64 {
        self.token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

/// Lock resource name for a volume
pub fn volume_resource(volume_id: &str) -> String {
    format!("volume/{}", volume_id)
}

// =============================================================================
// Lock Record
// =============================================================================

/// Persisted state of one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder: String,
    pub token: u64,
    pub expires_at: DateTime<Utc>,
    pub released: bool,
}

impl LockRecord {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.released && self.expires_at > now
    }
}

#[derive(Debug, Default)]
struct LockCounters {
    acquired: AtomicU64,
    busy: AtomicU64,
    takeovers: AtomicU64,
    released: AtomicU64,
    retired: AtomicU64,
    fencing_rejections: AtomicU64,
}

/// Snapshot of this worker's lock statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockStats {
    pub acquired: u64,
    pub busy: u64,
    pub takeovers: u64,
    pub released: u64,
    pub retired: u64,
    pub fencing_rejections: u64,
}

// =============================================================================
// Lock Service
// =============================================================================

/// Lease-based lock table in the state store
pub struct LockService {
    config: LockConfig,
    store: StateStoreRef,
    clock: ClockRef,
    counters: LockCounters,
}

fn lease_delta(lease: Duration) -> chrono::Duration {
    chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(1))
}

impl LockService {
    /// Create a new lock service on the wall clock
    pub fn new(config: LockConfig, store: StateStoreRef) -> Arc<Self> {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    /// Create a new lock service on the given clock
    pub fn with_clock(config: LockConfig, store: StateStoreRef, clock: ClockRef) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            clock,
            counters: LockCounters::default(),
        })
    }

    /// Default lease duration
    pub fn default_lease(&self) -> Duration {
        self.config.default_lease
    }

    async fn load(&self, resource: &str) -> Result<Option<(LockRecord, u64)>> {
        load_json::<LockRecord>(self.store.as_ref(), &keys::lock(resource)).await
    }

    fn busy(&self, resource: &str, holder: String) -> Error {
        self.counters.busy.fetch_add(1, Ordering::Relaxed);
        Error::Busy {
            resource: resource.to_string(),
            holder,
        }
    }

    /// Try to acquire `resource` for `holder`
    ///
    /// Fails fast with `Busy` while any live lease exists, including one held
    /// by the same holder id: locks are not re-entrant. Losing the write race
    /// to another worker is also `Busy`.
    pub async fn acquire(
        &self,
        resource: &str,
        holder: &str,
        lease: Option<Duration>,
    ) -> Result<LockHandle> {
        let lease = lease.unwrap_or(self.config.default_lease);
        let now = self.clock.now();
        let expires_at = now + lease_delta(lease);

        let (token, expected, takeover) = match self.load(resource).await? {
            Some((record, _)) if record.is_live(now) => {
                debug!(resource, holder, current = %record.holder, "Lock busy");
                return Err(self.busy(resource, record.holder));
            }
            Some((record, version)) => (record.token + 1, version, !record.released),
            None => (1, 0, false),
        };

        let record = LockRecord {
            holder: holder.to_string(),
            token,
            expires_at,
            released: false,
        };
        let write = WriteOp::put_json(keys::lock(resource), &record, Some(expected))?;
        match self.store.commit(vec![write]).await {
            Ok(_) => {}
            Err(Error::Conflict { .. }) => {
                let current = self
                    .holder(resource)
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| "unknown".to_string());
                debug!(resource, holder, %current, "Lost lock race");
                return Err(self.busy(resource, current));
            }
            Err(e) => return Err(e),
        }

        if takeover {
            self.counters.takeovers.fetch_add(1, Ordering::Relaxed);
            info!(resource, holder, token, "Took over expired lease");
        }
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        debug!(resource, holder, token, "Lock acquired");

        Ok(LockHandle {
            resource: resource.to_string(),
            holder: holder.to_string(),
            token,
            lease,
            expires_at,
        })
    }

    fn reject(&self, handle: &LockHandle, current: u64) -> Error {
        self.counters.fencing_rejections.fetch_add(1, Ordering::Relaxed);
        Error::FencingTokenRejected {
            resource: handle.resource.clone(),
            presented: handle.token,
            current,
        }
    }

    /// Current record of a still-held handle
    async fn current(&self, handle: &LockHandle) -> Result<(LockRecord, u64)> {
        let now = self.clock.now();
        match self.load(&handle.resource).await? {
            Some((record, version)) if record.token == handle.token && record.is_live(now) => {
                Ok((record, version))
            }
            Some((record, _)) => Err(self.reject(handle, record.token)),
            None => Err(self.reject(handle, 0)),
        }
    }

    /// Extend the lease of a still-current handle
    pub async fn renew(&self, handle: &mut LockHandle) -> Result<()> {
        let (record, version) = self.current(handle).await?;
        let expires_at = self.clock.now() + lease_delta(handle.lease);
        let next = LockRecord {
            expires_at,
            ..record
        };

        let write = WriteOp::put_json(keys::lock(&handle.resource), &next, Some(version))?;
        match self.store.commit(vec![write]).await {
            Ok(_) => {
                handle.expires_at = expires_at;
                Ok(())
            }
            Err(Error::Conflict { .. }) => {
                let current = self.current_token(&handle.resource).await?;
                Err(self.reject(handle, current))
            }
            Err(e) => Err(e),
        }
    }

    /// Release a handle
    ///
    /// Releasing a handle that was already pre-empted is a no-op and leaves
    /// the new holder untouched.
    pub async fn release(&self, handle: &LockHandle) -> Result<()> {
        let (record, version) = match self.load(&handle.resource).await? {
            Some(found) => found,
            None => return Ok(()),
        };
        if record.token != handle.token {
            warn!(
                resource = %handle.resource,
                presented = handle.token,
                current = record.token,
                "Ignoring release of pre-empted lock"
            );
            return Ok(());
        }

        let next = LockRecord {
            released: true,
            ..record
        };
        let write = WriteOp::put_json(keys::lock(&handle.resource), &next, Some(version))?;
        match self.store.commit(vec![write]).await {
            Ok(_) => {
                self.counters.released.fetch_add(1, Ordering::Relaxed);
                debug!(resource = %handle.resource, token = handle.token, "Lock released");
                Ok(())
            }
            Err(Error::Conflict { .. }) => {
                warn!(resource = %handle.resource, token = handle.token, "Lock changed during release");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Release a handle and drop the resource's record
    ///
    /// Only for resources nothing was ever fenced with, since the token
    /// sequence starts over afterwards.
    pub async fn retire(&self, handle: &LockHandle) -> Result<()> {
        let version = match self.load(&handle.resource).await? {
            Some((record, version)) if record.token == handle.token => version,
            _ => return Ok(()),
        };

        match self
            .store
            .commit(vec![WriteOp::delete(keys::lock(&handle.resource), Some(version))])
            .await
        {
            Ok(_) => {
                self.counters.retired.fetch_add(1, Ordering::Relaxed);
                debug!(resource = %handle.resource, "Lock record retired");
                Ok(())
            }
            Err(Error::Conflict { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Check that `handle` still holds its resource
    pub async fn validate(&self, handle: &LockHandle) -> Result<()> {
        self.current(handle).await.map(|_| ())
    }

    /// Highest token ever issued for `resource`
    pub async fn current_token(&self, resource: &str) -> Result<u64> {
        Ok(self.load(resource).await?.map(|(r, _)| r.token).unwrap_or(0))
    }

    /// Holder of a live lease on `resource`
    pub async fn holder(&self, resource: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        Ok(self
            .load(resource)
            .await?
            .map(|(r, _)| r)
            .filter(|r| r.is_live(now))
            .map(|r| r.holder))
    }

    /// Number of live leases across all workers
    pub async fn live_count(&self) -> Result<u64> {
        let now = self.clock.now();
        Ok(list_json::<LockRecord>(self.store.as_ref(), keys::LOCKS)
            .await?
            .into_iter()
            .filter(|(record, _)| record.is_live(now))
            .count() as u64)
    }

    /// Get lock statistics
    pub fn stats(&self) -> LockStats {
        LockStats {
            acquired: self.counters.acquired.load(Ordering::Relaxed),
            busy: self.counters.busy.load(Ordering::Relaxed),
            takeovers: self.counters.takeovers.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            retired: self.counters.retired.load(Ordering::Relaxed),
            fencing_rejections: self.counters.fencing_rejections.load(Ordering::Relaxed),
        }
    }
}
