//! State Store
//!
//! Durable key-value storage for volumes, flow records, capacity ledgers,
//! snapshots and lock leases. All mutation goes through versioned
//! compare-and-swap writes; multi-key updates commit atomically.

mod memory;

pub use memory::{MemoryStore, MemoryStoreConfig};

use crate::domain::ports::StateStore;
use crate::error::Result;
use serde::de::DeserializeOwned;

/// Key layout
pub mod keys {
    pub const VOLUMES: &str = "volumes/";
    pub const FLOWS: &str = "flows/";
    pub const CAPACITY: &str = "capacity/";
    pub const SNAPSHOTS: &str = "snapshots/";
    pub const LOCKS: &str = "locks/";

    pub fn volume(volume_id: &str) -> String {
        format!("{}{}", VOLUMES, volume_id)
    }

    pub fn flow(flow_id: &str) -> String {
        format!("{}{}", FLOWS, flow_id)
    }

    pub fn capacity(backend_id: &str) -> String {
        format!("{}{}", CAPACITY, backend_id)
    }

    pub fn snapshot(snapshot_id: &str) -> String {
        format!("{}{}", SNAPSHOTS, snapshot_id)
    }

    pub fn lock(resource: &str) -> String {
        format!("{}{}", LOCKS, resource)
    }
}

/// Read a JSON value and its version
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<(T, u64)>> {
    match store.get(key).await? {
        Some(versioned) => {
            let value = serde_json::from_slice(&versioned.value)?;
            Ok(Some((value, versioned.version)))
        }
        None => Ok(None),
    }
}

/// Read every JSON value under a prefix
pub async fn list_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    prefix: &str,
) -> Result<Vec<(T, u64)>> {
    let mut out = Vec::new();
    for (_, versioned) in store.list(prefix).await? {
        out.push((serde_json::from_slice(&versioned.value)?, versioned.version));
    }
    Ok(out)
}
