//! In-memory State Store
//!
//! Reference implementation of the persistence contract. Keeps a version per
//! key and validates every guard of a commit before applying any write, so a
//! commit is all-or-nothing.

use crate::domain::ports::{StateStore, Versioned, WriteKind, WriteOp};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the in-memory store
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Prefix for all stored keys
    pub key_prefix: String,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "orchestrator/".to_string(),
        }
    }
}

// =============================================================================
// Stored Entry
// =============================================================================

#[derive(Debug, Clone)]
struct StoredEntry {
    data: Vec<u8>,
    version: u64,
    updated_at: DateTime<Utc>,
}

// =============================================================================
// Memory Store
// =============================================================================

/// Versioned in-memory key-value store
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, StoredEntry>>,
    key_prefix: String,
    /// Successful commits
    commits: AtomicU64,
    /// Commits rejected by a version guard
    conflicts: AtomicU64,
    /// Is backend available
    available: AtomicBool,
}

impl MemoryStore {
    /// Create a new store with default config
    pub fn new() -> Self {
        Self::with_config(MemoryStoreConfig::default())
    }

    /// Create a new store with config
    pub fn with_config(config: MemoryStoreConfig) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            key_prefix: config.key_prefix,
            commits: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            available: AtomicBool::new(true),
        }
    }

    fn prefixed_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Set availability (for testing)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(Error::BackendUnavailable {
                backend: "state-store".to_string(),
            })
        }
    }

    /// Number of successful commits
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Number of commits rejected with `Conflict`
    pub fn conflict_count(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    /// Last write time of a key
    pub fn updated_at(&self, key: &str) -> Option<DateTime<Utc>> {
        self.entries
            .read()
            .get(&self.prefixed_key(key))
            .map(|e| e.updated_at)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        self.ensure_available()?;

        let entries = self.entries.read();
        Ok(entries.get(&self.prefixed_key(key)).map(|e| Versioned {
            value: e.data.clone(),
            version: e.version,
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        self.ensure_available()?;

        let full_prefix = self.prefixed_key(prefix);
        let strip = self.key_prefix.len();
        let entries = self.entries.read();

        Ok(entries
            .range(full_prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&full_prefix))
            .map(|(k, e)| {
                (
                    k[strip..].to_string(),
                    Versioned {
                        value: e.data.clone(),
                        version: e.version,
                    },
                )
            })
            .collect())
    }

    async fn commit(&self, ops: Vec<WriteOp>) -> Result<Vec<u64>> {
        self.ensure_available()?;

        let mut entries = self.entries.write();

        // Validate every guard before touching anything
        for op in &ops {
            if let Some(expected) = op.expected_version {
                let actual = entries
                    .get(&self.prefixed_key(&op.key))
                    .map(|e| e.version)
                    .unwrap_or(0);
                if actual != expected {
                    self.conflicts.fetch_add(1, Ordering::Relaxed);
                    return Err(Error::Conflict {
                        key: op.key.clone(),
                        expected,
                        actual,
                    });
                }
            }
        }

        let now = Utc::now();
        let mut versions = Vec::with_capacity(ops.len());

        for op in ops {
            let key = self.prefixed_key(&op.key);
            match op.kind {
                WriteKind::Put(data) => {
                    let version = entries.get(&key).map(|e| e.version).unwrap_or(0) + 1;
                    entries.insert(
                        key,
                        StoredEntry {
                            data,
                            version,
                            updated_at: now,
                        },
                    );
                    versions.push(version);
                }
                WriteKind::Delete => {
                    entries.remove(&key);
                    versions.push(0);
                }
            }
        }

        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(versions)
    }
}
