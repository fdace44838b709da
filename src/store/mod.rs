//! Durable key-value storage for updater state and reminders.
//!
//! All per-updater state lives here, so a process restart (or a second
//! process) picks up exactly where the last work item left off. Values are
//! JSON documents wrapped in a versioned [`StoredEntry`] envelope.
//!
//! Two backends implement [`KeyValueStore`]:
//! - [`FileStore`]: one file per key, written atomically with fsync.
//! - [`MemoryStore`]: in-process, for tests and single-process runs.
//!
//! On top of the raw store sit typed handles: [`StateCache`] for cached
//! entities and [`ReminderManager`] for "wake me up later" records.

pub mod cache;
pub mod file;
pub mod memory;
pub mod reminder;

use std::io;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use cache::{CacheEntry, StateCache};
pub use file::FileStore;
pub use memory::MemoryStore;
pub use reminder::{DueReminder, Reminder, ReminderManager, due_reminders};

/// Current envelope schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("schema version mismatch: expected {expected}, got {got}")]
    SchemaMismatch { expected: u32, got: u32 },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// The envelope every stored value is wrapped in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub schema_version: u32,
    pub written_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub value: serde_json::Value,
}

impl StoredEntry {
    pub fn new(value: serde_json::Value, ttl: Option<Duration>) -> Self {
        let written_at = Utc::now();
        StoredEntry {
            schema_version: SCHEMA_VERSION,
            written_at,
            expires_at: ttl.map(|ttl| written_at + ttl),
            value,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn check_schema(&self) -> Result<()> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(StoreError::SchemaMismatch {
                expected: SCHEMA_VERSION,
                got: self.schema_version,
            });
        }
        Ok(())
    }
}

/// A durable string-keyed JSON store.
///
/// Implementations must make each `set` atomic: a reader sees either the
/// previous value or the new one. Expired entries read as absent.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;

    async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<()>;

    /// Removes the key, returning the value it held (if live).
    async fn delete(&self, key: &str) -> Result<Option<serde_json::Value>>;

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}
