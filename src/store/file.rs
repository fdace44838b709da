//! File-backed store: one JSON file per key.
//!
//! Keys are hex-encoded into file names so that arbitrary key text (URLs,
//! branch names with `/`) maps to a single flat directory entry.
//!
//! # Atomic Writes
//!
//! 1. Write to `<name>.json.tmp`
//! 2. fsync the file
//! 3. Rename to `<name>.json`
//! 4. fsync the directory
//!
//! Readers always see either the old or the new entry, never a partial write.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::warn;

use super::{KeyValueStore, Result, StoreError, StoredEntry};

const EXTENSION: &str = "json";

#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Opens (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(FileStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{EXTENSION}", hex::encode(key.as_bytes())))
    }

    async fn blocking<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(FileStore) -> Result<R> + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || f(this))
            .await
            .map_err(|e| StoreError::Io(io::Error::other(e)))?
    }

    fn read_entry(path: &Path) -> Result<Option<StoredEntry>> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let entry: StoredEntry = serde_json::from_slice(&bytes)?;
        entry.check_schema()?;
        Ok(Some(entry))
    }

    fn write_entry_atomic(path: &Path, entry: &StoredEntry) -> Result<()> {
        let tmp_path = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(entry)?;

        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(&bytes)?;
            fsync_file(&file)?;
        }

        std::fs::rename(&tmp_path, path)?;

        if let Some(parent) = path.parent() {
            fsync_dir(parent)?;
        }
        Ok(())
    }

    fn remove(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        if let Some(parent) = path.parent() {
            fsync_dir(parent)?;
        }
        Ok(())
    }

    fn decode_key(file_name: &str) -> Option<String> {
        let stem = file_name.strip_suffix(".json")?;
        let bytes = hex::decode(stem).ok()?;
        String::from_utf8(bytes).ok()
    }
}

fn fsync_file(file: &File) -> io::Result<()> {
    file.sync_all()
}

/// Renames and unlinks are only durable once the directory entry is synced.
fn fsync_dir(dir_path: &Path) -> io::Result<()> {
    let dir = OpenOptions::new().read(true).open(dir_path)?;
    dir.sync_all()
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let path = self.path_for(key);
        self.blocking(move |_| {
            Ok(Self::read_entry(&path)?
                .filter(|entry| !entry.is_expired(Utc::now()))
                .map(|entry| entry.value))
        })
        .await
    }

    async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<()> {
        let path = self.path_for(key);
        let entry = StoredEntry::new(value, ttl);
        self.blocking(move |_| Self::write_entry_atomic(&path, &entry))
            .await
    }

    async fn delete(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let path = self.path_for(key);
        self.blocking(move |_| {
            let previous = match Self::read_entry(&path) {
                Ok(entry) => entry,
                Err(StoreError::Io(e)) => return Err(e.into()),
                // Unreadable entries are still removed.
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Removing unreadable store entry");
                    None
                }
            };
            Self::remove(&path)?;
            Ok(previous
                .filter(|entry| !entry.is_expired(Utc::now()))
                .map(|entry| entry.value))
        })
        .await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.to_string();
        self.blocking(move |this| {
            let mut keys = Vec::new();
            for dir_entry in std::fs::read_dir(&this.dir)? {
                let dir_entry = dir_entry?;
                let name = dir_entry.file_name();
                let Some(key) = name.to_str().and_then(Self::decode_key) else {
                    continue;
                };
                if key.starts_with(&prefix) {
                    keys.push(key);
                }
            }
            keys.sort();
            Ok(keys)
        })
        .await
    }
}
