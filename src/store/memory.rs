use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::Mutex;

use super::{KeyValueStore, Result, StoredEntry};

/// In-process store. State is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, StoredEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        let now = Utc::now();
        self.entries
            .lock()
            .await
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|e| !e.is_expired(Utc::now()))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), StoredEntry::new(value, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let removed = self.entries.lock().await.remove(key);
        Ok(removed
            .filter(|e| !e.is_expired(Utc::now()))
            .map(|e| e.value))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .await
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
