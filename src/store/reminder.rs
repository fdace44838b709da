//! Durable reminders: "process this payload again at or after `due_at`".
//!
//! A reminder is a stored record keyed by payload type, entity and flow
//! (`Reminder_{TYPE}_{entity}` or `..._CodeFlow`). Setting a reminder for a
//! key that already has one replaces it, so there is never more than one
//! pending reminder per key. The reminder poller finds due records with
//! [`due_reminders`] and hands them to the dispatcher.

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{CacheEntry, KeyValueStore, Result};

pub const REMINDER_PREFIX: &str = "Reminder_";
const CODE_FLOW_SUFFIX: &str = "_CodeFlow";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reminder<T> {
    pub type_name: String,
    pub due_at: DateTime<Utc>,
    pub payload: T,
}

pub struct ReminderManager<T> {
    store: Arc<dyn KeyValueStore>,
    entity: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ReminderManager<T> {
    fn clone(&self) -> Self {
        ReminderManager {
            store: Arc::clone(&self.store),
            entity: self.entity.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: CacheEntry> ReminderManager<T> {
    pub fn new(store: Arc<dyn KeyValueStore>, entity: &str) -> Self {
        ReminderManager {
            store,
            entity: entity.to_string(),
            _marker: PhantomData,
        }
    }

    pub fn key(&self, is_code_flow: bool) -> String {
        let suffix = if is_code_flow { CODE_FLOW_SUFFIX } else { "" };
        format!("{REMINDER_PREFIX}{}_{}{suffix}", T::TYPE_NAME, self.entity)
    }

    /// Schedules `payload`, replacing any reminder already pending for the key.
    pub async fn set(&self, payload: &T, due_in: Duration, is_code_flow: bool) -> Result<()> {
        let reminder = Reminder {
            type_name: T::TYPE_NAME.to_string(),
            due_at: Utc::now() + due_in,
            payload,
        };
        let key = self.key(is_code_flow);
        debug!(key = %key, due_at = %reminder.due_at, "Setting reminder");
        self.store
            .set(&key, serde_json::to_value(&reminder)?, None)
            .await
    }

    pub async fn unset(&self, is_code_flow: bool) -> Result<()> {
        let key = self.key(is_code_flow);
        if self.store.delete(&key).await?.is_some() {
            debug!(key = %key, "Removed reminder");
        }
        Ok(())
    }

    pub async fn get(&self, is_code_flow: bool) -> Result<Option<Reminder<T>>> {
        match self.store.get(&self.key(is_code_flow)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}

/// A reminder that has come due, with its payload still untyped.
#[derive(Debug, Clone, PartialEq)]
pub struct DueReminder {
    pub key: String,
    pub type_name: String,
    pub due_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Removes and returns every reminder due at or before `now`.
///
/// A reminder that is replaced between the scan and the removal is only
/// returned if the replacement is itself due.
pub async fn due_reminders(store: &dyn KeyValueStore, now: DateTime<Utc>) -> Result<Vec<DueReminder>> {
    let mut due = Vec::new();
    for key in store.keys_with_prefix(REMINDER_PREFIX).await? {
        let Some(value) = store.get(&key).await? else {
            continue;
        };
        let reminder: Reminder<serde_json::Value> = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => {
                warn!(key = %key, error = %e, "Dropping malformed reminder");
                store.delete(&key).await?;
                continue;
            }
        };
        if reminder.due_at > now {
            continue;
        }
        let Some(removed) = store.delete(&key).await? else {
            continue;
        };
        let removed: Reminder<serde_json::Value> = serde_json::from_value(removed)?;
        if removed.due_at > now {
            // Replaced by a later reminder in the meantime; put it back.
            store.set(&key, serde_json::to_value(&removed)?, None).await?;
            continue;
        }
        due.push(DueReminder {
            key,
            type_name: removed.type_name,
            due_at: removed.due_at,
            payload: removed.payload,
        });
    }
    Ok(due)
}
