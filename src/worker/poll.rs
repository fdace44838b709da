//! Reminder polling.
//!
//! Reminders are durable records in the state store; nothing fires them on
//! its own. The poller scans the store on a fixed interval, removes every
//! reminder that has come due and hands the payload to the work queue.
//! Removal happens before dispatch, so a reminder fires at most once; an
//! item that fails is rescheduled by the updater setting a new reminder.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::{KeyValueStore, due_reminders};

use super::dispatch::WorkQueue;
use super::item::WorkItem;

/// Default interval between reminder scans.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

pub struct ReminderPoller {
    store: Arc<dyn KeyValueStore>,
    queue: Arc<dyn WorkQueue>,
    interval: Duration,
}

impl ReminderPoller {
    pub fn new(store: Arc<dyn KeyValueStore>, queue: Arc<dyn WorkQueue>, interval: Duration) -> Self {
        ReminderPoller { store, queue, interval }
    }

    /// Fires every reminder due at `now`. Returns how many work items were
    /// queued.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> usize {
        let due = match due_reminders(self.store.as_ref(), now).await {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "Failed to scan reminders");
                return 0;
            }
        };

        let mut queued = 0;
        for reminder in due {
            let key = reminder.key.clone();
            let Some(item) = WorkItem::from_reminder(reminder) else {
                continue;
            };
            match self.queue.enqueue(item).await {
                Ok(()) => {
                    debug!(key = %key, "Reminder fired");
                    queued += 1;
                }
                Err(e) => warn!(key = %key, error = %e, "Failed to queue reminder"),
            }
        }
        queued
    }

    /// Polls until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!(interval = ?self.interval, "Reminder poller started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let queued = self.poll_once(Utc::now()).await;
                    if queued > 0 {
                        info!(queued, "Dispatched due reminders");
                    }
                }
            }
        }
        info!("Reminder poller stopped");
    }
}
