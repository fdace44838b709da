//! Work items: the units the dispatcher routes and the processor executes.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store::{CacheEntry, DueReminder};
use crate::types::{BuildId, PullRequestCheck, SubscriptionId, SubscriptionType, SubscriptionUpdateWorkItem, UpdaterId};

/// A new build to apply for a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionTrigger {
    pub updater_id: UpdaterId,
    pub subscription_id: SubscriptionId,
    pub subscription_type: SubscriptionType,
    pub build_id: BuildId,
    /// Apply even if the open PR is not updatable.
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkItem {
    SubscriptionTrigger(SubscriptionTrigger),
    /// A reminder-fired retry of an update that could not be applied.
    PendingUpdate(SubscriptionUpdateWorkItem),
    /// A reminder-fired re-evaluation of an open PR.
    PullRequestCheck(PullRequestCheck),
    BackflowStatusCalculation { vmr_build_id: BuildId },
}

impl WorkItem {
    /// The updater that must execute this item, or `None` for items that
    /// are not tied to one.
    pub fn updater_id(&self) -> Option<&UpdaterId> {
        match self {
            WorkItem::SubscriptionTrigger(t) => Some(&t.updater_id),
            WorkItem::PendingUpdate(u) => Some(&u.updater_id),
            WorkItem::PullRequestCheck(c) => Some(&c.updater_id),
            WorkItem::BackflowStatusCalculation { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkItem::SubscriptionTrigger(_) => "subscription_trigger",
            WorkItem::PendingUpdate(_) => "pending_update",
            WorkItem::PullRequestCheck(_) => "pull_request_check",
            WorkItem::BackflowStatusCalculation { .. } => "backflow_status_calculation",
        }
    }

    /// Turns a fired reminder back into the work item it was set for.
    pub fn from_reminder(reminder: DueReminder) -> Option<WorkItem> {
        let type_name = reminder.type_name.as_str();
        let parsed = if type_name == <SubscriptionUpdateWorkItem as CacheEntry>::TYPE_NAME {
            serde_json::from_value(reminder.payload).map(WorkItem::PendingUpdate)
        } else if type_name == <PullRequestCheck as CacheEntry>::TYPE_NAME {
            serde_json::from_value(reminder.payload).map(WorkItem::PullRequestCheck)
        } else {
            warn!(key = %reminder.key, type_name, "Reminder of unknown type");
            return None;
        };
        match parsed {
            Ok(item) => Some(item),
            Err(e) => {
                warn!(key = %reminder.key, error = %e, "Malformed reminder payload");
                None
            }
        }
    }
}
