//! Executes one work item against the updater or the backflow calculator.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::backflow::{BackflowError, BackflowStatusCalculator};
use crate::codeflow::CodeFlowError;
use crate::git::GitError;
use crate::updater::{PullRequestUpdater, UpdaterError, UpdaterServices};

use super::item::WorkItem;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Updater(#[from] UpdaterError),

    #[error(transparent)]
    Backflow(#[from] BackflowError),
}

impl ProcessError {
    /// Whether running the same item again may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ProcessError::Updater(UpdaterError::Remote(e)) => e.is_retriable(),
            ProcessError::Updater(UpdaterError::CodeFlow(CodeFlowError::Remote(e))) => e.is_retriable(),
            ProcessError::Updater(UpdaterError::Git(GitError::Io(_))) => true,
            ProcessError::Updater(UpdaterError::CodeFlow(CodeFlowError::Git(GitError::Io(_)))) => true,
            ProcessError::Backflow(BackflowError::Remote(e)) => e.is_retriable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProcessError>;

pub struct WorkItemProcessor {
    services: Arc<UpdaterServices>,
    backflow: BackflowStatusCalculator,
}

impl WorkItemProcessor {
    pub fn new(services: Arc<UpdaterServices>, backflow: BackflowStatusCalculator) -> Self {
        WorkItemProcessor { services, backflow }
    }

    /// Runs `item`. Returns the item's own success flag; `false` means it
    /// referred to something that no longer exists.
    #[instrument(skip(self, item, cancel), fields(kind = item.kind()))]
    pub async fn process(&self, item: &WorkItem, cancel: &CancellationToken) -> Result<bool> {
        let done = match item {
            WorkItem::SubscriptionTrigger(trigger) => {
                self.updater(&trigger.updater_id, cancel)
                    .update_assets(
                        trigger.subscription_id,
                        trigger.subscription_type,
                        trigger.build_id,
                        false,
                        trigger.force,
                    )
                    .await?
            }
            WorkItem::PendingUpdate(update) => {
                self.updater(&update.updater_id, cancel)
                    .process_pending_updates(update.clone(), true, false)
                    .await?
            }
            WorkItem::PullRequestCheck(check) => {
                self.updater(&check.updater_id, cancel).check_pull_request(check).await?
            }
            WorkItem::BackflowStatusCalculation { vmr_build_id } => self.backflow.calculate(*vmr_build_id).await?,
        };
        info!(done, "Work item processed");
        Ok(done)
    }

    fn updater(&self, id: &crate::types::UpdaterId, cancel: &CancellationToken) -> PullRequestUpdater {
        PullRequestUpdater::new(id.clone(), Arc::clone(&self.services), cancel.child_token())
    }
}
