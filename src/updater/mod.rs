//! The pull request updater: one state machine per [`UpdaterId`].
//!
//! Nothing is kept in memory between calls. Every entry point loads the
//! updater's state from the store, acts, and writes it back. The dispatcher
//! guarantees at most one call per updater is in flight.
//!
//! States:
//!
//! ```text
//! NoPullRequest --build--> PullRequestOpen --merged/closed--> NoPullRequest
//!       |                      |     ^
//!       |                 conflict   | flow succeeds
//!       v                      v     |
//!  PendingUpdate          PullRequestOpen+Conflict
//! ```
//!
//! - [`status`]: PR status evaluation, merge policies and merging.
//! - [`dependency`]: dependency-only PRs.
//! - [`codeflow`]: source-enabled (code flow) PRs.

pub mod codeflow;
pub mod dependency;
pub mod status;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::codeflow::{CodeFlowError, CodeFlower};
use crate::git::{Git, GitError};
use crate::policy::{MergePolicyEvaluator, MergePolicyRegistry, PolicyFailureNotifier};
use crate::remote::{AssetRegistry, Remote, RemoteError, RemoteFactory};
use crate::resolver::{CoherencyUpdateResolver, ResolverError};
use crate::store::{KeyValueStore, ReminderManager, StateCache, StoreError};
use crate::types::{
    Build, BuildId, CodeFlowStatus, InProgressPullRequest, MergePolicyDefinition,
    MergePolicyEvaluationResults, PullRequestCheck, SubscriptionId, SubscriptionPullRequestUpdate,
    SubscriptionType, SubscriptionUpdateWorkItem, UpdaterId,
};

pub use status::{MergePolicyCheckResult, PullRequestStatus};

#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Resolver(#[from] ResolverError),

    #[error(transparent)]
    CodeFlow(#[from] CodeFlowError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error("subscription {0} not found")]
    SubscriptionNotFound(SubscriptionId),

    #[error("invalid asset exclusion pattern: {0}")]
    InvalidExclusion(#[from] regex::Error),
}

pub type Result<T> = std::result::Result<T, UpdaterError>;

/// Reminder timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdaterConfig {
    /// Delay for pending-update reminders and for checks right after an update.
    pub default_reminder_delay: Duration,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        UpdaterConfig {
            default_reminder_delay: Duration::minutes(5),
        }
    }
}

impl UpdaterConfig {
    /// How long to wait before re-checking a PR last updated at `updated_at`.
    /// Quiet PRs are checked less and less often.
    pub fn check_delay(&self, updated_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        let days = (now - updated_at).num_days();
        match days {
            d if d >= 30 => Duration::hours(12),
            d if d >= 21 => Duration::hours(1),
            d if d >= 14 => Duration::minutes(30),
            d if d >= 2 => Duration::minutes(15),
            _ => self.default_reminder_delay,
        }
    }
}

/// Collaborators shared by every updater.
pub struct UpdaterServices {
    pub store: Arc<dyn KeyValueStore>,
    pub remotes: Arc<dyn RemoteFactory>,
    pub registry: Arc<dyn AssetRegistry>,
    pub evaluator: MergePolicyEvaluator,
    pub notifier: PolicyFailureNotifier,
    pub coherency: CoherencyUpdateResolver,
    pub flower: Arc<dyn CodeFlower>,
    pub git: Arc<dyn Git>,
    pub config: UpdaterConfig,
}

impl UpdaterServices {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        remotes: Arc<dyn RemoteFactory>,
        registry: Arc<dyn AssetRegistry>,
        flower: Arc<dyn CodeFlower>,
        git: Arc<dyn Git>,
        config: UpdaterConfig,
    ) -> Self {
        UpdaterServices {
            evaluator: MergePolicyEvaluator::new(MergePolicyRegistry::with_builtins()),
            notifier: PolicyFailureNotifier::new(Arc::clone(&registry)),
            coherency: CoherencyUpdateResolver::new(Arc::clone(&remotes)),
            store,
            remotes,
            registry,
            flower,
            git,
            config,
        }
    }
}

/// Where an updater's PRs go and which policies guard them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdaterTarget {
    pub repository: String,
    pub branch: String,
    pub merge_policies: Vec<MergePolicyDefinition>,
}

pub struct PullRequestUpdater {
    id: UpdaterId,
    services: Arc<UpdaterServices>,
    pr_state: StateCache<InProgressPullRequest>,
    code_flow_state: StateCache<CodeFlowStatus>,
    policy_results: StateCache<MergePolicyEvaluationResults>,
    update_reminders: ReminderManager<SubscriptionUpdateWorkItem>,
    check_reminders: ReminderManager<PullRequestCheck>,
    cancel: CancellationToken,
}

impl PullRequestUpdater {
    pub fn new(id: UpdaterId, services: Arc<UpdaterServices>, cancel: CancellationToken) -> Self {
        let entity = id.to_string();
        let store = &services.store;
        PullRequestUpdater {
            pr_state: StateCache::new(Arc::clone(store), &entity),
            code_flow_state: StateCache::new(Arc::clone(store), &entity),
            policy_results: StateCache::new(Arc::clone(store), &entity),
            update_reminders: ReminderManager::new(Arc::clone(store), &entity),
            check_reminders: ReminderManager::new(Arc::clone(store), &entity),
            id,
            services,
            cancel,
        }
    }

    pub fn id(&self) -> &UpdaterId {
        &self.id
    }

    pub async fn pull_request_state(&self) -> Result<Option<InProgressPullRequest>> {
        Ok(self.pr_state.get().await?)
    }

    /// Entry point for a new build of a subscription.
    ///
    /// Returns false if the build does not exist.
    #[instrument(skip(self), fields(updater = %self.id))]
    pub async fn update_assets(
        &self,
        subscription_id: SubscriptionId,
        subscription_type: SubscriptionType,
        build_id: BuildId,
        apply_newest_only: bool,
        force_update: bool,
    ) -> Result<bool> {
        let Some(build) = self.services.registry.get_build(build_id).await? else {
            warn!(build_id = %build_id, "Build not found");
            return Ok(false);
        };

        let update = SubscriptionUpdateWorkItem {
            updater_id: self.id.clone(),
            subscription_id,
            subscription_type,
            build_id,
            source_sha: build.commit.as_str().to_string(),
            source_repo: build.repository().to_string(),
            is_coherency_update: false,
        };
        self.process_update(update, apply_newest_only, force_update, build).await?;
        Ok(true)
    }

    /// Retry path for an update that could not be applied earlier.
    ///
    /// Returns false if the update's build no longer exists.
    #[instrument(skip(self, update), fields(updater = %self.id, subscription_id = %update.subscription_id, build_id = %update.build_id))]
    pub async fn process_pending_updates(
        &self,
        update: SubscriptionUpdateWorkItem,
        apply_newest_only: bool,
        force_update: bool,
    ) -> Result<bool> {
        let Some(build) = self.services.registry.get_build(update.build_id).await? else {
            warn!("Build of pending update not found; dropping it");
            self.update_reminders.unset(update.is_code_flow()).await?;
            return Ok(false);
        };
        self.process_update(update, apply_newest_only, force_update, build).await?;
        Ok(true)
    }

    /// Reminder path: re-evaluate the open PR. Returns false once there is
    /// nothing left to track.
    #[instrument(skip(self, check), fields(updater = %self.id, pr = %check.url))]
    pub async fn check_pull_request(&self, check: &PullRequestCheck) -> Result<bool> {
        let Some(pr) = self.pr_state.get().await? else {
            info!("No in-progress pull request for this check");
            self.clear_all_state(true, true).await?;
            self.clear_all_state(false, true).await?;
            return Ok(false);
        };

        let (status, _) = self.get_pull_request_status(pr, check.is_code_flow, false).await?;
        Ok(status != PullRequestStatus::Invalid)
    }

    async fn process_update(
        &self,
        update: SubscriptionUpdateWorkItem,
        apply_newest_only: bool,
        force_update: bool,
        build: Build,
    ) -> Result<()> {
        let is_code_flow = update.is_code_flow();
        let mut pr = self.pr_state.get().await?;
        let mut pr_info = None;

        if let Some(existing) = pr.take() {
            if apply_newest_only {
                if let Some(queued) = existing.next_builds_to_process.get(&update.subscription_id) {
                    if *queued != update.build_id {
                        info!(
                            build_id = %update.build_id,
                            queued = %queued,
                            "A newer build is already queued; skipping"
                        );
                        return Ok(());
                    }
                }
            }

            let (status, info) = self.get_pull_request_status(existing.clone(), is_code_flow, true).await?;
            match status {
                PullRequestStatus::Completed | PullRequestStatus::Invalid => {}
                PullRequestStatus::InProgressCanUpdate => {
                    pr = Some(self.pr_state.get().await?.unwrap_or(existing));
                    pr_info = info;
                }
                PullRequestStatus::InProgressCannotUpdate if force_update => {
                    info!(pr = %existing.url, "Forcing update of a PR that cannot be updated");
                    pr = Some(self.pr_state.get().await?.unwrap_or(existing));
                    pr_info = info;
                }
                PullRequestStatus::InProgressCannotUpdate => {
                    let current = self.pr_state.get().await?.unwrap_or(existing);
                    return self.schedule_update_for_later(current, &update, is_code_flow).await;
                }
            }
        }

        if is_code_flow {
            self.process_code_flow_update(&update, pr, pr_info, &build).await
        } else {
            self.process_dependency_update(&update, pr, pr_info, &build).await
        }
    }

    /// Resolves the target repository, branch and merge policies.
    pub async fn target(&self) -> Result<UpdaterTarget> {
        match &self.id {
            UpdaterId::Batched { repository, branch } => Ok(UpdaterTarget {
                merge_policies: self
                    .services
                    .registry
                    .get_repository_merge_policies(repository, branch)
                    .await?,
                repository: repository.clone(),
                branch: branch.clone(),
            }),
            UpdaterId::NonBatched { subscription_id } => {
                let subscription = self
                    .services
                    .registry
                    .get_subscription(*subscription_id)
                    .await?
                    .ok_or(UpdaterError::SubscriptionNotFound(*subscription_id))?;
                Ok(UpdaterTarget {
                    repository: subscription.target_repository,
                    branch: subscription.target_branch,
                    merge_policies: subscription.policy.merge_policies,
                })
            }
        }
    }

    fn remote_for(&self, repository: &str) -> Result<Arc<dyn Remote>> {
        Ok(self.services.remotes.remote_for(repository)?)
    }

    // ─── State helpers ────────────────────────────────────────────────────────

    /// Saves `pr` and schedules the next policy check after `delay`.
    async fn set_check_reminder(&self, pr: &mut InProgressPullRequest, is_code_flow: bool, delay: Duration) -> Result<()> {
        let check = PullRequestCheck {
            updater_id: self.id.clone(),
            url: pr.url.clone(),
            is_code_flow,
        };
        let now = Utc::now();
        pr.last_check = Some(now);
        pr.next_check = Some(now + delay);
        self.check_reminders.set(&check, delay, is_code_flow).await?;
        self.pr_state.set(pr).await?;
        Ok(())
    }

    async fn set_default_check_reminder(&self, pr: &mut InProgressPullRequest, is_code_flow: bool) -> Result<()> {
        self.set_check_reminder(pr, is_code_flow, self.services.config.default_reminder_delay)
            .await
    }

    async fn set_update_reminder(&self, update: &SubscriptionUpdateWorkItem, is_code_flow: bool) -> Result<()> {
        self.update_reminders
            .set(update, self.services.config.default_reminder_delay, is_code_flow)
            .await?;
        Ok(())
    }

    /// Parks `update` behind a PR that cannot take it right now.
    async fn schedule_update_for_later(
        &self,
        mut pr: InProgressPullRequest,
        update: &SubscriptionUpdateWorkItem,
        is_code_flow: bool,
    ) -> Result<()> {
        info!(pr = %pr.url, build_id = %update.build_id, "PR cannot be updated now; deferring update");
        self.set_update_reminder(update, is_code_flow).await?;
        self.check_reminders.unset(is_code_flow).await?;
        pr.next_builds_to_process.insert(update.subscription_id, update.build_id);
        self.pr_state.set(&pr).await?;
        Ok(())
    }

    /// Forgets the PR. The pending update survives unless `clear_pending_updates`.
    async fn clear_all_state(&self, is_code_flow: bool, clear_pending_updates: bool) -> Result<()> {
        self.pr_state.try_delete().await?;
        self.code_flow_state.try_delete().await?;
        self.policy_results.try_delete().await?;
        self.check_reminders.unset(is_code_flow).await?;
        if clear_pending_updates {
            self.update_reminders.unset(is_code_flow).await?;
        }
        Ok(())
    }

    /// Advances `LastAppliedBuildId` of every subscription in a merged PR.
    async fn update_subscriptions_for_merged_pr(&self, contained: &[SubscriptionPullRequestUpdate]) {
        for update in contained {
            if let Err(e) = crate::trigger::update_for_merged_pull_request(
                self.services.registry.as_ref(),
                update.subscription_id,
                update.build_id,
            )
            .await
            {
                warn!(subscription_id = %update.subscription_id, error = %e, "Failed to advance subscription for merged PR");
            }
        }
    }
}

fn new_branch_name(target_branch: &str) -> String {
    format!("darc-{target_branch}-{}", uuid::Uuid::new_v4())
}
