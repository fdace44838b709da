//! Dependency-only pull requests: create, update, and work out what to bump.

use tracing::{info, instrument, warn};

use super::{PullRequestUpdater, Result, UpdaterError, new_branch_name};
use crate::description::dependency::{COHERENCY_FAILURE_MESSAGE, coherency_failure_description};
use crate::description::{BuildSection, commit_message, dependency_description, dependency_title};
use crate::remote::Remote;
use crate::resolver::{AssetMatcher, ResolverError, get_required_non_coherency_updates};
use crate::types::{
    Build, CodeFlowDirection, CoherencyErrorDetails, DependencyDetail, DependencyUpdate,
    DependencyUpdateSummary, InProgressPullRequest, PullRequestContent, PullRequestInfo, Subscription,
    SubscriptionPullRequestUpdate, SubscriptionUpdateWorkItem,
};

/// What one build requires of the target repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredUpdates {
    pub subscription: Subscription,
    /// Direct bumps to the build's assets.
    pub updates: Vec<DependencyUpdate>,
    pub coherency_updates: Vec<DependencyUpdate>,
    pub coherency_check_successful: bool,
    pub coherency_errors: Vec<CoherencyErrorDetails>,
}

impl RequiredUpdates {
    pub fn is_empty(&self) -> bool {
        self.coherency_check_successful && self.updates.is_empty() && self.coherency_updates.is_empty()
    }

    fn summaries(&self) -> Vec<DependencyUpdateSummary> {
        self.updates
            .iter()
            .chain(&self.coherency_updates)
            .map(DependencyUpdateSummary::from)
            .collect()
    }

    fn all_targets(&self) -> Vec<DependencyDetail> {
        self.updates
            .iter()
            .chain(&self.coherency_updates)
            .map(|u| u.to.clone())
            .collect()
    }
}

impl PullRequestUpdater {
    pub(super) async fn process_dependency_update(
        &self,
        update: &SubscriptionUpdateWorkItem,
        pr: Option<InProgressPullRequest>,
        pr_info: Option<PullRequestInfo>,
        build: &Build,
    ) -> Result<()> {
        match (pr, pr_info) {
            (Some(pr), Some(pr_info)) => {
                self.update_pull_request(update, pr, pr_info, build).await?;
            }
            _ => match self.create_pull_request(update, build).await? {
                Some(url) => info!(pr = %url, subscription_id = %update.subscription_id, "Pull request created"),
                None => info!(subscription_id = %update.subscription_id, "No changes required; no pull request created"),
            },
        }
        self.update_reminders.unset(false).await?;
        Ok(())
    }

    /// Opens a PR for `update`. Returns `None` when nothing needs to change.
    #[instrument(skip(self, update, build), fields(updater = %self.id, build_id = %build.id))]
    async fn create_pull_request(&self, update: &SubscriptionUpdateWorkItem, build: &Build) -> Result<Option<String>> {
        let target = self.target().await?;
        let remote = self.remote_for(&target.repository)?;

        let required = self
            .get_required_updates(update, build, &target.repository, None, &target.branch)
            .await?;
        if required.is_empty() {
            return Ok(None);
        }

        let head_branch = new_branch_name(&target.branch);
        remote
            .create_new_branch(&target.repository, &target.branch, &head_branch)
            .await?;

        let created = self
            .open_dependency_pull_request(update, build, remote.as_ref(), &target.repository, &target.branch, &head_branch, &required)
            .await;
        match created {
            Ok(url) => Ok(Some(url)),
            Err(e) => {
                if let Err(delete_error) = remote.delete_branch(&target.repository, &head_branch).await {
                    warn!(branch = %head_branch, error = %delete_error, "Failed to delete branch after failed PR creation");
                }
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn open_dependency_pull_request(
        &self,
        update: &SubscriptionUpdateWorkItem,
        build: &Build,
        remote: &dyn Remote,
        repository: &str,
        target_branch: &str,
        head_branch: &str,
        required: &RequiredUpdates,
    ) -> Result<String> {
        let mut pr_state;
        if !required.coherency_check_successful && required.updates.is_empty() {
            remote
                .commit_updates(repository, head_branch, &[], COHERENCY_FAILURE_MESSAGE)
                .await?;
            let content = PullRequestContent {
                title: dependency_title(target_branch, &[]),
                description: coherency_failure_description(head_branch),
                head_branch: head_branch.to_string(),
                base_branch: target_branch.to_string(),
            };
            let url = remote.create_pull_request(repository, &content).await?;
            pr_state = InProgressPullRequest::new(self.id.clone(), url, head_branch);
        } else {
            let description = self
                .commit_and_describe(remote, repository, head_branch, None, update, build, required, &required.updates)
                .await?;
            let content = PullRequestContent {
                title: dependency_title(target_branch, &[update.source_repo.as_str()]),
                description,
                head_branch: head_branch.to_string(),
                base_branch: target_branch.to_string(),
            };
            let url = remote.create_pull_request(repository, &content).await?;
            pr_state = InProgressPullRequest::new(self.id.clone(), url, head_branch);
            pr_state.contained_subscriptions = vec![contained(update)];
            pr_state.required_updates = required.summaries();
        }

        pr_state.source_sha = Some(update.source_sha.clone());
        pr_state.coherency_check_successful = required.coherency_check_successful;
        pr_state.coherency_errors = required.coherency_errors.clone();
        pr_state.code_flow_direction = CodeFlowDirection::None;
        self.set_default_check_reminder(&mut pr_state, false).await?;
        Ok(pr_state.url)
    }

    #[instrument(skip(self, update, pr, pr_info, build), fields(updater = %self.id, pr = %pr.url))]
    async fn update_pull_request(
        &self,
        update: &SubscriptionUpdateWorkItem,
        mut pr: InProgressPullRequest,
        mut pr_info: PullRequestInfo,
        build: &Build,
    ) -> Result<()> {
        let target = self.target().await?;
        let remote = self.remote_for(&target.repository)?;
        info!(branch = %target.branch, repository = %target.repository, "Updating pull request");

        let required = self
            .get_required_updates(update, build, &target.repository, Some(&pr_info.head_branch), &target.branch)
            .await?;
        if required.is_empty() {
            info!("No updates found for pull request");
            return Ok(());
        }

        pr.required_updates = merge_required_updates(&pr.required_updates, &required.summaries());
        if pr.required_updates.is_empty() {
            info!("No new updates found for pull request");
            return Ok(());
        }

        pr.coherency_check_successful = required.coherency_check_successful;
        pr.coherency_errors = required.coherency_errors.clone();

        // Replacing the entry keeps LastAppliedBuildId from moving backwards on merge.
        pr.contained_subscriptions
            .retain(|s| s.subscription_id != update.subscription_id);
        pr.contained_subscriptions.push(contained(update));

        let described = self
            .original_dependencies(remote.as_ref(), &target.repository, &target.branch, &required.updates)
            .await?;
        pr_info.description = self
            .commit_and_describe(
                remote.as_ref(),
                &target.repository,
                &pr_info.head_branch,
                Some(&pr_info.description),
                update,
                build,
                &required,
                &described,
            )
            .await?;
        let sources: Vec<&str> = pr
            .contained_subscriptions
            .iter()
            .map(|s| s.source_repo.as_str())
            .collect();
        pr_info.title = dependency_title(&target.branch, &sources);

        remote
            .update_pull_request(&pr.url, &pr_info.title, &pr_info.description)
            .await?;
        pr.last_update = chrono::Utc::now();
        pr.next_builds_to_process.remove(&update.subscription_id);
        self.set_default_check_reminder(&mut pr, false).await?;

        info!("Pull request updated");
        Ok(())
    }

    /// Commits the updates to `head_branch` and returns the new description.
    ///
    /// `described` is what the subscription's section lists; on updates it
    /// is relative to the target branch rather than the PR branch.
    #[allow(clippy::too_many_arguments)]
    async fn commit_and_describe(
        &self,
        remote: &dyn Remote,
        repository: &str,
        head_branch: &str,
        current_description: Option<&str>,
        update: &SubscriptionUpdateWorkItem,
        build: &Build,
        required: &RequiredUpdates,
        described: &[DependencyUpdate],
    ) -> Result<String> {
        let message = commit_message(
            &update.source_repo,
            &build.build_number(),
            &required.updates,
            &required.coherency_updates,
        );
        remote
            .commit_updates(repository, head_branch, &required.all_targets(), &message)
            .await?;

        let section = BuildSection {
            subscription_id: update.subscription_id,
            subscription_channel: Some(required.subscription.channel_id),
            source_repo: &update.source_repo,
            build,
            updates: described,
        };
        Ok(dependency_description(
            current_description,
            Some(section),
            &required.coherency_updates,
            &required.coherency_errors,
        ))
    }

    /// Rewrites each update's `from` side to what the target branch holds.
    async fn original_dependencies(
        &self,
        remote: &dyn Remote,
        repository: &str,
        target_branch: &str,
        updates: &[DependencyUpdate],
    ) -> Result<Vec<DependencyUpdate>> {
        let on_target = remote.get_dependencies(repository, target_branch, None).await?;
        Ok(updates
            .iter()
            .map(|u| {
                let from = on_target
                    .iter()
                    .find(|d| d.name.eq_ignore_ascii_case(&u.to.name))
                    .cloned()
                    .unwrap_or_else(|| u.from.clone());
                DependencyUpdate { from, to: u.to.clone() }
            })
            .collect())
    }

    /// Resolves the bumps `build` requires of `pr_branch` (or the target
    /// branch when there is no PR yet).
    ///
    /// When no asset matches, the subscription's last applied build is
    /// advanced right away.
    pub async fn get_required_updates(
        &self,
        update: &SubscriptionUpdateWorkItem,
        build: &Build,
        repository: &str,
        pr_branch: Option<&str>,
        target_branch: &str,
    ) -> Result<RequiredUpdates> {
        info!(branch = %target_branch, repository = %repository, "Getting required updates");
        let subscription = self
            .services
            .registry
            .get_subscription(update.subscription_id)
            .await?
            .ok_or(UpdaterError::SubscriptionNotFound(update.subscription_id))?;

        let matcher = AssetMatcher::new(&subscription.excluded_assets)?;
        let assets = matcher.filter(&build.assets);

        let remote = self.remote_for(repository)?;
        let mut dependencies = remote
            .get_dependencies(repository, pr_branch.unwrap_or(target_branch), None)
            .await?;

        let updates = get_required_non_coherency_updates(&update.source_repo, &update.source_sha, &assets, &dependencies);
        if updates.is_empty() {
            self.update_subscriptions_for_merged_pr(&[contained(update)]).await;
        } else {
            for u in &updates {
                if let Some(slot) = dependencies.iter_mut().find(|d| **d == u.from) {
                    *slot = u.to.clone();
                }
            }
        }

        let (coherency_updates, coherency_check_successful, coherency_errors) =
            match self.services.coherency.get_required_coherency_updates(&dependencies).await {
                Ok(coherency_updates) => (coherency_updates, true, Vec::new()),
                Err(ResolverError::Coherency(errors)) => {
                    warn!(errors = errors.len(), "Failed to update coherent dependencies");
                    (Vec::new(), false, errors)
                }
                Err(e) => return Err(e.into()),
            };

        Ok(RequiredUpdates {
            subscription,
            updates,
            coherency_updates,
            coherency_check_successful,
            coherency_errors,
        })
    }
}

fn contained(update: &SubscriptionUpdateWorkItem) -> SubscriptionPullRequestUpdate {
    SubscriptionPullRequestUpdate {
        subscription_id: update.subscription_id,
        build_id: update.build_id,
        source_repo: update.source_repo.clone(),
        commit_sha: update.source_sha.clone(),
    }
}

/// Merges incoming bumps into the ones a PR already carries.
///
/// A dependency seen before keeps its original `from` side and takes the new
/// `to` side. New dependencies are appended.
pub fn merge_required_updates(
    existing: &[DependencyUpdateSummary],
    incoming: &[DependencyUpdateSummary],
) -> Vec<DependencyUpdateSummary> {
    let mut merged = existing.to_vec();
    for update in incoming {
        match merged
            .iter_mut()
            .find(|e| e.dependency_name == update.dependency_name)
        {
            Some(e) => {
                e.to_version = update.to_version.clone();
                e.to_commit_sha = update.to_commit_sha.clone();
            }
            None => merged.push(update.clone()),
        }
    }
    merged
}
