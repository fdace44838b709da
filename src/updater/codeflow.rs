//! Code flow pull requests: flow, push, then create or update the PR.
//!
//! Nothing is persisted about a flow until its branch has been pushed, except
//! the [`CodeFlowStatus`] that remembers which branch a PR-less flow uses.

use std::path::Path;

use chrono::Utc;
use tracing::{error, info, instrument, warn};

use super::dependency::merge_required_updates;
use super::{PullRequestUpdater, Result, new_branch_name};
use crate::codeflow::{CodeFlowError, CodeFlowResult, ConflictError, upstream_repo_diffs};
use crate::description::{
    CodeFlowSection, OVERWRITTEN_COMMIT_MESSAGE, UpstreamRepoDiff, code_flow_description, code_flow_title,
    conflict_comment, merge_conflict_comment, overwritten_commits_comment,
};
use crate::remote::Remote;
use crate::types::{
    Build, CodeFlowDirection, CodeFlowStatus, DependencyUpdateSummary, InProgressPullRequest, MergeState,
    PullRequestContent, PullRequestInfo, Subscription, SubscriptionPullRequestUpdate, SubscriptionUpdateWorkItem,
};

impl PullRequestUpdater {
    #[instrument(skip_all, fields(updater = %self.id, subscription_id = %update.subscription_id, build_id = %build.id))]
    pub(super) async fn process_code_flow_update(
        &self,
        update: &SubscriptionUpdateWorkItem,
        pr: Option<InProgressPullRequest>,
        pr_info: Option<PullRequestInfo>,
        build: &Build,
    ) -> Result<()> {
        if let Some(mut pr) = pr.clone() {
            if pr.source_sha.as_deref() == Some(update.source_sha.as_str()) {
                info!(pr = %pr.url, sha = %update.source_sha, "PR is already up to date");
                self.set_default_check_reminder(&mut pr, true).await?;
                self.update_reminders.unset(true).await?;
                return Ok(());
            }
            if pr.blocked_from_future_updates {
                info!(pr = %pr.url, build_id = %update.build_id, "PR is blocked from further updates");
                self.set_default_check_reminder(&mut pr, true).await?;
                self.update_reminders.unset(true).await?;
                return Ok(());
            }
        }

        let Some(subscription) = self.services.registry.get_subscription(update.subscription_id).await? else {
            warn!("Subscription not found; stopping updates");
            self.clear_all_state(true, true).await?;
            return Ok(());
        };
        let remote = self.remote_for(&subscription.target_repository)?;

        let status = self.code_flow_state.get().await?;
        let head_branch = match (&pr, &status) {
            (Some(pr), _) => pr.head_branch.clone(),
            (None, Some(status)) => status.head_branch.clone(),
            (None, None) => new_branch_name(&subscription.target_branch),
        };
        let is_new_branch = pr.is_none() && status.is_none();
        if pr.is_none() {
            self.code_flow_state
                .set(&CodeFlowStatus {
                    head_branch: head_branch.clone(),
                    source_sha: update.source_sha.clone(),
                    updated_at: Utc::now(),
                })
                .await?;
        }

        let Some(result) = self
            .execute_code_flow(update, &subscription, build, &head_branch, is_new_branch, pr.clone(), pr_info.as_ref(), remote.as_ref())
            .await?
        else {
            return Ok(());
        };

        let (previous_source_sha, diffs) = self.previous_flow(&subscription, build, remote.as_ref()).await?;
        let dependency_updates: Vec<DependencyUpdateSummary> =
            result.dependency_updates.iter().map(DependencyUpdateSummary::from).collect();

        let pr_url = match (pr, pr_info) {
            (Some(pr), Some(pr_info)) => {
                let url = pr.url.clone();
                self.update_code_flow_pull_request(
                    update,
                    pr,
                    pr_info,
                    &subscription,
                    build,
                    previous_source_sha.as_deref(),
                    &dependency_updates,
                    &diffs,
                    remote.as_ref(),
                )
                .await?;
                Some(url)
            }
            _ if result.had_updates => Some(
                self.create_code_flow_pull_request(
                    update,
                    &subscription,
                    build,
                    &head_branch,
                    previous_source_sha.as_deref(),
                    dependency_updates,
                    &diffs,
                    remote.as_ref(),
                )
                .await?,
            ),
            _ => {
                info!("Flow produced no changes; no pull request needed");
                self.code_flow_state.try_delete().await?;
                self.update_reminders.unset(true).await?;
                None
            }
        };

        if let Some(url) = pr_url {
            if !result.conflicted_files.is_empty() {
                let comment = merge_conflict_comment(&subscription, &result.conflicted_files);
                if let Err(e) = remote.comment_pull_request(&url, &comment).await {
                    warn!(pr = %url, error = %e, "Failed to post merge conflict comment");
                }
            }
        }
        Ok(())
    }

    /// Runs the flower and pushes its branch. `None` means the flow was
    /// handled without a PR change (conflict, blocked, missing branch).
    #[allow(clippy::too_many_arguments)]
    async fn execute_code_flow(
        &self,
        update: &SubscriptionUpdateWorkItem,
        subscription: &Subscription,
        build: &Build,
        head_branch: &str,
        is_new_branch: bool,
        pr: Option<InProgressPullRequest>,
        pr_info: Option<&PullRequestInfo>,
        remote: &dyn Remote,
    ) -> Result<Option<CodeFlowResult>> {
        let forward = subscription.is_forward_flow();
        info!(
            direction = if forward { "forward" } else { "back" },
            source = %subscription.source_repository,
            target = %subscription.target_repository,
            target_branch = %subscription.target_branch,
            branch = %head_branch,
            "Flowing build"
        );

        let flower = &self.services.flower;
        let flowed = if forward {
            flower
                .flow_forward(subscription, build, head_branch, is_new_branch, &self.cancel)
                .await
        } else {
            flower
                .flow_back(subscription, build, head_branch, is_new_branch, &self.cancel)
                .await
        };

        let result = match flowed {
            Ok(result) => result,
            Err(CodeFlowError::Conflict(conflict)) => {
                match (pr, pr_info) {
                    (Some(pr), Some(pr_info)) => {
                        self.handle_pr_update_conflict(update, subscription, pr, pr_info, &conflict, remote)
                            .await?
                    }
                    _ => warn!(branch = %head_branch, files = conflict.conflicted_files.len(), "Conflict flowing into a new branch"),
                }
                return Ok(None);
            }
            Err(CodeFlowError::ManualCommitsInFlow { commits }) => {
                match pr {
                    Some(pr) => self.handle_manual_commits(update, pr, &commits, remote).await?,
                    None => warn!(commits = commits.len(), "Flow would overwrite manual commits on a branch without PR"),
                }
                return Ok(None);
            }
            Err(CodeFlowError::TargetBranchNotFound { repository, branch }) => {
                warn!(repository = %repository, branch = %branch, "Target branch not found");
                return Ok(None);
            }
            Err(e) => {
                error!(error = %e, "Failed to flow source changes");
                return Err(e.into());
            }
        };

        if !result.had_updates {
            info!("No code flow updates");
            return Ok(Some(result));
        }

        let local: &Path = if forward {
            flower.vmr_path()
        } else {
            &result.repo_path
        };
        self.services
            .git
            .push(local, head_branch, &subscription.target_repository)
            .await?;
        info!(branch = %head_branch, "Pushed code flow branch");
        Ok(Some(result))
    }

    /// The source commit of the last flow and, for backflow, how every other
    /// repository moved in the VMR since then.
    async fn previous_flow(
        &self,
        subscription: &Subscription,
        build: &Build,
        remote: &dyn Remote,
    ) -> Result<(Option<String>, Vec<UpstreamRepoDiff>)> {
        if subscription.is_forward_flow() {
            let manifest = match remote
                .get_source_manifest(&subscription.target_repository, &subscription.target_branch)
                .await
            {
                Ok(manifest) => Some(manifest),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e.into()),
            };
            let previous = manifest.and_then(|m| {
                subscription
                    .target_directory
                    .as_deref()
                    .and_then(|dir| m.repo_version(dir))
                    .map(|r| r.commit_sha.clone())
            });
            return Ok((previous, Vec::new()));
        }

        let previous = remote
            .get_source_dependency(&subscription.target_repository, &subscription.target_branch)
            .await?
            .map(|d| d.sha);
        let diffs = upstream_repo_diffs(
            self.services.git.as_ref(),
            self.services.flower.vmr_path(),
            previous.as_deref(),
            build.commit.as_str(),
            &subscription.target_repository,
        )
        .await?;
        Ok((previous, diffs))
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_code_flow_pull_request(
        &self,
        update: &SubscriptionUpdateWorkItem,
        subscription: &Subscription,
        build: &Build,
        head_branch: &str,
        previous_source_sha: Option<&str>,
        dependency_updates: Vec<DependencyUpdateSummary>,
        diffs: &[UpstreamRepoDiff],
        remote: &dyn Remote,
    ) -> Result<String> {
        let section = CodeFlowSection {
            subscription,
            build,
            previous_source_commit: previous_source_sha,
            dependency_updates: &dependency_updates,
        };
        let content = PullRequestContent {
            title: code_flow_title(&subscription.target_branch, &[update.source_repo.as_str()]),
            description: code_flow_description(&section, head_branch, diffs, None),
            head_branch: head_branch.to_string(),
            base_branch: subscription.target_branch.clone(),
        };

        let url = match remote.create_pull_request(&subscription.target_repository, &content).await {
            Ok(url) => url,
            Err(e) => {
                error!(error = %e, "Failed to create code flow pull request");
                if let Err(delete_error) = remote
                    .delete_branch(&subscription.target_repository, head_branch)
                    .await
                {
                    warn!(branch = %head_branch, error = %delete_error, "Failed to delete code flow branch");
                }
                return Err(e.into());
            }
        };

        let mut pr = InProgressPullRequest::new(self.id.clone(), url.clone(), head_branch);
        pr.source_sha = Some(update.source_sha.clone());
        pr.contained_subscriptions = vec![contained(update)];
        pr.required_updates = dependency_updates;
        pr.code_flow_direction = if subscription.is_forward_flow() {
            CodeFlowDirection::ForwardFlow
        } else {
            CodeFlowDirection::BackFlow
        };

        self.set_default_check_reminder(&mut pr, true).await?;
        self.update_reminders.unset(true).await?;
        self.code_flow_state.try_delete().await?;
        info!(pr = %url, "Code flow pull request created");
        Ok(url)
    }

    #[allow(clippy::too_many_arguments)]
    async fn update_code_flow_pull_request(
        &self,
        update: &SubscriptionUpdateWorkItem,
        mut pr: InProgressPullRequest,
        pr_info: PullRequestInfo,
        subscription: &Subscription,
        build: &Build,
        previous_source_sha: Option<&str>,
        dependency_updates: &[DependencyUpdateSummary],
        diffs: &[UpstreamRepoDiff],
        remote: &dyn Remote,
    ) -> Result<()> {
        pr.contained_subscriptions
            .retain(|s| s.subscription_id != update.subscription_id);
        pr.contained_subscriptions.push(contained(update));
        pr.required_updates = merge_required_updates(&pr.required_updates, dependency_updates);

        let sources: Vec<&str> = pr
            .contained_subscriptions
            .iter()
            .map(|s| s.source_repo.as_str())
            .collect();
        let title = code_flow_title(&subscription.target_branch, &sources);
        let section = CodeFlowSection {
            subscription,
            build,
            previous_source_commit: previous_source_sha,
            dependency_updates: &pr.required_updates,
        };
        let description = code_flow_description(&section, &pr_info.head_branch, diffs, Some(&pr_info.description));

        // The code is already pushed, so a failed title/description refresh
        // must not stop the state below from being saved.
        match remote.update_pull_request(&pr.url, &title, &description).await {
            Ok(()) => info!(pr = %pr.url, "Code flow pull request updated"),
            Err(e) => error!(pr = %pr.url, error = %e, "Failed to update code flow pull request"),
        }

        pr.source_sha = Some(update.source_sha.clone());
        pr.last_update = Utc::now();
        pr.merge_state = MergeState::Mergeable;
        pr.conflict_baseline_sha = None;
        pr.next_builds_to_process.remove(&update.subscription_id);
        self.set_default_check_reminder(&mut pr, true).await?;
        self.update_reminders.unset(true).await?;
        Ok(())
    }

    /// New changes cannot be applied over what the PR branch holds. Park the
    /// update until somebody pushes to the branch.
    async fn handle_pr_update_conflict(
        &self,
        update: &SubscriptionUpdateWorkItem,
        subscription: &Subscription,
        mut pr: InProgressPullRequest,
        pr_info: &PullRequestInfo,
        conflict: &ConflictError,
        remote: &dyn Remote,
    ) -> Result<()> {
        info!(pr = %pr.url, files = conflict.conflicted_files.len(), "Conflict flowing into existing PR");
        let comment = conflict_comment(
            update,
            subscription,
            &conflict.conflicted_files,
            &pr_info.head_branch,
            pr.contained_subscriptions.is_empty(),
        );
        if let Err(e) = remote.comment_pull_request(&pr.url, &comment).await {
            warn!(pr = %pr.url, error = %e, "Failed to post conflict comment");
        }

        let baseline = remote
            .get_latest_commit(&subscription.target_repository, &pr_info.head_branch)
            .await?
            .unwrap_or_else(|| pr_info.head_sha.clone());
        pr.merge_state = MergeState::Conflict;
        pr.conflict_baseline_sha = Some(baseline);
        pr.next_builds_to_process.insert(update.subscription_id, update.build_id);

        self.pr_state.set(&pr).await?;
        self.set_update_reminder(update, true).await?;
        self.check_reminders.unset(true).await?;
        Ok(())
    }

    async fn handle_manual_commits(
        &self,
        update: &SubscriptionUpdateWorkItem,
        mut pr: InProgressPullRequest,
        commits: &[String],
        remote: &dyn Remote,
    ) -> Result<()> {
        info!(pr = %pr.url, commits = commits.len(), "Flow would overwrite manual commits; pausing");
        let already_posted = match remote.get_pull_request_comments(&pr.url).await {
            Ok(comments) => comments.iter().any(|c| c.contains(OVERWRITTEN_COMMIT_MESSAGE)),
            Err(e) => {
                warn!(pr = %pr.url, error = %e, "Could not read PR comments");
                false
            }
        };
        if !already_posted {
            if let Err(e) = remote
                .comment_pull_request(&pr.url, &overwritten_commits_comment(commits))
                .await
            {
                warn!(pr = %pr.url, error = %e, "Failed to post overwritten commits comment");
            }
        }

        pr.blocked_from_future_updates = true;
        pr.next_builds_to_process.insert(update.subscription_id, update.build_id);
        self.update_reminders.unset(true).await?;
        self.set_default_check_reminder(&mut pr, true).await
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
