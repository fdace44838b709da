//! Evaluating an open pull request: policies, merging and reminders.

use chrono::Utc;
use tracing::{info, instrument, warn};

use super::{PullRequestUpdater, Result, UpdaterTarget};
use crate::policy::PullRequestUpdateSummary;
use crate::remote::{MergeParameters, Remote};
use crate::types::{
    InProgressPullRequest, MergePolicyEvaluationResults, MergePolicyStatus, MergeState, PrStatus,
    PullRequestInfo, Sha,
};

/// Where a tracked pull request stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullRequestStatus {
    /// Merged or closed; state has been cleared.
    Completed,
    /// The tracked state no longer describes a real PR.
    Invalid,
    InProgressCanUpdate,
    InProgressCannotUpdate,
}

/// Outcome of evaluating policies and, when they pass, merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicyCheckResult {
    Merged,
    NoPolicies,
    FailedPolicies,
    PendingPolicies,
    FailedToMerge,
}

impl PullRequestUpdater {
    /// Queries the PR and acts on it: merges it when policies pass, forgets it
    /// once merged or closed, and otherwise schedules the next check.
    #[instrument(skip(self, pr), fields(updater = %self.id, pr = %pr.url))]
    pub async fn get_pull_request_status(
        &self,
        mut pr: InProgressPullRequest,
        is_code_flow: bool,
        trying_to_update: bool,
    ) -> Result<(PullRequestStatus, Option<PullRequestInfo>)> {
        let target = self.target().await?;
        let remote = self.remote_for(&target.repository)?;

        let pr_info = match remote.get_pull_request(&pr.url).await {
            Ok(info) => info,
            Err(e) if e.is_not_found() => {
                warn!("Tracked pull request no longer exists");
                self.clear_all_state(is_code_flow, pr.merge_state == MergeState::Mergeable)
                    .await?;
                return Ok((PullRequestStatus::Invalid, None));
            }
            Err(e) => return Err(e.into()),
        };
        info!(status = ?pr_info.status, "Pull request status");

        let delay = if trying_to_update {
            self.services.config.default_reminder_delay
        } else {
            self.services.config.check_delay(pr_info.updated_at, Utc::now())
        };

        match pr_info.status {
            PrStatus::Open => {
                let result = self.try_merging(&mut pr, &pr_info, &target, remote.as_ref()).await?;
                info!(result = ?result, "Policy check finished");

                match result {
                    MergePolicyCheckResult::Merged => {
                        self.update_subscriptions_for_merged_pr(&pr.contained_subscriptions)
                            .await;
                        self.clear_all_state(is_code_flow, pr.merge_state == MergeState::Mergeable)
                            .await?;
                        Ok((PullRequestStatus::Completed, Some(pr_info)))
                    }
                    MergePolicyCheckResult::PendingPolicies => {
                        info!("Policies pending; PR cannot be updated now");
                        self.set_check_reminder(&mut pr, is_code_flow, delay).await?;
                        Ok((PullRequestStatus::InProgressCannotUpdate, Some(pr_info)))
                    }
                    MergePolicyCheckResult::FailedPolicies => {
                        info!("Policies failed; PR cannot be updated until they are fixed");
                        self.services
                            .notifier
                            .tag_source_repository_contacts(remote.as_ref(), &mut pr)
                            .await;
                        self.set_check_reminder(&mut pr, is_code_flow, delay).await?;
                        Ok((PullRequestStatus::InProgressCannotUpdate, Some(pr_info)))
                    }
                    MergePolicyCheckResult::NoPolicies | MergePolicyCheckResult::FailedToMerge => {
                        if is_code_flow && pr.merge_state == MergeState::Conflict {
                            let head = remote
                                .get_latest_commit(&target.repository, &pr.head_branch)
                                .await?
                                .unwrap_or_else(|| pr_info.head_sha.clone());
                            if pr.conflict_baseline_sha.as_deref() == Some(head.as_str()) {
                                info!("PR is in conflict and its head has not moved");
                                self.pr_state.set(&pr).await?;
                                return Ok((PullRequestStatus::InProgressCannotUpdate, Some(pr_info)));
                            }
                        }

                        self.set_check_reminder(&mut pr, is_code_flow, delay).await?;
                        Ok((PullRequestStatus::InProgressCanUpdate, Some(pr_info)))
                    }
                }
            }
            PrStatus::Merged | PrStatus::Closed => {
                if pr_info.status == PrStatus::Merged {
                    self.update_subscriptions_for_merged_pr(&pr.contained_subscriptions)
                        .await;
                }
                info!(status = ?pr_info.status, "PR was finished by hand; no longer tracking it");
                self.clear_all_state(is_code_flow, pr.merge_state == MergeState::Mergeable)
                    .await?;

                if let Err(e) = remote.delete_pull_request_branch(&pr.url).await {
                    info!(error = %e, "Failed to delete PR branch");
                }
                Ok((PullRequestStatus::Completed, Some(pr_info)))
            }
        }
    }

    async fn try_merging(
        &self,
        pr: &mut InProgressPullRequest,
        pr_info: &PullRequestInfo,
        target: &UpdaterTarget,
        remote: &dyn Remote,
    ) -> Result<MergePolicyCheckResult> {
        let results = self.run_merge_policy_evaluation(pr, pr_info, target, remote).await?;

        if results.failed() {
            info!(policies = %describe(&results, |s| !s.is_success()), "Not merged: failed policies");
            return Ok(MergePolicyCheckResult::FailedPolicies);
        }
        if results.pending() {
            info!(
                policies = %describe(&results, |s| s == MergePolicyStatus::Pending),
                "Not merged: pending policies"
            );
            return Ok(MergePolicyCheckResult::PendingPolicies);
        }
        if !results.succeeded() {
            info!("Not merged: no merge policies");
            return Ok(MergePolicyCheckResult::NoPolicies);
        }

        let parameters = MergeParameters {
            commit_to_merge: pr_info.head_sha.clone(),
            squash_merge: true,
            delete_source_branch: true,
        };
        match remote
            .merge_pull_request(&pr.url, &parameters, &merge_commit_message(pr_info, &results))
            .await
        {
            Ok(()) => {
                let passed: Vec<&str> = target.merge_policies.iter().map(|p| p.name.as_str()).collect();
                info!(policies = %passed.join(", "), "Merged");
                Ok(MergePolicyCheckResult::Merged)
            }
            Err(e) => {
                warn!(error = %e, "Not merged: merge failed");
                Ok(MergePolicyCheckResult::FailedToMerge)
            }
        }
    }

    /// Evaluates policies against the PR head, caching the results and
    /// publishing them as status checks.
    async fn run_merge_policy_evaluation(
        &self,
        pr: &mut InProgressPullRequest,
        pr_info: &PullRequestInfo,
        target: &UpdaterTarget,
        remote: &dyn Remote,
    ) -> Result<MergePolicyEvaluationResults> {
        let summary = PullRequestUpdateSummary::from_in_progress(pr, &target.repository, Some(&pr_info.base_branch));
        let cached = self.policy_results.get().await?;
        let results = self
            .services
            .evaluator
            .evaluate(
                &summary,
                remote,
                &target.merge_policies,
                cached.as_ref(),
                &Sha::new(pr_info.head_sha.clone()),
            )
            .await;

        self.policy_results.set(&results).await?;
        remote.create_or_update_merge_status(&pr.url, &results.results).await?;
        pr.merge_policy_result = Some(results.clone());
        Ok(results)
    }
}

fn describe(results: &MergePolicyEvaluationResults, include: impl Fn(MergePolicyStatus) -> bool) -> String {
    results
        .results
        .iter()
        .filter(|r| include(r.status))
        .map(|r| format!("{} - {}: {}", r.merge_policy_name, r.title, r.message))
        .collect::<Vec<_>>()
        .join("; ")
}

fn merge_commit_message(pr_info: &PullRequestInfo, results: &MergePolicyEvaluationResults) -> String {
    let mut message = format!("{}\n\n", pr_info.title);
    for result in &results.results {
        message.push_str(&format!("- {}: {}\n", result.title, result.message));
    }
    message
}
