//! Policies available to every subscription.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::{MergePolicy, MergePolicyBuilder, MergePolicyRegistry, PullRequestUpdateSummary};
use crate::remote::Remote;
use crate::types::{
    CheckState, CodeFlowDirection, MergePolicyEvaluationResult, MergePolicyStatus, ReviewState,
    SourceManifest,
};

pub const ALL_CHECKS_SUCCESSFUL: &str = "AllChecksSuccessful";
pub const NO_REQUESTED_CHANGES: &str = "NoRequestedChanges";
pub const STANDARD: &str = "Standard";
pub const FORWARD_FLOW: &str = "ForwardFlow";
pub const CODE_FLOW_CHECK: &str = "CodeFlowCheck";

pub fn register_all(registry: &mut MergePolicyRegistry) {
    registry.register(Arc::new(AllChecksSuccessfulBuilder));
    registry.register(Arc::new(NoRequestedChangesBuilder));
    registry.register(Arc::new(StandardBuilder));
    registry.register(Arc::new(ForwardFlowBuilder { name: FORWARD_FLOW }));
    registry.register(Arc::new(ForwardFlowBuilder { name: CODE_FLOW_CHECK }));
}

fn result(
    policy: &str,
    status: MergePolicyStatus,
    title: impl Into<String>,
    message: impl Into<String>,
) -> MergePolicyEvaluationResult {
    MergePolicyEvaluationResult::new(policy, status, title, message)
}

// ─── AllChecksSuccessful ─────────────────────────────────────────────────────

/// Passes once every CI check on the PR has succeeded.
///
/// Our own merge-policy statuses are never counted, and the `ignoreChecks`
/// property (a list of check names) excludes more.
pub struct AllChecksSuccessful {
    ignore_checks: Vec<String>,
}

#[async_trait]
impl MergePolicy for AllChecksSuccessful {
    fn name(&self) -> &str {
        ALL_CHECKS_SUCCESSFUL
    }

    fn display_name(&self) -> &str {
        "All Checks Successful"
    }

    async fn evaluate(&self, pr: &PullRequestUpdateSummary, remote: &dyn Remote) -> MergePolicyEvaluationResult {
        let checks = match remote.get_pull_request_checks(&pr.url).await {
            Ok(checks) => checks,
            Err(e) => {
                return result(
                    self.name(),
                    MergePolicyStatus::TransientFailure,
                    "Error while retrieving checks",
                    e.to_string(),
                );
            }
        };

        let relevant: Vec<_> = checks
            .iter()
            .filter(|c| !c.is_merge_policy && !self.ignore_checks.iter().any(|i| *i == c.name))
            .collect();

        if relevant.is_empty() {
            return result(self.name(), MergePolicyStatus::Pending, "Waiting for checks.", "");
        }

        let names_with = |state: &[CheckState]| {
            relevant
                .iter()
                .filter(|c| state.contains(&c.status))
                .map(|c| c.name.as_str())
                .collect::<Vec<_>>()
        };

        let failed = names_with(&[CheckState::Error, CheckState::Failure]);
        if !failed.is_empty() {
            return result(
                self.name(),
                MergePolicyStatus::TransientFailure,
                "Unsuccessful checks",
                failed.join(", "),
            );
        }

        let pending = names_with(&[CheckState::Pending, CheckState::None]);
        if !pending.is_empty() {
            return result(
                self.name(),
                MergePolicyStatus::Pending,
                "Waiting for checks",
                pending.join(", "),
            );
        }

        result(self.name(), MergePolicyStatus::TransientSuccess, "Successful checks", "")
    }
}

struct AllChecksSuccessfulBuilder;

fn ignore_checks(properties: &BTreeMap<String, serde_json::Value>) -> Vec<String> {
    properties
        .get("ignoreChecks")
        .and_then(|v| serde_json::from_value::<Vec<String>>(v.clone()).ok())
        .unwrap_or_default()
}

impl MergePolicyBuilder for AllChecksSuccessfulBuilder {
    fn name(&self) -> &str {
        ALL_CHECKS_SUCCESSFUL
    }

    fn build(
        &self,
        properties: &BTreeMap<String, serde_json::Value>,
        _pr: &PullRequestUpdateSummary,
    ) -> Vec<Box<dyn MergePolicy>> {
        vec![Box::new(AllChecksSuccessful {
            ignore_checks: ignore_checks(properties),
        })]
    }
}

// ─── NoRequestedChanges ──────────────────────────────────────────────────────

/// Fails while any reviewer's latest review requests changes.
pub struct NoRequestedChanges;

#[async_trait]
impl MergePolicy for NoRequestedChanges {
    fn name(&self) -> &str {
        NO_REQUESTED_CHANGES
    }

    fn display_name(&self) -> &str {
        "No Requested Changes"
    }

    async fn evaluate(&self, pr: &PullRequestUpdateSummary, remote: &dyn Remote) -> MergePolicyEvaluationResult {
        let reviews = match remote.get_pull_request_reviews(&pr.url).await {
            Ok(reviews) => reviews,
            Err(e) => {
                return result(
                    self.name(),
                    MergePolicyStatus::TransientFailure,
                    "Error while retrieving reviews",
                    e.to_string(),
                );
            }
        };

        let mut latest = HashMap::new();
        for review in &reviews {
            // Reviews arrive oldest first; later ones replace earlier ones.
            if review.state != ReviewState::Commented {
                latest.insert(review.reviewer.as_str(), review.state);
            }
        }

        let mut blocking: Vec<&str> = latest
            .iter()
            .filter(|(_, state)| matches!(state, ReviewState::ChangesRequested | ReviewState::Rejected))
            .map(|(reviewer, _)| *reviewer)
            .collect();
        blocking.sort_unstable();

        if blocking.is_empty() {
            result(self.name(), MergePolicyStatus::TransientSuccess, "No changes requested", "")
        } else {
            result(
                self.name(),
                MergePolicyStatus::TransientFailure,
                "Changes requested",
                format!("Changes requested by {}", blocking.join(", ")),
            )
        }
    }
}

struct NoRequestedChangesBuilder;

impl MergePolicyBuilder for NoRequestedChangesBuilder {
    fn name(&self) -> &str {
        NO_REQUESTED_CHANGES
    }

    fn build(
        &self,
        _properties: &BTreeMap<String, serde_json::Value>,
        _pr: &PullRequestUpdateSummary,
    ) -> Vec<Box<dyn MergePolicy>> {
        vec![Box::new(NoRequestedChanges)]
    }
}

/// `AllChecksSuccessful` plus `NoRequestedChanges`.
struct StandardBuilder;

impl MergePolicyBuilder for StandardBuilder {
    fn name(&self) -> &str {
        STANDARD
    }

    fn build(
        &self,
        properties: &BTreeMap<String, serde_json::Value>,
        _pr: &PullRequestUpdateSummary,
    ) -> Vec<Box<dyn MergePolicy>> {
        vec![
            Box::new(AllChecksSuccessful {
                ignore_checks: ignore_checks(properties),
            }),
            Box::new(NoRequestedChanges),
        ]
    }
}

// ─── ForwardFlow ─────────────────────────────────────────────────────────────

/// Validates the VMR source manifest of a forward-flow PR.
///
/// The flowed repository must be recorded at the build's commit and BAR id,
/// and no other repository may differ from the target branch.
pub struct ForwardFlow {
    name: &'static str,
}

impl ForwardFlow {
    fn fail(&self, message: String) -> MergePolicyEvaluationResult {
        result(self.name, MergePolicyStatus::DecisiveFailure, "Forward flow checks failed", message)
    }

    fn check_flowed_repos(&self, pr: &PullRequestUpdateSummary, head: &SourceManifest) -> Vec<String> {
        let mut errors = Vec::new();
        for update in &pr.contained_updates {
            let Some(record) = head.by_remote_uri(&update.source_repo) else {
                errors.push(format!(
                    "The source manifest does not contain an entry for {}.",
                    update.source_repo
                ));
                continue;
            };
            if record.commit_sha != update.commit_sha {
                errors.push(format!(
                    "Commit SHA {} of {} in the source manifest does not match the flowed commit {}.",
                    record.commit_sha, update.source_repo, update.commit_sha
                ));
            }
            if record.bar_id != Some(update.build_id) {
                let recorded = record
                    .bar_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "(none)".to_string());
                errors.push(format!(
                    "BAR ID {recorded} of {} in the source manifest does not match the flowed build {}.",
                    update.source_repo, update.build_id
                ));
            }
        }
        errors
    }

    fn check_unrelated_repos(
        &self,
        pr: &PullRequestUpdateSummary,
        head: &SourceManifest,
        target: &SourceManifest,
    ) -> Vec<String> {
        let flowed = |uri: &str| {
            pr.contained_updates
                .iter()
                .any(|u| u.source_repo.eq_ignore_ascii_case(uri))
        };
        let flowed_names = pr
            .contained_updates
            .iter()
            .map(|u| u.source_repo.as_str())
            .collect::<Vec<_>>()
            .join(", ");

        let mut errors = Vec::new();
        for record in head.repositories.iter().filter(|r| !flowed(&r.remote_uri)) {
            match target.by_remote_uri(&record.remote_uri) {
                None => errors.push(format!(
                    "The source manifest has a new entry for {}. Only changes to the {flowed_names} are expected.",
                    record.remote_uri
                )),
                Some(before) if before != record => errors.push(format!(
                    "The source manifest entry for {} changed. Only changes to the {flowed_names} are expected.",
                    record.remote_uri
                )),
                Some(_) => {}
            }
        }
        for record in target.repositories.iter().filter(|r| !flowed(&r.remote_uri)) {
            if head.by_remote_uri(&record.remote_uri).is_none() {
                errors.push(format!(
                    "The source manifest has a removal of {}. Only changes to the {flowed_names} are expected.",
                    record.remote_uri
                ));
            }
        }
        errors
    }
}

#[async_trait]
impl MergePolicy for ForwardFlow {
    fn name(&self) -> &str {
        self.name
    }

    fn display_name(&self) -> &str {
        "Forward Flow"
    }

    async fn evaluate(&self, pr: &PullRequestUpdateSummary, remote: &dyn Remote) -> MergePolicyEvaluationResult {
        let head = match remote.get_source_manifest(&pr.repo_url, &pr.head_branch).await {
            Ok(m) => m,
            Err(e) => {
                warn!(pr = %pr.url, error = %e, "Failed to read head source manifest");
                return result(
                    self.name,
                    MergePolicyStatus::TransientFailure,
                    "Error while retrieving head branch source manifest",
                    e.to_string(),
                );
            }
        };

        let mut errors = self.check_flowed_repos(pr, &head);

        if let Some(target_branch) = pr.target_branch.as_deref() {
            let target = match remote.get_source_manifest(&pr.repo_url, target_branch).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(pr = %pr.url, error = %e, "Failed to read target source manifest");
                    return result(
                        self.name,
                        MergePolicyStatus::TransientFailure,
                        "Error while retrieving target branch source manifest",
                        e.to_string(),
                    );
                }
            };
            errors.extend(self.check_unrelated_repos(pr, &head, &target));
        }

        if errors.is_empty() {
            result(self.name, MergePolicyStatus::DecisiveSuccess, "Forward flow checks succeeded", "")
        } else {
            self.fail(errors.join("\n"))
        }
    }
}

/// Only forward-flow PRs get the manifest checks.
struct ForwardFlowBuilder {
    name: &'static str,
}

impl MergePolicyBuilder for ForwardFlowBuilder {
    fn name(&self) -> &str {
        self.name
    }

    fn build(
        &self,
        _properties: &BTreeMap<String, serde_json::Value>,
        pr: &PullRequestUpdateSummary,
    ) -> Vec<Box<dyn MergePolicy>> {
        if pr.code_flow_direction == CodeFlowDirection::ForwardFlow {
            vec![Box::new(ForwardFlow { name: self.name })]
        } else {
            Vec::new()
        }
    }
}
