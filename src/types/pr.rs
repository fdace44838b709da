//! Pull request state persisted per updater, plus the remote's view of a PR.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::dependency::DependencyUpdateSummary;
use super::ids::{BuildId, SubscriptionId, UpdaterId};
use super::merge_policy::MergePolicyEvaluationResults;
use super::subscription::SubscriptionType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeState {
    #[default]
    Mergeable,
    Conflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CodeFlowDirection {
    #[default]
    None,
    ForwardFlow,
    BackFlow,
}

/// One subscription's contribution to a (possibly batched) pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionPullRequestUpdate {
    pub subscription_id: SubscriptionId,
    pub build_id: BuildId,
    pub source_repo: String,
    pub commit_sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoherencyErrorDetails {
    pub error: String,
    #[serde(default)]
    pub potential_solutions: Vec<String>,
}

/// Durable snapshot of the pull request an updater is driving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InProgressPullRequest {
    pub updater_id: UpdaterId,
    pub url: String,
    pub head_branch: String,
    /// Last source commit flowed into the PR (code flow only).
    #[serde(default)]
    pub source_sha: Option<String>,
    /// Head commit observed when the last flow hit a conflict.
    #[serde(default)]
    pub conflict_baseline_sha: Option<String>,
    pub contained_subscriptions: Vec<SubscriptionPullRequestUpdate>,
    #[serde(default)]
    pub required_updates: Vec<DependencyUpdateSummary>,
    #[serde(default = "default_true")]
    pub coherency_check_successful: bool,
    #[serde(default)]
    pub coherency_errors: Vec<CoherencyErrorDetails>,
    #[serde(default)]
    pub merge_state: MergeState,
    /// Builds that arrived while the PR could not be updated.
    #[serde(default)]
    pub next_builds_to_process: BTreeMap<SubscriptionId, BuildId>,
    #[serde(default)]
    pub source_repo_notified: bool,
    /// Set when a flow would overwrite commits pushed by hand. No further
    /// builds flow into the PR until it is merged or closed.
    #[serde(default)]
    pub blocked_from_future_updates: bool,
    #[serde(default)]
    pub code_flow_direction: CodeFlowDirection,
    #[serde(default)]
    pub merge_policy_result: Option<MergePolicyEvaluationResults>,
    pub last_update: DateTime<Utc>,
    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_check: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl InProgressPullRequest {
    pub fn new(updater_id: UpdaterId, url: impl Into<String>, head_branch: impl Into<String>) -> Self {
        InProgressPullRequest {
            updater_id,
            url: url.into(),
            head_branch: head_branch.into(),
            source_sha: None,
            conflict_baseline_sha: None,
            contained_subscriptions: Vec::new(),
            required_updates: Vec::new(),
            coherency_check_successful: true,
            coherency_errors: Vec::new(),
            merge_state: MergeState::Mergeable,
            next_builds_to_process: BTreeMap::new(),
            source_repo_notified: false,
            blocked_from_future_updates: false,
            code_flow_direction: CodeFlowDirection::None,
            merge_policy_result: None,
            last_update: Utc::now(),
            last_check: None,
            next_check: None,
        }
    }

    pub fn is_code_flow(&self) -> bool {
        self.code_flow_direction != CodeFlowDirection::None
    }

    pub fn contains_subscription(&self, id: SubscriptionId) -> bool {
        self.contained_subscriptions
            .iter()
            .any(|s| s.subscription_id == id)
    }
}

/// A pending update that could not be applied immediately.
///
/// At most one exists per updater; a newer build overwrites it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionUpdateWorkItem {
    pub updater_id: UpdaterId,
    pub subscription_id: SubscriptionId,
    pub subscription_type: SubscriptionType,
    pub build_id: BuildId,
    pub source_sha: String,
    pub source_repo: String,
    #[serde(default)]
    pub is_coherency_update: bool,
}

impl SubscriptionUpdateWorkItem {
    pub fn is_code_flow(&self) -> bool {
        self.subscription_type == SubscriptionType::DependenciesAndSources
    }
}

/// Reminder payload: re-evaluate this PR's merge policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestCheck {
    pub updater_id: UpdaterId,
    pub url: String,
    pub is_code_flow: bool,
}

/// Code flow bookkeeping that exists before a PR does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeFlowStatus {
    pub head_branch: String,
    pub source_sha: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrStatus {
    Open,
    Merged,
    Closed,
}

/// The remote's view of a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestInfo {
    pub url: String,
    pub status: PrStatus,
    pub head_branch: String,
    pub base_branch: String,
    pub head_sha: String,
    pub title: String,
    pub description: String,
    pub updated_at: DateTime<Utc>,
}

/// Title and body used when creating or updating a PR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestContent {
    pub title: String,
    pub description: String,
    pub head_branch: String,
    pub base_branch: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    None,
    Pending,
    Error,
    Failure,
    Success,
}

/// A CI check (or commit status) reported on a PR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Check {
    pub status: CheckState,
    pub name: String,
    pub url: String,
    /// Reported by this service's own merge policy evaluation.
    pub is_merge_policy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewState {
    Approved,
    ChangesRequested,
    Commented,
    Rejected,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub state: ReviewState,
    pub reviewer: String,
    pub submitted_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_defaults_survive_old_payloads() {
        let json = serde_json::json!({
            "updater_id": {"kind": "batched", "repository": "https://github.com/dotnet/sdk", "branch": "main"},
            "url": "https://api.github.com/repos/dotnet/sdk/pulls/1",
            "head_branch": "darc-main-1",
            "contained_subscriptions": [],
            "last_update": "2024-01-01T00:00:00Z",
        });
        let pr: InProgressPullRequest = serde_json::from_value(json).unwrap();
        assert!(pr.coherency_check_successful);
        assert_eq!(pr.merge_state, MergeState::Mergeable);
        assert!(!pr.is_code_flow());
        assert!(pr.next_builds_to_process.is_empty());
    }

    #[test]
    fn contains_subscription_checks_ids() {
        let sub = SubscriptionId::new_random();
        let mut pr = InProgressPullRequest::new(UpdaterId::non_batched(sub), "u", "b");
        assert!(!pr.contains_subscription(sub));
        pr.contained_subscriptions.push(SubscriptionPullRequestUpdate {
            subscription_id: sub,
            build_id: BuildId(1),
            source_repo: "r".into(),
            commit_sha: "c".into(),
        });
        assert!(pr.contains_subscription(sub));
    }
}
