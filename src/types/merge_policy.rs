//! Merge policy evaluation outcomes.

use serde::{Deserialize, Serialize};

use super::ids::Sha;

/// Outcome of a single policy.
///
/// Decisive outcomes are cached for the head commit they were computed on;
/// transient and pending ones are recomputed on every check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicyStatus {
    DecisiveSuccess,
    DecisiveFailure,
    Pending,
    TransientSuccess,
    TransientFailure,
}

impl MergePolicyStatus {
    pub fn is_decisive(self) -> bool {
        matches!(self, Self::DecisiveSuccess | Self::DecisiveFailure)
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Self::DecisiveFailure | Self::TransientFailure)
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::DecisiveSuccess | Self::TransientSuccess)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergePolicyEvaluationResult {
    pub merge_policy_name: String,
    pub status: MergePolicyStatus,
    pub title: String,
    pub message: String,
}

impl MergePolicyEvaluationResult {
    pub fn new(
        policy: &str,
        status: MergePolicyStatus,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        MergePolicyEvaluationResult {
            merge_policy_name: policy.to_string(),
            status,
            title: title.into(),
            message: message.into(),
        }
    }
}

/// Aggregated outcome of all policies against one head commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergePolicyEvaluationResults {
    pub results: Vec<MergePolicyEvaluationResult>,
    pub target_commit_sha: Sha,
}

impl MergePolicyEvaluationResults {
    pub fn failed(&self) -> bool {
        self.results.iter().any(|r| r.status.is_failure())
    }

    pub fn pending(&self) -> bool {
        self.results
            .iter()
            .any(|r| r.status == MergePolicyStatus::Pending)
    }

    pub fn succeeded(&self) -> bool {
        !self.results.is_empty() && !self.failed() && !self.pending()
    }
}
