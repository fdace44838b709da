//! Contracts for the external collaborators the updater talks to.
//!
//! - [`PullRequestHost`]: pull request lifecycle, comments, statuses.
//! - [`RepositoryContent`]: dependency manifests, branches, commits.
//! - [`AssetRegistry`]: build/subscription lookups; [`StoredRegistry`] keeps
//!   them in the durable store.
//!
//! A [`Remote`] is both halves for one repository host. Every method returns a
//! [`RemoteError`] whose kind separates "not found" from transport failures.

pub mod error;
pub mod registry;
pub mod retry;

use std::sync::Arc;

use async_trait::async_trait;

use crate::types::{
    Build, BuildId, ChannelId, Check, DependencyDetail, MergePolicyDefinition, MergePolicyEvaluationResult,
    PullRequestContent, PullRequestInfo, Review, SourceDependency, SourceManifest, Subscription,
    SubscriptionId, UpdateFrequency,
};

pub use error::{RemoteError, RemoteErrorKind};
pub use registry::{RepositoryBranchSettings, StoredRegistry};
pub use retry::{RetryConfig, RetryPolicy, RetryResult, retry_with_backoff};

pub type Result<T> = std::result::Result<T, RemoteError>;

/// How a pull request should be merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeParameters {
    /// Only merge if the head is still at this commit.
    pub commit_to_merge: String,
    pub squash_merge: bool,
    pub delete_source_branch: bool,
}

#[async_trait]
pub trait PullRequestHost: Send + Sync {
    /// Opens a pull request and returns its API URL.
    async fn create_pull_request(&self, repo: &str, content: &PullRequestContent) -> Result<String>;

    async fn update_pull_request(&self, url: &str, title: &str, description: &str) -> Result<()>;

    async fn get_pull_request(&self, url: &str) -> Result<PullRequestInfo>;

    async fn merge_pull_request(
        &self,
        url: &str,
        parameters: &MergeParameters,
        commit_message: &str,
    ) -> Result<()>;

    /// Publishes policy results as status checks on the PR head commit.
    async fn create_or_update_merge_status(
        &self,
        url: &str,
        results: &[MergePolicyEvaluationResult],
    ) -> Result<()>;

    /// The head commit of `branch`, or `None` if the branch does not exist.
    async fn get_latest_commit(&self, repo: &str, branch: &str) -> Result<Option<String>>;

    async fn comment_pull_request(&self, url: &str, body: &str) -> Result<()>;

    async fn get_pull_request_comments(&self, url: &str) -> Result<Vec<String>>;

    async fn get_pull_request_checks(&self, url: &str) -> Result<Vec<Check>>;

    async fn get_pull_request_reviews(&self, url: &str) -> Result<Vec<Review>>;

    async fn delete_branch(&self, repo: &str, branch: &str) -> Result<()>;

    /// Deletes the head branch of a (merged or closed) pull request.
    async fn delete_pull_request_branch(&self, url: &str) -> Result<()>;
}

#[async_trait]
pub trait RepositoryContent: Send + Sync {
    /// Dependencies declared at `branch_or_commit`, optionally filtered by name.
    async fn get_dependencies(
        &self,
        repo: &str,
        branch_or_commit: &str,
        name: Option<&str>,
    ) -> Result<Vec<DependencyDetail>>;

    async fn create_new_branch(&self, repo: &str, base_branch: &str, new_branch: &str) -> Result<()>;

    /// Writes the given dependency versions to the manifest in a single
    /// commit. An empty list produces an empty commit.
    async fn commit_updates(
        &self,
        repo: &str,
        branch: &str,
        updates: &[DependencyDetail],
        message: &str,
    ) -> Result<()>;

    /// The VMR commit the repository was last backflowed from.
    async fn get_source_dependency(&self, repo: &str, branch: &str) -> Result<Option<SourceDependency>>;

    async fn get_source_manifest(&self, repo: &str, branch: &str) -> Result<SourceManifest>;
}

/// A full remote for one repository host.
pub trait Remote: PullRequestHost + RepositoryContent {}

impl<T: PullRequestHost + RepositoryContent + ?Sized> Remote for T {}

/// Hands out the remote responsible for a repository URL.
pub trait RemoteFactory: Send + Sync {
    fn remote_for(&self, repo: &str) -> Result<Arc<dyn Remote>>;
}

/// Filter for [`AssetRegistry::get_subscriptions`]. `None` matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionQuery {
    pub source_repository: Option<String>,
    pub channel_id: Option<ChannelId>,
    pub enabled: Option<bool>,
    pub source_enabled: Option<bool>,
    pub update_frequency: Option<UpdateFrequency>,
}

impl SubscriptionQuery {
    pub fn matches(&self, subscription: &Subscription) -> bool {
        self.source_repository
            .as_deref()
            .is_none_or(|r| r.eq_ignore_ascii_case(&subscription.source_repository))
            && self.channel_id.is_none_or(|c| c == subscription.channel_id)
            && self.enabled.is_none_or(|e| e == subscription.enabled)
            && self
                .source_enabled
                .is_none_or(|e| e == subscription.source_enabled)
            && self
                .update_frequency
                .is_none_or(|f| f == subscription.policy.update_frequency)
    }
}

/// Read access to builds and subscriptions, plus the one write the updater
/// performs: advancing a subscription's last applied build.
#[async_trait]
pub trait AssetRegistry: Send + Sync {
    async fn get_build(&self, id: BuildId) -> Result<Option<Build>>;

    async fn get_subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>>;

    async fn get_subscriptions(&self, query: &SubscriptionQuery) -> Result<Vec<Subscription>>;

    async fn update_last_applied_build(&self, subscription: SubscriptionId, build: BuildId) -> Result<()>;

    /// The newest build of `repo` assigned to `channel`.
    async fn get_latest_build(&self, repo: &str, channel: ChannelId) -> Result<Option<Build>>;

    /// Channels builds of `repo`@`branch` are assigned to by default.
    async fn get_default_channels(&self, repo: &str, branch: &str) -> Result<Vec<ChannelId>>;

    /// Policies guarding batched PRs into `repo`@`branch`.
    async fn get_repository_merge_policies(&self, repo: &str, branch: &str) -> Result<Vec<MergePolicyDefinition>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::subscription;

    #[test]
    fn empty_query_matches_everything() {
        let s = subscription("https://github.com/a/b", "https://github.com/c/d", "main");
        assert!(SubscriptionQuery::default().matches(&s));
    }

    #[test]
    fn query_filters_each_field() {
        let mut s = subscription("https://github.com/dotnet/dotnet", "https://github.com/c/d", "main");
        s.source_enabled = true;
        let q = SubscriptionQuery {
            source_repository: Some("https://github.com/DOTNET/dotnet".into()),
            source_enabled: Some(true),
            channel_id: Some(s.channel_id),
            ..Default::default()
        };
        assert!(q.matches(&s));
        s.source_enabled = false;
        assert!(!q.matches(&s));
    }
}
