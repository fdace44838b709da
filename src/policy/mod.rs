//! Pluggable merge policies.
//!
//! A subscription lists [`MergePolicyDefinition`]s by name. The
//! [`MergePolicyRegistry`] maps each name to a [`MergePolicyBuilder`], which
//! turns the definition's properties into one or more [`MergePolicy`]
//! instances. New policies are added by registering a builder; the
//! [`MergePolicyEvaluator`] never changes.

pub mod builtin;
pub mod notifier;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::remote::Remote;
use crate::types::{
    CodeFlowDirection, CoherencyErrorDetails, DependencyUpdateSummary, InProgressPullRequest,
    MergePolicyDefinition, MergePolicyEvaluationResult, MergePolicyEvaluationResults,
    MergePolicyStatus, Sha, SubscriptionPullRequestUpdate,
};

pub use notifier::PolicyFailureNotifier;

/// What a policy gets to see about the pull request under evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestUpdateSummary {
    pub url: String,
    pub coherency_check_successful: bool,
    pub coherency_errors: Vec<CoherencyErrorDetails>,
    pub required_updates: Vec<DependencyUpdateSummary>,
    pub contained_updates: Vec<SubscriptionPullRequestUpdate>,
    pub head_branch: String,
    /// `None` when the PR's base branch is unknown.
    pub target_branch: Option<String>,
    pub repo_url: String,
    pub code_flow_direction: CodeFlowDirection,
}

impl PullRequestUpdateSummary {
    pub fn from_in_progress(pr: &InProgressPullRequest, repo_url: &str, target_branch: Option<&str>) -> Self {
        PullRequestUpdateSummary {
            url: pr.url.clone(),
            coherency_check_successful: pr.coherency_check_successful,
            coherency_errors: pr.coherency_errors.clone(),
            required_updates: pr.required_updates.clone(),
            contained_updates: pr.contained_subscriptions.clone(),
            head_branch: pr.head_branch.clone(),
            target_branch: target_branch.map(str::to_string),
            repo_url: repo_url.to_string(),
            code_flow_direction: pr.code_flow_direction,
        }
    }
}

#[async_trait]
pub trait MergePolicy: Send + Sync {
    /// Stable name; used as the cache key and in the status check context.
    fn name(&self) -> &str;

    fn display_name(&self) -> &str;

    async fn evaluate(&self, pr: &PullRequestUpdateSummary, remote: &dyn Remote) -> MergePolicyEvaluationResult;
}

/// Produces policies from a definition's properties.
pub trait MergePolicyBuilder: Send + Sync {
    fn name(&self) -> &str;

    fn build(
        &self,
        properties: &BTreeMap<String, serde_json::Value>,
        pr: &PullRequestUpdateSummary,
    ) -> Vec<Box<dyn MergePolicy>>;
}

#[derive(Clone, Default)]
pub struct MergePolicyRegistry {
    builders: BTreeMap<String, Arc<dyn MergePolicyBuilder>>,
}

impl MergePolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in policy.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    /// Registers `builder` under its name, replacing any previous one.
    pub fn register(&mut self, builder: Arc<dyn MergePolicyBuilder>) {
        self.builders.insert(builder.name().to_string(), builder);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn MergePolicyBuilder>> {
        self.builders.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.builders.keys().map(String::as_str)
    }
}

pub const UNKNOWN_POLICY_TITLE: &str = "Unknown Merge Policy";

#[derive(Clone)]
pub struct MergePolicyEvaluator {
    registry: MergePolicyRegistry,
}

impl MergePolicyEvaluator {
    pub fn new(registry: MergePolicyRegistry) -> Self {
        MergePolicyEvaluator { registry }
    }

    /// Evaluates every policy the definitions resolve to.
    ///
    /// A cached result is reused only if it is decisive and was computed for
    /// `head_sha`. Unknown policy names evaluate to a decisive failure.
    #[instrument(skip_all, fields(pr = %pr.url, head = %head_sha))]
    pub async fn evaluate(
        &self,
        pr: &PullRequestUpdateSummary,
        remote: &dyn Remote,
        definitions: &[MergePolicyDefinition],
        cached: Option<&MergePolicyEvaluationResults>,
        head_sha: &Sha,
    ) -> MergePolicyEvaluationResults {
        let mut results = Vec::new();

        for definition in definitions {
            let Some(builder) = self.registry.get(&definition.name) else {
                warn!(policy = %definition.name, "Unknown merge policy");
                results.push(MergePolicyEvaluationResult::new(
                    &definition.name,
                    MergePolicyStatus::DecisiveFailure,
                    UNKNOWN_POLICY_TITLE,
                    format!("Unknown merge policy '{}'", definition.name),
                ));
                continue;
            };

            for policy in builder.build(&definition.properties, pr) {
                let reusable = cached
                    .filter(|c| c.target_commit_sha == *head_sha)
                    .and_then(|c| {
                        c.results
                            .iter()
                            .find(|r| r.merge_policy_name == policy.name() && r.status.is_decisive())
                    });

                let result = match reusable {
                    Some(previous) => {
                        debug!(policy = %policy.name(), "Reusing cached decisive result");
                        previous.clone()
                    }
                    None => policy.evaluate(pr, remote).await,
                };
                results.push(result);
            }
        }

        MergePolicyEvaluationResults {
            results,
            target_commit_sha: head_sha.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeRemote;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingPolicy {
        status: MergePolicyStatus,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl MergePolicy for CountingPolicy {
        fn name(&self) -> &str {
            "Counting"
        }

        fn display_name(&self) -> &str {
            "Counting policy"
        }

        async fn evaluate(&self, _pr: &PullRequestUpdateSummary, _remote: &dyn Remote) -> MergePolicyEvaluationResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            MergePolicyEvaluationResult::new("Counting", self.status, "counted", "")
        }
    }

    struct CountingBuilder {
        status: MergePolicyStatus,
        calls: Arc<AtomicU32>,
    }

    impl MergePolicyBuilder for CountingBuilder {
        fn name(&self) -> &str {
            "Counting"
        }

        fn build(
            &self,
            _properties: &BTreeMap<String, serde_json::Value>,
            _pr: &PullRequestUpdateSummary,
        ) -> Vec<Box<dyn MergePolicy>> {
            vec![Box::new(CountingPolicy {
                status: self.status,
                calls: Arc::clone(&self.calls),
            })]
        }
    }

    fn summary() -> PullRequestUpdateSummary {
        PullRequestUpdateSummary {
            url: "https://api.github.com/repos/a/b/pulls/1".into(),
            coherency_check_successful: true,
            coherency_errors: vec![],
            required_updates: vec![],
            contained_updates: vec![],
            head_branch: "darc-main-x".into(),
            target_branch: Some("main".into()),
            repo_url: "https://github.com/a/b".into(),
            code_flow_direction: CodeFlowDirection::None,
        }
    }

    fn evaluator(status: MergePolicyStatus) -> (MergePolicyEvaluator, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = MergePolicyRegistry::new();
        registry.register(Arc::new(CountingBuilder {
            status,
            calls: Arc::clone(&calls),
        }));
        (MergePolicyEvaluator::new(registry), calls)
    }

    #[tokio::test]
    async fn decisive_results_are_cached_per_head_commit() {
        let (evaluator, calls) = evaluator(MergePolicyStatus::DecisiveSuccess);
        let remote = FakeRemote::new();
        let defs = [MergePolicyDefinition::named("Counting")];
        let head = Sha::new("head1");

        let first = evaluator.evaluate(&summary(), &remote, &defs, None, &head).await;
        let second = evaluator
            .evaluate(&summary(), &remote, &defs, Some(&first), &head)
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);

        evaluator
            .evaluate(&summary(), &remote, &defs, Some(&first), &Sha::new("head2"))
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn pending_results_are_always_recomputed() {
        let (evaluator, calls) = evaluator(MergePolicyStatus::Pending);
        let remote = FakeRemote::new();
        let defs = [MergePolicyDefinition::named("Counting")];
        let head = Sha::new("head1");

        let first = evaluator.evaluate(&summary(), &remote, &defs, None, &head).await;
        evaluator
            .evaluate(&summary(), &remote, &defs, Some(&first), &head)
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_policy_fails_decisively() {
        let evaluator = MergePolicyEvaluator::new(MergePolicyRegistry::new());
        let remote = FakeRemote::new();
        let results = evaluator
            .evaluate(
                &summary(),
                &remote,
                &[MergePolicyDefinition::named("NoSuchPolicy")],
                None,
                &Sha::new("h"),
            )
            .await;
        assert!(results.failed());
        assert_eq!(results.results[0].title, UNKNOWN_POLICY_TITLE);
    }

    #[tokio::test]
    async fn no_definitions_means_no_results() {
        let evaluator = MergePolicyEvaluator::new(MergePolicyRegistry::with_builtins());
        let remote = FakeRemote::new();
        let results = evaluator
            .evaluate(&summary(), &remote, &[], None, &Sha::new("h"))
            .await;
        assert!(results.results.is_empty());
        assert!(!results.succeeded());
    }
}
