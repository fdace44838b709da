//! Shared test utilities: fixtures, in-memory fakes of the remote
//! collaborators, and arbitrary generators for property-based testing.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

use crate::codeflow::{CodeFlowError, CodeFlowResult, CodeFlower};
use crate::git::{Git, GitOutput, GitResult};
use crate::remote::{
    AssetRegistry, MergeParameters, PullRequestHost, Remote, RemoteError, RemoteFactory, RepositoryContent,
    Result, SubscriptionQuery,
};
use crate::types::{
    Build, BuildId, ChannelId, Check, DependencyDetail, DependencyType, MergePolicyDefinition,
    MergePolicyEvaluationResult, PrStatus, PullRequestContent, PullRequestInfo, Review, Sha, SourceDependency,
    SourceManifest, Subscription, SubscriptionId, SubscriptionPolicy, UpdateFrequency,
};

// ─── Fixtures ─────────────────────────────────────────────────────────────────

/// An enabled, non-batched dependency subscription on channel 1.
pub fn subscription(source: &str, target: &str, branch: &str) -> Subscription {
    Subscription {
        id: SubscriptionId::new_random(),
        channel_id: ChannelId(1),
        source_repository: source.to_string(),
        target_repository: target.to_string(),
        target_branch: branch.to_string(),
        enabled: true,
        source_enabled: false,
        source_directory: None,
        target_directory: None,
        policy: SubscriptionPolicy::default(),
        excluded_assets: Vec::new(),
        pull_request_failure_notification_tags: None,
        last_applied_build_id: None,
    }
}

/// A build of `repo`@main on channel 1 with no assets.
pub fn build(id: u64, repo: &str, commit: &str) -> Build {
    Build {
        id: BuildId(id),
        commit: Sha::new(commit),
        github_repository: Some(repo.to_string()),
        github_branch: Some("main".to_string()),
        azdo_repository: None,
        azdo_branch: None,
        azdo_build: None,
        date_produced: Utc::now(),
        assets: Vec::new(),
        channels: vec![ChannelId(1)],
    }
}

// ─── Generators ───────────────────────────────────────────────────────────────

fn arb_repo() -> impl Strategy<Value = String> {
    "[a-z]{1,8}/[a-z][a-z0-9-]{0,12}".prop_map(|path| format!("https://github.com/{path}"))
}

pub fn arb_update_frequency() -> impl Strategy<Value = UpdateFrequency> {
    prop_oneof![
        Just(UpdateFrequency::None),
        Just(UpdateFrequency::EveryBuild),
        Just(UpdateFrequency::EveryDay),
        Just(UpdateFrequency::TwiceDaily),
        Just(UpdateFrequency::EveryWeek),
        Just(UpdateFrequency::EveryTwoWeeks),
        Just(UpdateFrequency::EveryMonth),
    ]
}

pub fn arb_subscription() -> impl Strategy<Value = Subscription> {
    (
        arb_repo(),
        arb_repo(),
        "[a-z][a-z0-9/.-]{0,15}",
        any::<bool>(),
        any::<bool>(),
        arb_update_frequency(),
        0u64..5,
    )
        .prop_map(|(source, target, branch, batchable, source_enabled, frequency, channel)| {
            let mut s = subscription(&source, &target, &branch);
            s.channel_id = ChannelId(channel);
            s.source_enabled = source_enabled;
            s.policy.batchable = batchable;
            s.policy.update_frequency = frequency;
            s
        })
}

pub fn arb_dependency() -> impl Strategy<Value = DependencyDetail> {
    (
        "[A-Z][A-Za-z.]{0,10}",
        "[0-9]\\.[0-9]\\.[0-9]{1,2}",
        arb_repo(),
        "[0-9a-f]{8}",
        any::<bool>(),
        any::<bool>(),
    )
        .prop_map(|(name, version, repo, commit, pinned, toolset)| {
            let mut d = DependencyDetail::new(name, version, repo, commit);
            d.pinned = pinned;
            if toolset {
                d.dependency_type = DependencyType::Toolset;
            }
            d
        })
}

// ─── FakeRemote ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct RemoteState {
    next_pr: u64,
    pull_requests: BTreeMap<String, PullRequestInfo>,
    created: Vec<(String, PullRequestContent)>,
    merged: Vec<String>,
    comments: HashMap<String, Vec<String>>,
    checks: HashMap<String, Vec<Check>>,
    reviews: HashMap<String, Vec<Review>>,
    merge_statuses: HashMap<String, Vec<MergePolicyEvaluationResult>>,
    dependencies: HashMap<(String, String), Vec<DependencyDetail>>,
    manifests: HashMap<(String, String), SourceManifest>,
    source_dependencies: HashMap<(String, String), SourceDependency>,
    latest_commits: HashMap<(String, String), String>,
    commits: HashMap<(String, String), Vec<(Vec<DependencyDetail>, String)>>,
    branches_created: Vec<(String, String)>,
    deleted_branches: Vec<(String, String)>,
    deleted_pr_branches: Vec<String>,
    fail_comments: bool,
    fail_merges: bool,
    fail_pr_creation: bool,
}

/// In-memory pull request host and repository content. Clones share state.
#[derive(Clone, Default)]
pub struct FakeRemote {
    state: Arc<Mutex<RemoteState>>,
}

fn key(a: &str, b: &str) -> (String, String) {
    (a.to_string(), b.to_string())
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut RemoteState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_checks(&self, url: &str, checks: Vec<Check>) {
        self.with(|s| s.checks.insert(url.to_string(), checks));
    }

    pub fn set_reviews(&self, url: &str, reviews: Vec<Review>) {
        self.with(|s| s.reviews.insert(url.to_string(), reviews));
    }

    pub fn set_source_manifest(&self, repo: &str, branch: &str, manifest: SourceManifest) {
        self.with(|s| s.manifests.insert(key(repo, branch), manifest));
    }

    pub fn set_source_dependency(&self, repo: &str, branch: &str, dependency: SourceDependency) {
        self.with(|s| s.source_dependencies.insert(key(repo, branch), dependency));
    }

    pub fn set_dependencies(&self, repo: &str, branch_or_commit: &str, deps: Vec<DependencyDetail>) {
        self.with(|s| s.dependencies.insert(key(repo, branch_or_commit), deps));
    }

    pub fn set_pull_request_status(&self, url: &str, status: PrStatus) {
        self.with(|s| {
            if let Some(pr) = s.pull_requests.get_mut(url) {
                pr.status = status;
            }
        });
    }

    pub fn set_pull_request_head(&self, url: &str, sha: &str) {
        self.with(|s| {
            if let Some(pr) = s.pull_requests.get_mut(url) {
                pr.head_sha = sha.to_string();
            }
        });
    }

    pub fn set_latest_commit(&self, repo: &str, branch: &str, sha: &str) {
        self.with(|s| s.latest_commits.insert(key(repo, branch), sha.to_string()));
    }

    pub fn fail_comments(&self, fail: bool) {
        self.with(|s| s.fail_comments = fail);
    }

    pub fn fail_merges(&self, fail: bool) {
        self.with(|s| s.fail_merges = fail);
    }

    pub fn fail_pull_request_creation(&self, fail: bool) {
        self.with(|s| s.fail_pr_creation = fail);
    }

    pub fn comments(&self, url: &str) -> Vec<String> {
        self.with(|s| s.comments.get(url).cloned().unwrap_or_default())
    }

    pub fn created_pull_requests(&self) -> Vec<(String, PullRequestContent)> {
        self.with(|s| s.created.clone())
    }

    pub fn pull_request(&self, url: &str) -> Option<PullRequestInfo> {
        self.with(|s| s.pull_requests.get(url).cloned())
    }

    pub fn commits(&self, repo: &str, branch: &str) -> Vec<(Vec<DependencyDetail>, String)> {
        self.with(|s| s.commits.get(&key(repo, branch)).cloned().unwrap_or_default())
    }

    pub fn merged_pull_requests(&self) -> Vec<String> {
        self.with(|s| s.merged.clone())
    }

    pub fn merge_statuses(&self, url: &str) -> Vec<MergePolicyEvaluationResult> {
        self.with(|s| s.merge_statuses.get(url).cloned().unwrap_or_default())
    }

    pub fn branches_created(&self) -> Vec<(String, String)> {
        self.with(|s| s.branches_created.clone())
    }

    pub fn deleted_branches(&self) -> Vec<(String, String)> {
        self.with(|s| s.deleted_branches.clone())
    }

    pub fn deleted_pull_request_branches(&self) -> Vec<String> {
        self.with(|s| s.deleted_pr_branches.clone())
    }
}

fn api_url(repo: &str, number: u64) -> String {
    let path = repo.trim_start_matches("https://github.com/");
    format!("https://api.github.com/repos/{path}/pulls/{number}")
}

#[async_trait]
impl PullRequestHost for FakeRemote {
    async fn create_pull_request(&self, repo: &str, content: &PullRequestContent) -> Result<String> {
        self.with(|s| {
            if s.fail_pr_creation {
                return Err(RemoteError::permanent("pull request creation rejected"));
            }
            s.next_pr += 1;
            let url = api_url(repo, s.next_pr);
            s.created.push((repo.to_string(), content.clone()));
            s.pull_requests.insert(
                url.clone(),
                PullRequestInfo {
                    url: url.clone(),
                    status: PrStatus::Open,
                    head_branch: content.head_branch.clone(),
                    base_branch: content.base_branch.clone(),
                    head_sha: format!("head-{}", s.next_pr),
                    title: content.title.clone(),
                    description: content.description.clone(),
                    updated_at: Utc::now(),
                },
            );
            Ok(url)
        })
    }

    async fn update_pull_request(&self, url: &str, title: &str, description: &str) -> Result<()> {
        self.with(|s| match s.pull_requests.get_mut(url) {
            Some(pr) => {
                pr.title = title.to_string();
                pr.description = description.to_string();
                pr.updated_at = Utc::now();
                Ok(())
            }
            None => Err(RemoteError::not_found(format!("no pull request {url}"))),
        })
    }

    async fn get_pull_request(&self, url: &str) -> Result<PullRequestInfo> {
        self.pull_request(url)
            .ok_or_else(|| RemoteError::not_found(format!("no pull request {url}")).with_status(404))
    }

    async fn merge_pull_request(&self, url: &str, _parameters: &MergeParameters, _message: &str) -> Result<()> {
        self.with(|s| {
            if s.fail_merges {
                return Err(RemoteError::from_status(405, "Pull Request is not mergeable"));
            }
            match s.pull_requests.get_mut(url) {
                Some(pr) => {
                    pr.status = PrStatus::Merged;
                    s.merged.push(url.to_string());
                    Ok(())
                }
                None => Err(RemoteError::not_found(format!("no pull request {url}"))),
            }
        })
    }

    async fn create_or_update_merge_status(&self, url: &str, results: &[MergePolicyEvaluationResult]) -> Result<()> {
        self.with(|s| s.merge_statuses.insert(url.to_string(), results.to_vec()));
        Ok(())
    }

    async fn get_latest_commit(&self, repo: &str, branch: &str) -> Result<Option<String>> {
        Ok(self.with(|s| s.latest_commits.get(&key(repo, branch)).cloned()))
    }

    async fn comment_pull_request(&self, url: &str, body: &str) -> Result<()> {
        self.with(|s| {
            if s.fail_comments {
                return Err(RemoteError::transient("comment service unavailable"));
            }
            s.comments.entry(url.to_string()).or_default().push(body.to_string());
            Ok(())
        })
    }

    async fn get_pull_request_comments(&self, url: &str) -> Result<Vec<String>> {
        Ok(self.comments(url))
    }

    async fn get_pull_request_checks(&self, url: &str) -> Result<Vec<Check>> {
        Ok(self.with(|s| s.checks.get(url).cloned().unwrap_or_default()))
    }

    async fn get_pull_request_reviews(&self, url: &str) -> Result<Vec<Review>> {
        Ok(self.with(|s| s.reviews.get(url).cloned().unwrap_or_default()))
    }

    async fn delete_branch(&self, repo: &str, branch: &str) -> Result<()> {
        self.with(|s| s.deleted_branches.push(key(repo, branch)));
        Ok(())
    }

    async fn delete_pull_request_branch(&self, url: &str) -> Result<()> {
        self.with(|s| s.deleted_pr_branches.push(url.to_string()));
        Ok(())
    }
}

#[async_trait]
impl RepositoryContent for FakeRemote {
    async fn get_dependencies(&self, repo: &str, branch_or_commit: &str, name: Option<&str>) -> Result<Vec<DependencyDetail>> {
        let deps = self.with(|s| s.dependencies.get(&key(repo, branch_or_commit)).cloned().unwrap_or_default());
        Ok(match name {
            Some(name) => deps.into_iter().filter(|d| d.name.eq_ignore_ascii_case(name)).collect(),
            None => deps,
        })
    }

    async fn create_new_branch(&self, repo: &str, _base_branch: &str, new_branch: &str) -> Result<()> {
        self.with(|s| s.branches_created.push(key(repo, new_branch)));
        Ok(())
    }

    async fn commit_updates(&self, repo: &str, branch: &str, updates: &[DependencyDetail], message: &str) -> Result<()> {
        self.with(|s| {
            s.commits
                .entry(key(repo, branch))
                .or_default()
                .push((updates.to_vec(), message.to_string()))
        });
        Ok(())
    }

    async fn get_source_dependency(&self, repo: &str, branch: &str) -> Result<Option<SourceDependency>> {
        Ok(self.with(|s| s.source_dependencies.get(&key(repo, branch)).cloned()))
    }

    async fn get_source_manifest(&self, repo: &str, branch: &str) -> Result<SourceManifest> {
        self.with(|s| s.manifests.get(&key(repo, branch)).cloned())
            .ok_or_else(|| RemoteError::not_found(format!("no source manifest in {repo}@{branch}")))
    }
}

/// Hands the same remote out for every repository.
pub struct FakeRemoteFactory {
    remote: Arc<dyn Remote>,
}

impl FakeRemoteFactory {
    pub fn single(remote: FakeRemote) -> Arc<dyn RemoteFactory> {
        Arc::new(FakeRemoteFactory { remote: Arc::new(remote) })
    }
}

impl RemoteFactory for FakeRemoteFactory {
    fn remote_for(&self, _repo: &str) -> Result<Arc<dyn Remote>> {
        Ok(Arc::clone(&self.remote))
    }
}

// ─── FakeRegistry ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct RegistryState {
    builds: BTreeMap<BuildId, Build>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    default_channels: HashMap<(String, String), Vec<ChannelId>>,
    merge_policies: HashMap<(String, String), Vec<MergePolicyDefinition>>,
}

/// In-memory asset registry. Clones share state.
#[derive(Clone, Default)]
pub struct FakeRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a subscription.
    pub fn add_subscription(&self, subscription: Subscription) {
        self.state.lock().unwrap().subscriptions.insert(subscription.id, subscription);
    }

    pub fn remove_subscription(&self, id: SubscriptionId) {
        self.state.lock().unwrap().subscriptions.remove(&id);
    }

    pub fn add_build(&self, build: Build) {
        self.state.lock().unwrap().builds.insert(build.id, build);
    }

    pub fn set_default_channels(&self, repo: &str, branch: &str, channels: Vec<ChannelId>) {
        self.state.lock().unwrap().default_channels.insert(key(repo, branch), channels);
    }

    pub fn set_repository_merge_policies(&self, repo: &str, branch: &str, policies: Vec<MergePolicyDefinition>) {
        self.state.lock().unwrap().merge_policies.insert(key(repo, branch), policies);
    }

    pub fn last_applied_build(&self, id: SubscriptionId) -> Option<BuildId> {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .get(&id)
            .and_then(|s| s.last_applied_build_id)
    }
}

#[async_trait]
impl AssetRegistry for FakeRegistry {
    async fn get_build(&self, id: BuildId) -> Result<Option<Build>> {
        Ok(self.state.lock().unwrap().builds.get(&id).cloned())
    }

    async fn get_subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        Ok(self.state.lock().unwrap().subscriptions.get(&id).cloned())
    }

    async fn get_subscriptions(&self, query: &SubscriptionQuery) -> Result<Vec<Subscription>> {
        let state = self.state.lock().unwrap();
        let mut found: Vec<Subscription> = state.subscriptions.values().filter(|s| query.matches(s)).cloned().collect();
        found.sort_by_key(|s| s.id);
        Ok(found)
    }

    async fn update_last_applied_build(&self, subscription: SubscriptionId, build: BuildId) -> Result<()> {
        match self.state.lock().unwrap().subscriptions.get_mut(&subscription) {
            Some(s) => {
                s.last_applied_build_id = Some(build);
                Ok(())
            }
            None => Err(RemoteError::not_found(format!("no subscription {subscription}"))),
        }
    }

    async fn get_latest_build(&self, repo: &str, channel: ChannelId) -> Result<Option<Build>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .builds
            .values()
            .filter(|b| b.repository().eq_ignore_ascii_case(repo) && b.channels.contains(&channel))
            .max_by_key(|b| (b.date_produced, b.id))
            .cloned())
    }

    async fn get_default_channels(&self, repo: &str, branch: &str) -> Result<Vec<ChannelId>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .default_channels
            .get(&key(repo, branch))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_repository_merge_policies(&self, repo: &str, branch: &str) -> Result<Vec<MergePolicyDefinition>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .merge_policies
            .get(&key(repo, branch))
            .cloned()
            .unwrap_or_default())
    }
}

// ─── FakeFlower ───────────────────────────────────────────────────────────────

/// What the next flow reports.
#[derive(Clone, Default)]
pub enum FlowOutcome {
    #[default]
    Changes,
    NoChanges,
    ChangesWithConflicts(Vec<String>),
    Fail(fn() -> CodeFlowError),
}

#[derive(Debug, Clone)]
pub struct FlowCall {
    pub subscription_id: SubscriptionId,
    pub build_id: BuildId,
    pub head_branch: String,
    pub is_new_branch: bool,
    pub forward: bool,
}

#[derive(Default)]
struct FlowerState {
    outcome: FlowOutcome,
    calls: Vec<FlowCall>,
}

/// A code flower that makes no commits, only reports.
#[derive(Clone)]
pub struct FakeFlower {
    vmr_path: PathBuf,
    product_path: PathBuf,
    state: Arc<Mutex<FlowerState>>,
}

impl Default for FakeFlower {
    fn default() -> Self {
        FakeFlower {
            vmr_path: PathBuf::from("/fake/vmr"),
            product_path: PathBuf::from("/fake/product"),
            state: Arc::default(),
        }
    }
}

impl FakeFlower {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_outcome(&self, outcome: FlowOutcome) {
        self.state.lock().unwrap().outcome = outcome;
    }

    pub fn calls(&self) -> Vec<FlowCall> {
        self.state.lock().unwrap().calls.clone()
    }

    fn flow(
        &self,
        subscription: &Subscription,
        build: &Build,
        head_branch: &str,
        is_new_branch: bool,
        forward: bool,
    ) -> crate::codeflow::Result<CodeFlowResult> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(FlowCall {
            subscription_id: subscription.id,
            build_id: build.id,
            head_branch: head_branch.to_string(),
            is_new_branch,
            forward,
        });
        let repo_path = if forward { &self.vmr_path } else { &self.product_path };
        let changed = CodeFlowResult {
            had_updates: true,
            ..CodeFlowResult::no_updates(repo_path)
        };
        match &state.outcome {
            FlowOutcome::Changes => Ok(changed),
            FlowOutcome::NoChanges => Ok(CodeFlowResult::no_updates(repo_path)),
            FlowOutcome::ChangesWithConflicts(files) => Ok(CodeFlowResult {
                conflicted_files: files.clone(),
                ..changed
            }),
            FlowOutcome::Fail(make) => Err(make()),
        }
    }
}

#[async_trait]
impl CodeFlower for FakeFlower {
    async fn flow_forward(
        &self,
        subscription: &Subscription,
        build: &Build,
        head_branch: &str,
        is_new_branch: bool,
        _cancel: &CancellationToken,
    ) -> crate::codeflow::Result<CodeFlowResult> {
        self.flow(subscription, build, head_branch, is_new_branch, true)
    }

    async fn flow_back(
        &self,
        subscription: &Subscription,
        build: &Build,
        head_branch: &str,
        is_new_branch: bool,
        _cancel: &CancellationToken,
    ) -> crate::codeflow::Result<CodeFlowResult> {
        self.flow(subscription, build, head_branch, is_new_branch, false)
    }

    fn vmr_path(&self) -> &Path {
        &self.vmr_path
    }
}

// ─── FakeGit ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct GitState {
    outputs: Vec<(String, GitOutput)>,
    pushes: Vec<(PathBuf, String, String)>,
    invocations: Vec<String>,
}

/// Records pushes; `execute` answers from canned outputs keyed by the
/// leading arguments, and succeeds silently otherwise.
#[derive(Clone, Default)]
pub struct FakeGit {
    state: Arc<Mutex<GitState>>,
}

impl FakeGit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers invocations whose space-joined arguments start with `prefix`.
    pub fn set_output(&self, prefix: &str, exit_code: i32, stdout: &str) {
        self.state.lock().unwrap().outputs.push((
            prefix.to_string(),
            GitOutput {
                exit_code,
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        ));
    }

    pub fn pushes(&self) -> Vec<(PathBuf, String, String)> {
        self.state.lock().unwrap().pushes.clone()
    }

    pub fn invocations(&self) -> Vec<String> {
        self.state.lock().unwrap().invocations.clone()
    }
}

#[async_trait]
impl Git for FakeGit {
    async fn execute(&self, _repo: &Path, args: &[&str]) -> GitResult<GitOutput> {
        let joined = args.join(" ");
        let mut state = self.state.lock().unwrap();
        state.invocations.push(joined.clone());
        Ok(state
            .outputs
            .iter()
            .rev()
            .find(|(prefix, _)| joined.starts_with(prefix.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default())
    }

    async fn push(&self, repo: &Path, branch: &str, remote_uri: &str) -> GitResult<()> {
        self.state
            .lock()
            .unwrap()
            .pushes
            .push((repo.to_path_buf(), branch.to_string(), remote_uri.to_string()));
        Ok(())
    }
}

// ─── RecordingQueue ───────────────────────────────────────────────────────────

/// A work queue that only remembers what was enqueued.
#[derive(Clone, Default)]
pub struct RecordingQueue {
    items: Arc<Mutex<Vec<crate::worker::WorkItem>>>,
}

impl RecordingQueue {
    pub fn items(&self) -> Vec<crate::worker::WorkItem> {
        self.items.lock().unwrap().clone()
    }
}

#[async_trait]
impl crate::worker::WorkQueue for RecordingQueue {
    async fn enqueue(&self, item: crate::worker::WorkItem) -> std::result::Result<(), crate::worker::DispatchError> {
        self.items.lock().unwrap().push(item);
        Ok(())
    }
}
