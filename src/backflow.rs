//! How far each backflow subscription lags behind a VMR build.
//!
//! For a VMR build, every source-enabled subscription sourcing from the VMR
//! on the build's branch is looked up, its last backflowed VMR commit read
//! from the target repository, and the distance counted with
//! `git rev-list --count` in the local VMR clone, which is fetched first.
//! The result is cached for the inspection server; nothing else depends on
//! it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::git::{self, Git, GitError};
use crate::remote::{AssetRegistry, RemoteError, RemoteFactory, SubscriptionQuery};
use crate::store::{KeyValueStore, StateCache, StoreError};
use crate::types::{Build, BuildId, ChannelId, Subscription, SubscriptionId};

const INTERNAL_BRANCH_PREFIX: &str = "internal/";

/// How long a computed status stays cached.
pub const BACKFLOW_STATUS_TTL_DAYS: i64 = 60;

#[derive(Debug, Error)]
pub enum BackflowError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, BackflowError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionBackflowStatus {
    pub subscription_id: SubscriptionId,
    pub target_repository: String,
    pub target_branch: String,
    pub last_backflowed_sha: String,
    pub commit_distance: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchBackflowStatus {
    pub branch: String,
    /// `None` when the VMR has no default channel for the branch.
    pub default_channel_id: Option<ChannelId>,
    pub subscription_statuses: Vec<SubscriptionBackflowStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackflowStatus {
    pub vmr_commit_sha: String,
    pub computation_timestamp: DateTime<Utc>,
    pub branch_statuses: BTreeMap<String, BranchBackflowStatus>,
}

impl BackflowStatus {
    /// The cache handle for the status of VMR commit `sha`.
    pub fn cache(store: Arc<dyn KeyValueStore>, sha: &str) -> StateCache<BackflowStatus> {
        StateCache::new(store, sha)
    }
}

/// The branches a build of `branch` is evaluated for.
pub fn branches_for(branch: &str) -> Vec<String> {
    match branch.strip_prefix(INTERNAL_BRANCH_PREFIX) {
        Some(public) if !public.is_empty() => vec![branch.to_string(), public.to_string()],
        _ => vec![branch.to_string()],
    }
}

pub struct BackflowStatusCalculator {
    registry: Arc<dyn AssetRegistry>,
    remotes: Arc<dyn RemoteFactory>,
    git: Arc<dyn Git>,
    store: Arc<dyn KeyValueStore>,
    vmr_path: PathBuf,
}

impl BackflowStatusCalculator {
    pub fn new(
        registry: Arc<dyn AssetRegistry>,
        remotes: Arc<dyn RemoteFactory>,
        git: Arc<dyn Git>,
        store: Arc<dyn KeyValueStore>,
        vmr_path: impl Into<PathBuf>,
    ) -> Self {
        BackflowStatusCalculator {
            registry,
            remotes,
            git,
            store,
            vmr_path: vmr_path.into(),
        }
    }

    /// Computes and caches the status for VMR build `vmr_build_id`.
    ///
    /// Returns false if the build does not exist.
    #[instrument(skip(self), fields(vmr_build_id = %vmr_build_id))]
    pub async fn calculate(&self, vmr_build_id: BuildId) -> Result<bool> {
        let Some(build) = self.registry.get_build(vmr_build_id).await? else {
            warn!("VMR build not found");
            return Ok(false);
        };

        debug!(vmr = %self.vmr_path.display(), commit = %build.commit, "Fetching VMR clone");
        git::fetch_origin(self.git.as_ref(), &self.vmr_path, build.commit.as_str()).await?;

        let branches = branches_for(build.branch());
        info!(commit = %build.commit, branches = ?branches, "Calculating backflow status");

        let mut branch_statuses = BTreeMap::new();
        for branch in branches {
            let status = self.branch_status(&build, &branch).await?;
            branch_statuses.insert(branch, status);
        }

        let status = BackflowStatus {
            vmr_commit_sha: build.commit.as_str().to_string(),
            computation_timestamp: Utc::now(),
            branch_statuses,
        };
        BackflowStatus::cache(Arc::clone(&self.store), build.commit.as_str())
            .set_with_ttl(&status, Some(Duration::days(BACKFLOW_STATUS_TTL_DAYS)))
            .await?;
        info!(commit = %build.commit, "Cached backflow status");
        Ok(true)
    }

    async fn branch_status(&self, build: &Build, branch: &str) -> Result<BranchBackflowStatus> {
        let vmr = build.repository();
        let channels = self.registry.get_default_channels(vmr, branch).await?;
        let Some(channel) = channels.first().copied() else {
            warn!(branch, "No default channel for VMR branch");
            return Ok(BranchBackflowStatus {
                branch: branch.to_string(),
                default_channel_id: None,
                subscription_statuses: Vec::new(),
            });
        };

        let query = SubscriptionQuery {
            source_repository: Some(vmr.to_string()),
            channel_id: Some(channel),
            source_enabled: Some(true),
            ..Default::default()
        };
        let subscriptions = self.registry.get_subscriptions(&query).await?;
        debug!(branch, count = subscriptions.len(), "Backflow subscriptions");

        let mut statuses = Vec::new();
        for subscription in &subscriptions {
            if let Some(status) = self.subscription_status(build, subscription).await? {
                statuses.push(status);
            }
        }

        Ok(BranchBackflowStatus {
            branch: branch.to_string(),
            default_channel_id: Some(channel),
            subscription_statuses: statuses,
        })
    }

    async fn subscription_status(
        &self,
        build: &Build,
        subscription: &Subscription,
    ) -> Result<Option<SubscriptionBackflowStatus>> {
        let source = match self.remotes.remote_for(&subscription.target_repository) {
            Ok(remote) => {
                remote
                    .get_source_dependency(&subscription.target_repository, &subscription.target_branch)
                    .await
            }
            Err(e) => Err(e),
        };
        let last_sha = match source {
            Ok(Some(dependency)) => dependency.sha,
            Ok(None) => {
                warn!(
                    subscription_id = %subscription.id,
                    target = %subscription.target_repository,
                    "No backflow recorded in target repository"
                );
                return Ok(None);
            }
            Err(e) => {
                warn!(subscription_id = %subscription.id, error = %e, "Could not read source dependency");
                return Ok(None);
            }
        };

        let distance = git::rev_list_count(self.git.as_ref(), &self.vmr_path, &last_sha, build.commit.as_str()).await?;
        debug!(subscription_id = %subscription.id, last_sha = %last_sha, distance, "Commit distance");

        Ok(Some(SubscriptionBackflowStatus {
            subscription_id: subscription.id,
            target_repository: subscription.target_repository.clone(),
            target_branch: subscription.target_branch.clone(),
            last_backflowed_sha: last_sha,
            commit_distance: distance,
        }))
    }
}
