//! An [`AssetRegistry`] kept in the durable key/value store.
//!
//! Builds, subscriptions and per-branch repository settings are written by
//! whatever feeds the service (an import job, an operator, tests) and read
//! back by the updaters. Keys follow the cache convention:
//! `Build_{id}`, `Subscription_{id}`, `RepositoryBranch_{repo}@{branch}`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AssetRegistry, RemoteError, Result, SubscriptionQuery};
use crate::store::{CacheEntry, KeyValueStore, StateCache, StoreError};
use crate::types::{Build, BuildId, ChannelId, MergePolicyDefinition, Subscription, SubscriptionId};

/// Settings that apply to every subscription targeting one branch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepositoryBranchSettings {
    #[serde(default)]
    pub default_channels: Vec<ChannelId>,
    #[serde(default)]
    pub merge_policies: Vec<MergePolicyDefinition>,
}

impl CacheEntry for RepositoryBranchSettings {
    const TYPE_NAME: &'static str = "RepositoryBranch";
}

fn store_error(e: StoreError) -> RemoteError {
    RemoteError::permanent(format!("registry store: {e}")).with_source(e)
}

/// Repository URLs compare case-insensitively, so the key is lowercased.
fn branch_entity(repo: &str, branch: &str) -> String {
    format!("{}@{branch}", repo.to_ascii_lowercase())
}

pub struct StoredRegistry {
    store: Arc<dyn KeyValueStore>,
}

impl StoredRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        StoredRegistry { store }
    }

    fn build_cache(&self, id: BuildId) -> StateCache<Build> {
        StateCache::new(Arc::clone(&self.store), &id.0.to_string())
    }

    fn subscription_cache(&self, id: SubscriptionId) -> StateCache<Subscription> {
        StateCache::new(Arc::clone(&self.store), &id.0.to_string())
    }

    fn branch_cache(&self, repo: &str, branch: &str) -> StateCache<RepositoryBranchSettings> {
        StateCache::new(Arc::clone(&self.store), &branch_entity(repo, branch))
    }

    pub async fn put_build(&self, build: &Build) -> Result<()> {
        self.build_cache(build.id).set(build).await.map_err(store_error)
    }

    pub async fn put_subscription(&self, subscription: &Subscription) -> Result<()> {
        self.subscription_cache(subscription.id)
            .set(subscription)
            .await
            .map_err(store_error)
    }

    pub async fn put_branch_settings(&self, repo: &str, branch: &str, settings: &RepositoryBranchSettings) -> Result<()> {
        self.branch_cache(repo, branch).set(settings).await.map_err(store_error)
    }

    /// Every stored `T`. Entries that vanish or fail to decode mid-scan are
    /// skipped.
    async fn scan<T: CacheEntry>(&self) -> Result<Vec<T>> {
        let prefix = StateCache::<T>::key_for("");
        let keys = self.store.keys_with_prefix(&prefix).await.map_err(store_error)?;
        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(value) = self.store.get(&key).await.map_err(store_error)? else {
                continue;
            };
            match serde_json::from_value(value) {
                Ok(entry) => found.push(entry),
                Err(e) => debug!(key = %key, error = %e, "Skipping undecodable registry entry"),
            }
        }
        Ok(found)
    }

    async fn branch_settings(&self, repo: &str, branch: &str) -> Result<RepositoryBranchSettings> {
        Ok(self
            .branch_cache(repo, branch)
            .get()
            .await
            .map_err(store_error)?
            .unwrap_or_default())
    }
}

#[async_trait]
impl AssetRegistry for StoredRegistry {
    async fn get_build(&self, id: BuildId) -> Result<Option<Build>> {
        self.build_cache(id).get().await.map_err(store_error)
    }

    async fn get_subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        self.subscription_cache(id).get().await.map_err(store_error)
    }

    async fn get_subscriptions(&self, query: &SubscriptionQuery) -> Result<Vec<Subscription>> {
        let mut found: Vec<Subscription> = self
            .scan::<Subscription>()
            .await?
            .into_iter()
            .filter(|s| query.matches(s))
            .collect();
        found.sort_by_key(|s| s.id);
        Ok(found)
    }

    async fn update_last_applied_build(&self, subscription: SubscriptionId, build: BuildId) -> Result<()> {
        let cache = self.subscription_cache(subscription);
        let mut stored = cache
            .get()
            .await
            .map_err(store_error)?
            .ok_or_else(|| RemoteError::not_found(format!("no subscription {subscription}")))?;
        stored.last_applied_build_id = Some(build);
        cache.set(&stored).await.map_err(store_error)
    }

    async fn get_latest_build(&self, repo: &str, channel: ChannelId) -> Result<Option<Build>> {
        Ok(self
            .scan::<Build>()
            .await?
            .into_iter()
            .filter(|b| b.repository().eq_ignore_ascii_case(repo) && b.channels.contains(&channel))
            .max_by_key(|b| (b.date_produced, b.id)))
    }

    async fn get_default_channels(&self, repo: &str, branch: &str) -> Result<Vec<ChannelId>> {
        Ok(self.branch_settings(repo, branch).await?.default_channels)
    }

    async fn get_repository_merge_policies(&self, repo: &str, branch: &str) -> Result<Vec<MergePolicyDefinition>> {
        Ok(self.branch_settings(repo, branch).await?.merge_policies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::test_utils::{build, subscription};
    use chrono::Duration;

    fn registry() -> StoredRegistry {
        StoredRegistry::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn builds_and_subscriptions_round_trip() {
        let registry = registry();
        let b = build(12, "https://github.com/dotnet/runtime", "abc");
        let s = subscription("https://github.com/dotnet/runtime", "https://github.com/dotnet/sdk", "main");
        registry.put_build(&b).await.unwrap();
        registry.put_subscription(&s).await.unwrap();

        assert_eq!(registry.get_build(BuildId(12)).await.unwrap(), Some(b));
        assert_eq!(registry.get_subscription(s.id).await.unwrap(), Some(s));
        assert_eq!(registry.get_build(BuildId(13)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn subscriptions_are_filtered_by_query() {
        let registry = registry();
        let a = subscription("https://github.com/dotnet/runtime", "https://github.com/dotnet/sdk", "main");
        let mut b = subscription("https://github.com/dotnet/arcade", "https://github.com/dotnet/sdk", "main");
        b.enabled = false;
        registry.put_subscription(&a).await.unwrap();
        registry.put_subscription(&b).await.unwrap();

        let all = registry.get_subscriptions(&SubscriptionQuery::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        let enabled = registry
            .get_subscriptions(&SubscriptionQuery {
                enabled: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(enabled, vec![a]);
    }

    #[tokio::test]
    async fn last_applied_build_is_persisted() {
        let registry = registry();
        let s = subscription("https://github.com/dotnet/runtime", "https://github.com/dotnet/sdk", "main");
        registry.put_subscription(&s).await.unwrap();

        registry.update_last_applied_build(s.id, BuildId(5)).await.unwrap();
        let stored = registry.get_subscription(s.id).await.unwrap().unwrap();
        assert_eq!(stored.last_applied_build_id, Some(BuildId(5)));

        let missing = registry
            .update_last_applied_build(SubscriptionId::new_random(), BuildId(5))
            .await
            .unwrap_err();
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn latest_build_is_newest_on_channel() {
        let registry = registry();
        let repo = "https://github.com/dotnet/runtime";
        let mut older = build(1, repo, "aaa");
        older.channels = vec![ChannelId(3)];
        let mut newer = build(2, repo, "bbb");
        newer.channels = vec![ChannelId(3)];
        newer.date_produced = older.date_produced + Duration::hours(1);
        let mut other_channel = build(3, repo, "ccc");
        other_channel.channels = vec![ChannelId(4)];
        other_channel.date_produced = older.date_produced + Duration::hours(2);
        for b in [&older, &newer, &other_channel] {
            registry.put_build(b).await.unwrap();
        }

        let latest = registry
            .get_latest_build("https://github.com/DOTNET/runtime", ChannelId(3))
            .await
            .unwrap();
        assert_eq!(latest.map(|b| b.id), Some(BuildId(2)));
        assert_eq!(registry.get_latest_build(repo, ChannelId(9)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn branch_settings_default_to_empty() {
        let registry = registry();
        let repo = "https://github.com/dotnet/sdk";
        assert!(registry.get_default_channels(repo, "main").await.unwrap().is_empty());

        let settings = RepositoryBranchSettings {
            default_channels: vec![ChannelId(7)],
            merge_policies: Vec::new(),
        };
        registry.put_branch_settings(repo, "main", &settings).await.unwrap();
        assert_eq!(
            registry.get_default_channels("https://github.com/dotnet/SDK", "main").await.unwrap(),
            vec![ChannelId(7)]
        );
        assert!(registry.get_repository_merge_policies(repo, "main").await.unwrap().is_empty());
        assert!(registry.get_default_channels(repo, "release").await.unwrap().is_empty());
    }
}
