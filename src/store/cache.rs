//! Typed access to cached entities.

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{KeyValueStore, Result};

/// A value that can live in the durable cache.
///
/// `TYPE_NAME` namespaces the key so two entity types stored for the same
/// updater never collide.
pub trait CacheEntry: Serialize + DeserializeOwned + Send + Sync {
    const TYPE_NAME: &'static str;
}

/// Handle to the single cached `T` belonging to one entity.
///
/// The key is `{TYPE_NAME}_{entity}`.
pub struct StateCache<T> {
    store: Arc<dyn KeyValueStore>,
    key: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for StateCache<T> {
    fn clone(&self) -> Self {
        StateCache {
            store: Arc::clone(&self.store),
            key: self.key.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: CacheEntry> StateCache<T> {
    pub fn new(store: Arc<dyn KeyValueStore>, entity: &str) -> Self {
        StateCache {
            store,
            key: Self::key_for(entity),
            _marker: PhantomData,
        }
    }

    pub fn key_for(entity: &str) -> String {
        format!("{}_{}", T::TYPE_NAME, entity)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn get(&self) -> Result<Option<T>> {
        match self.store.get(&self.key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn set(&self, value: &T) -> Result<()> {
        self.set_with_ttl(value, None).await
    }

    pub async fn set_with_ttl(&self, value: &T, ttl: Option<Duration>) -> Result<()> {
        let json = serde_json::to_value(value)?;
        self.store.set(&self.key, json, ttl).await
    }

    /// Removes the entry, returning what it held.
    pub async fn try_delete(&self) -> Result<Option<T>> {
        match self.store.delete(&self.key).await? {
            Some(value) => Ok(serde_json::from_value(value).ok()),
            None => Ok(None),
        }
    }
}

macro_rules! cache_entries {
    ($($ty:ty => $name:literal),* $(,)?) => {
        $(impl CacheEntry for $ty {
            const TYPE_NAME: &'static str = $name;
        })*
    };
}

cache_entries! {
    crate::types::InProgressPullRequest => "InProgressPullRequest",
    crate::types::CodeFlowStatus => "CodeFlowStatus",
    crate::types::SubscriptionUpdateWorkItem => "SubscriptionUpdateWorkItem",
    crate::types::PullRequestCheck => "PullRequestCheck",
    crate::types::MergePolicyEvaluationResults => "MergePolicyEvaluationResults",
    crate::backflow::BackflowStatus => "BackflowStatus",
    crate::types::Build => "Build",
    crate::types::Subscription => "Subscription",
}
