//! Subscriptions: configured dependency flows from a source repository to a
//! target repository and branch.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::ids::{BuildId, ChannelId, SubscriptionId, UpdaterId};

/// How often a subscription is triggered outside of new-build events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateFrequency {
    #[default]
    None,
    EveryBuild,
    EveryDay,
    TwiceDaily,
    EveryWeek,
    EveryTwoWeeks,
    EveryMonth,
}

/// A named merge policy plus its free-form configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergePolicyDefinition {
    pub name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl MergePolicyDefinition {
    pub fn named(name: impl Into<String>) -> Self {
        MergePolicyDefinition {
            name: name.into(),
            properties: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SubscriptionPolicy {
    pub batchable: bool,
    pub update_frequency: UpdateFrequency,
    #[serde(default)]
    pub merge_policies: Vec<MergePolicyDefinition>,
}

/// Whether a subscription only bumps dependency versions or also flows sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionType {
    Dependencies,
    DependenciesAndSources,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub channel_id: ChannelId,
    pub source_repository: String,
    pub target_repository: String,
    pub target_branch: String,
    pub enabled: bool,
    #[serde(default)]
    pub source_enabled: bool,
    #[serde(default)]
    pub source_directory: Option<String>,
    #[serde(default)]
    pub target_directory: Option<String>,
    pub policy: SubscriptionPolicy,
    /// Asset-name globs (`*`, `?`) whose matching assets are never flowed.
    #[serde(default)]
    pub excluded_assets: Vec<String>,
    /// `;`-separated list of handles tagged when merge policies fail.
    #[serde(default)]
    pub pull_request_failure_notification_tags: Option<String>,
    #[serde(default)]
    pub last_applied_build_id: Option<BuildId>,
}

impl Subscription {
    /// The updater that owns this subscription's pull request.
    pub fn updater_id(&self) -> UpdaterId {
        if self.policy.batchable {
            UpdaterId::batched(&self.target_repository, &self.target_branch)
        } else {
            UpdaterId::non_batched(self.id)
        }
    }

    pub fn subscription_type(&self) -> SubscriptionType {
        if self.source_enabled {
            SubscriptionType::DependenciesAndSources
        } else {
            SubscriptionType::Dependencies
        }
    }

    /// Forward flow (repo -> VMR) is the direction with a target directory.
    pub fn is_forward_flow(&self) -> bool {
        self.target_directory.as_deref().is_some_and(|d| !d.is_empty())
    }

    pub fn is_backflow(&self) -> bool {
        self.source_directory.as_deref().is_some_and(|d| !d.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{arb_subscription, subscription};
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn batchable_subscriptions_on_same_target_share_updater(
            a in arb_subscription(),
            b in arb_subscription(),
        ) {
            let mut a = a;
            let mut b = b;
            a.policy.batchable = true;
            b.policy.batchable = true;
            b.target_repository = a.target_repository.clone();
            b.target_branch = a.target_branch.clone();
            prop_assert_eq!(a.updater_id(), b.updater_id());
        }

        #[test]
        fn non_batchable_subscription_gets_own_updater(s in arb_subscription()) {
            let mut s = s;
            s.policy.batchable = false;
            prop_assert_eq!(s.updater_id(), UpdaterId::non_batched(s.id));
        }
    }

    #[test]
    fn forward_flow_requires_target_directory() {
        let mut s = subscription("https://github.com/dotnet/runtime", "https://github.com/dotnet/dotnet", "main");
        assert!(!s.is_forward_flow());
        s.target_directory = Some(String::new());
        assert!(!s.is_forward_flow());
        s.target_directory = Some("runtime".into());
        assert!(s.is_forward_flow());
    }

    #[test]
    fn subscription_type_follows_source_enabled() {
        let mut s = subscription("https://github.com/a/b", "https://github.com/c/d", "main");
        assert_eq!(s.subscription_type(), SubscriptionType::Dependencies);
        s.source_enabled = true;
        assert_eq!(s.subscription_type(), SubscriptionType::DependenciesAndSources);
    }
}
