//! Newtype wrappers for domain identifiers.
//!
//! These keep subscription ids, build ids and channel ids from being mixed up,
//! and give the updater identity a single canonical string form that the
//! cache and reminder keys are derived from.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The identity of a subscription (a configured source -> target flow).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new_random() -> Self {
        SubscriptionId(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SubscriptionId {
    fn from(id: Uuid) -> Self {
        SubscriptionId(id)
    }
}

/// A build record id in the asset registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildId(pub u64);

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for BuildId {
    fn from(n: u64) -> Self {
        BuildId(n)
    }
}

/// A channel id in the asset registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A git commit SHA.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sha(pub String);

impl Sha {
    /// Creates a new Sha from a string.
    ///
    /// Note: This does not validate the format.
    pub fn new(s: impl Into<String>) -> Self {
        Sha(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short (7-character) version of the SHA for display.
    pub fn short(&self) -> &str {
        self.prefix(7)
    }

    /// Returns at most `len` leading characters, without panicking on odd input.
    pub fn prefix(&self, len: usize) -> &str {
        self.0.get(..len).unwrap_or(&self.0)
    }
}

impl fmt::Display for Sha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Sha {
    fn from(s: String) -> Self {
        Sha(s)
    }
}

impl From<&str> for Sha {
    fn from(s: &str) -> Self {
        Sha(s.to_string())
    }
}

/// Identifies one updater actor.
///
/// Batchable subscriptions that target the same repository and branch share a
/// single batched updater (and therefore a single pull request). Every other
/// subscription gets its own updater. The identity is always derived from a
/// subscription and never stored on its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdaterId {
    Batched { repository: String, branch: String },
    NonBatched { subscription_id: SubscriptionId },
}

impl UpdaterId {
    pub fn batched(repository: impl Into<String>, branch: impl Into<String>) -> Self {
        UpdaterId::Batched {
            repository: repository.into(),
            branch: branch.into(),
        }
    }

    pub fn non_batched(subscription_id: SubscriptionId) -> Self {
        UpdaterId::NonBatched { subscription_id }
    }

    pub fn is_batched(&self) -> bool {
        matches!(self, UpdaterId::Batched { .. })
    }

    /// Parses the string form produced by `Display`.
    ///
    /// A bare UUID is a non-batched id; anything else must be `repo:branch`,
    /// split on the last `:` (repository URLs contain `:` themselves).
    pub fn parse(s: &str) -> Option<Self> {
        if let Ok(id) = Uuid::parse_str(s) {
            return Some(UpdaterId::non_batched(SubscriptionId(id)));
        }
        let (repository, branch) = s.rsplit_once(':')?;
        if repository.is_empty() || branch.is_empty() {
            return None;
        }
        Some(UpdaterId::batched(repository, branch))
    }
}

impl fmt::Display for UpdaterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdaterId::Batched { repository, branch } => write!(f, "{repository}:{branch}"),
            UpdaterId::NonBatched { subscription_id } => write!(f, "{subscription_id}"),
        }
    }
}
