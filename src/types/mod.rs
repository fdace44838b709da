//! Core domain types for the dependency flow service.
//!
//! Everything persisted in the durable store or exchanged with the remote
//! collaborators is defined here.

pub mod build;
pub mod dependency;
pub mod ids;
pub mod merge_policy;
pub mod pr;
pub mod subscription;

pub use build::{Asset, AzDoBuildInfo, Build};
pub use dependency::{
    DependencyDetail, DependencyType, DependencyUpdate, DependencyUpdateSummary, RepositoryRecord,
    SourceDependency, SourceManifest,
};
pub use ids::{BuildId, ChannelId, Sha, SubscriptionId, UpdaterId};
pub use merge_policy::{MergePolicyEvaluationResult, MergePolicyEvaluationResults, MergePolicyStatus};
pub use pr::{
    Check, CheckState, CodeFlowDirection, CodeFlowStatus, CoherencyErrorDetails,
    InProgressPullRequest, MergeState, PrStatus, PullRequestCheck, PullRequestContent,
    PullRequestInfo, Review, ReviewState, SubscriptionPullRequestUpdate, SubscriptionUpdateWorkItem,
};
pub use subscription::{
    MergePolicyDefinition, Subscription, SubscriptionPolicy, SubscriptionType, UpdateFrequency,
};
