//! Subscription triggering: deciding which updater owns a subscription and
//! handing it the build to apply.

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::remote::{AssetRegistry, RemoteError, SubscriptionQuery};
use crate::types::{BuildId, SubscriptionId, UpdateFrequency};
use crate::worker::{DispatchError, SubscriptionTrigger, WorkItem, WorkQueue};

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

pub type Result<T> = std::result::Result<T, TriggerError>;

/// Enqueues `build_id` (or the latest build on the subscription's channel)
/// for the updater that owns the subscription.
///
/// Returns false when the subscription is missing or disabled, or when there
/// is no build to apply.
#[instrument(skip(registry, queue), fields(subscription_id = %subscription_id))]
pub async fn trigger_subscription(
    registry: &dyn AssetRegistry,
    queue: &dyn WorkQueue,
    subscription_id: SubscriptionId,
    build_id: Option<BuildId>,
    force: bool,
) -> Result<bool> {
    let Some(subscription) = registry.get_subscription(subscription_id).await? else {
        warn!("Subscription not found");
        return Ok(false);
    };
    if !subscription.enabled {
        info!("Subscription is disabled; not triggering");
        return Ok(false);
    }

    let build_id = match build_id {
        Some(id) => id,
        None => {
            let latest = registry
                .get_latest_build(&subscription.source_repository, subscription.channel_id)
                .await?;
            match latest {
                Some(build) => build.id,
                None => {
                    info!(channel = %subscription.channel_id, "No build on the subscription's channel");
                    return Ok(false);
                }
            }
        }
    };

    let trigger = SubscriptionTrigger {
        updater_id: subscription.updater_id(),
        subscription_id,
        subscription_type: subscription.subscription_type(),
        build_id,
        force,
    };
    debug!(updater = %trigger.updater_id, build_id = %build_id, "Enqueuing subscription trigger");
    queue.enqueue(WorkItem::SubscriptionTrigger(trigger)).await?;
    Ok(true)
}

/// A subscription whose channel has a build it has not applied yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSubscription {
    pub subscription_id: SubscriptionId,
    pub build_id: BuildId,
}

/// Enabled subscriptions updating at `frequency` that are behind their
/// channel's latest build.
#[instrument(skip(registry))]
pub async fn subscriptions_to_trigger(
    registry: &dyn AssetRegistry,
    frequency: UpdateFrequency,
) -> Result<Vec<PendingSubscription>> {
    let query = SubscriptionQuery {
        enabled: Some(true),
        update_frequency: Some(frequency),
        ..Default::default()
    };
    let mut pending = Vec::new();
    for subscription in registry.get_subscriptions(&query).await? {
        let latest = registry
            .get_latest_build(&subscription.source_repository, subscription.channel_id)
            .await?;
        let Some(latest) = latest else {
            continue;
        };
        if subscription.last_applied_build_id != Some(latest.id) {
            pending.push(PendingSubscription {
                subscription_id: subscription.id,
                build_id: latest.id,
            });
        }
    }
    debug!(count = pending.len(), "Subscriptions to trigger");
    Ok(pending)
}

/// Triggers every subscription [`subscriptions_to_trigger`] finds.
pub async fn trigger_due_subscriptions(
    registry: &dyn AssetRegistry,
    queue: &dyn WorkQueue,
    frequency: UpdateFrequency,
) -> Result<usize> {
    let mut triggered = 0;
    for pending in subscriptions_to_trigger(registry, frequency).await? {
        if trigger_subscription(registry, queue, pending.subscription_id, Some(pending.build_id), false).await? {
            triggered += 1;
        }
    }
    Ok(triggered)
}

/// Records that `build_id` reached the subscription's target branch.
pub async fn update_for_merged_pull_request(
    registry: &dyn AssetRegistry,
    subscription_id: SubscriptionId,
    build_id: BuildId,
) -> Result<()> {
    info!(subscription_id = %subscription_id, build_id = %build_id, "Advancing last applied build");
    registry.update_last_applied_build(subscription_id, build_id).await?;
    Ok(())
}
