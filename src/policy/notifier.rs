//! Tags source-repository contacts when a PR's checks fail.
//!
//! Best effort: every failure is logged and swallowed, and a PR is tagged at
//! most once (tracked by `source_repo_notified`).

use std::sync::Arc;

use tracing::{info, warn};

use crate::remote::{AssetRegistry, Remote};
use crate::types::{CheckState, InProgressPullRequest};

pub struct PolicyFailureNotifier {
    registry: Arc<dyn AssetRegistry>,
}

/// Splits a `;`-separated tag list into `@handle`s.
pub fn parse_tags(tags: &str) -> Vec<String> {
    tags.split(';')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| {
            if t.starts_with('@') {
                t.to_string()
            } else {
                format!("@{t}")
            }
        })
        .collect()
}

impl PolicyFailureNotifier {
    pub fn new(registry: Arc<dyn AssetRegistry>) -> Self {
        PolicyFailureNotifier { registry }
    }

    pub async fn tag_source_repository_contacts(&self, remote: &dyn Remote, pr: &mut InProgressPullRequest) {
        if pr.source_repo_notified {
            return;
        }

        let checks = match remote.get_pull_request_checks(&pr.url).await {
            Ok(checks) => checks,
            Err(e) => {
                warn!(pr = %pr.url, error = %e, "Could not read checks; skipping failure notification");
                return;
            }
        };

        // Our own policy statuses stay red until the real checks go green.
        let real_failure = checks.iter().any(|c| {
            !c.is_merge_policy && matches!(c.status, CheckState::Failure | CheckState::Error)
        });
        if !real_failure {
            return;
        }

        let mut sections = Vec::new();
        for contained in &pr.contained_subscriptions {
            let subscription = match self.registry.get_subscription(contained.subscription_id).await {
                Ok(Some(s)) => s,
                Ok(None) => continue,
                Err(e) => {
                    warn!(subscription_id = %contained.subscription_id, error = %e, "Could not read subscription");
                    continue;
                }
            };
            let tags = subscription
                .pull_request_failure_notification_tags
                .as_deref()
                .map(parse_tags)
                .unwrap_or_default();
            if tags.is_empty() {
                continue;
            }
            sections.push(format!(
                "#### Notification for subscribed users from {}:\n\n{}",
                subscription.source_repository,
                tags.join(" ")
            ));
        }

        if sections.is_empty() {
            return;
        }

        let body = format!(
            "{}\n\nAction requested: Please take a look at this failing automated dependency-flow pull request.",
            sections.join("\n\n")
        );

        match remote.comment_pull_request(&pr.url, &body).await {
            Ok(()) => {
                info!(pr = %pr.url, "Tagged source repository contacts about failing checks");
                pr.source_repo_notified = true;
            }
            Err(e) => warn!(pr = %pr.url, error = %e, "Failed to tag source repository contacts"),
        }
    }
}
