//! [`PullRequestHost`] over the GitHub REST API.
//!
//! Every request goes through [`GitHubHost::send`], which classifies octocrab
//! failures and retries transient ones with the host's [`RetryConfig`].

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::client::{GitHubHost, PullRequestRef, RepoRef};
use super::error::from_octocrab;
use crate::remote::{
    MergeParameters, PullRequestHost, RemoteError, RemoteErrorKind, Result, RetryPolicy, retry_with_backoff,
};
use crate::types::{
    Check, CheckState, MergePolicyEvaluationResult, MergePolicyStatus, PrStatus, PullRequestContent,
    PullRequestInfo, Review, ReviewState,
};

/// Commit status context prefix for published merge policy results.
pub const MERGE_POLICY_CONTEXT_PREFIX: &str = "depflow/merge-policy/";

const PAGE_SIZE: u32 = 100;

/// GitHub rejects longer status descriptions.
const MAX_STATUS_DESCRIPTION: usize = 140;

// ─── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiRef {
    #[serde(rename = "ref")]
    ref_field: String,
    sha: String,
}

#[derive(Debug, Deserialize)]
struct ApiPull {
    number: u64,
    state: String,
    merged_at: Option<DateTime<Utc>>,
    head: ApiRef,
    base: ApiRef,
    title: String,
    body: Option<String>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct CreatePull<'a> {
    title: &'a str,
    body: &'a str,
    head: &'a str,
    base: &'a str,
}

#[derive(Debug, Serialize)]
struct UpdatePull<'a> {
    title: &'a str,
    body: &'a str,
}

#[derive(Debug, Serialize)]
struct MergeRequest<'a> {
    commit_title: &'a str,
    commit_message: &'a str,
    sha: &'a str,
    merge_method: &'static str,
}

#[derive(Debug, Deserialize)]
struct MergeResponse {
    merged: bool,
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct CommentRequest<'a> {
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiComment {
    body: Option<String>,
}

#[derive(Debug, Serialize)]
struct Page {
    per_page: u32,
    page: u32,
}

#[derive(Debug, Serialize)]
struct StatusRequest<'a> {
    state: &'static str,
    context: String,
    description: String,
    target_url: &'a str,
}

#[derive(Debug, Deserialize)]
struct CombinedStatus {
    statuses: Vec<ApiStatus>,
}

#[derive(Debug, Deserialize)]
struct ApiStatus {
    state: String,
    context: String,
    target_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CheckRuns {
    check_runs: Vec<ApiCheckRun>,
}

#[derive(Debug, Deserialize)]
struct ApiCheckRun {
    name: String,
    status: String,
    conclusion: Option<String>,
    html_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct ApiReview {
    state: String,
    user: Option<ApiUser>,
    submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ApiBranch {
    commit: ApiCommitRef,
}

#[derive(Debug, Deserialize)]
struct ApiCommitRef {
    sha: String,
}

// ─── Mapping ──────────────────────────────────────────────────────────────────

fn pull_status(pull: &ApiPull) -> PrStatus {
    if pull.merged_at.is_some() {
        PrStatus::Merged
    } else if pull.state == "closed" {
        PrStatus::Closed
    } else {
        PrStatus::Open
    }
}

fn commit_status_state(state: &str) -> CheckState {
    match state {
        "success" => CheckState::Success,
        "failure" => CheckState::Failure,
        "error" => CheckState::Error,
        "pending" => CheckState::Pending,
        _ => CheckState::None,
    }
}

fn check_run_state(status: &str, conclusion: Option<&str>) -> CheckState {
    if status != "completed" {
        return CheckState::Pending;
    }
    match conclusion {
        Some("success" | "neutral" | "skipped") => CheckState::Success,
        Some("failure" | "timed_out" | "action_required" | "cancelled") => CheckState::Failure,
        Some(_) => CheckState::Error,
        None => CheckState::None,
    }
}

fn review_state(state: &str) -> ReviewState {
    match state {
        "APPROVED" => ReviewState::Approved,
        "CHANGES_REQUESTED" => ReviewState::ChangesRequested,
        "PENDING" => ReviewState::Pending,
        // A dismissed review no longer blocks.
        _ => ReviewState::Commented,
    }
}

fn policy_status_state(status: MergePolicyStatus) -> &'static str {
    match status {
        MergePolicyStatus::DecisiveSuccess | MergePolicyStatus::TransientSuccess => "success",
        MergePolicyStatus::DecisiveFailure | MergePolicyStatus::TransientFailure => "failure",
        MergePolicyStatus::Pending => "pending",
    }
}

fn status_description(result: &MergePolicyEvaluationResult) -> String {
    let text = if result.title.is_empty() {
        &result.message
    } else {
        &result.title
    };
    text.chars().take(MAX_STATUS_DESCRIPTION).collect()
}

// ─── Host ─────────────────────────────────────────────────────────────────────

impl GitHubHost {
    pub(super) async fn send<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, octocrab::Error>>,
    {
        retry_with_backoff(self.retry, RetryPolicy::RetryTransient, || {
            let fut = op();
            async move { fut.await.map_err(from_octocrab) }
        })
        .await
        .into_result()
    }

    async fn fetch_pull(&self, pr: &PullRequestRef) -> Result<ApiPull> {
        let route = pr.api_path();
        self.send(|| self.client.get(&route, None::<&()>)).await
    }

    /// Follows `page` until a short page comes back.
    async fn fetch_all<T>(&self, route: &str) -> Result<Vec<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        let mut all = Vec::new();
        let mut page = 1;
        loop {
            let query = Page {
                per_page: PAGE_SIZE,
                page,
            };
            let items: Vec<T> = self.send(|| self.client.get(route, Some(&query))).await?;
            let is_last_page = items.len() < PAGE_SIZE as usize;
            all.extend(items);
            if is_last_page {
                return Ok(all);
            }
            page += 1;
        }
    }

    pub(super) async fn head_commit(&self, repo: &RepoRef, branch: &str) -> Result<Option<String>> {
        let route = format!("{}/branches/{branch}", repo.api_path());
        let branch: Result<ApiBranch> = self.send(|| self.client.get(&route, None::<&()>)).await;
        match branch {
            Ok(b) => Ok(Some(b.commit.sha)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete_ref(&self, repo: &RepoRef, branch: &str) -> Result<()> {
        let route = format!("{}/git/refs/heads/{branch}", repo.api_path());
        let response = self
            .send(|| self.client._delete(route.as_str(), None::<&()>))
            .await?;
        let status = response.status().as_u16();
        match status {
            200..=299 => Ok(()),
            // Already deleted.
            404 | 422 => {
                debug!(repo = %repo, branch, status, "Branch already absent");
                Ok(())
            }
            _ => Err(RemoteError::from_status(status, format!("failed to delete branch {branch}"))),
        }
    }
}

#[async_trait]
impl PullRequestHost for GitHubHost {
    #[instrument(skip(self, content), fields(head = %content.head_branch))]
    async fn create_pull_request(&self, repo: &str, content: &PullRequestContent) -> Result<String> {
        let repo = RepoRef::parse(repo)?;
        let route = format!("{}/pulls", repo.api_path());
        let body = CreatePull {
            title: &content.title,
            body: &content.description,
            head: &content.head_branch,
            base: &content.base_branch,
        };
        let created: ApiPull = self.send(|| self.client.post(&route, Some(&body))).await?;
        let url = PullRequestRef {
            repo,
            number: created.number,
        }
        .url();
        debug!(url = %url, "Created pull request");
        Ok(url)
    }

    async fn update_pull_request(&self, url: &str, title: &str, description: &str) -> Result<()> {
        let pr = PullRequestRef::parse(url)?;
        let route = pr.api_path();
        let body = UpdatePull {
            title,
            body: description,
        };
        let _: ApiPull = self.send(|| self.client.patch(&route, Some(&body))).await?;
        Ok(())
    }

    async fn get_pull_request(&self, url: &str) -> Result<PullRequestInfo> {
        let pr = PullRequestRef::parse(url)?;
        let pull = self.fetch_pull(&pr).await?;
        Ok(PullRequestInfo {
            url: pr.url(),
            status: pull_status(&pull),
            head_branch: pull.head.ref_field,
            base_branch: pull.base.ref_field,
            head_sha: pull.head.sha,
            title: pull.title,
            description: pull.body.unwrap_or_default(),
            updated_at: pull.updated_at,
        })
    }

    #[instrument(skip(self, parameters, commit_message))]
    async fn merge_pull_request(
        &self,
        url: &str,
        parameters: &MergeParameters,
        commit_message: &str,
    ) -> Result<()> {
        let pr = PullRequestRef::parse(url)?;
        let route = format!("{}/merge", pr.api_path());
        let (title, rest) = commit_message.split_once('\n').unwrap_or((commit_message, ""));
        let body = MergeRequest {
            commit_title: title,
            commit_message: rest.trim_start_matches('\n'),
            sha: &parameters.commit_to_merge,
            merge_method: if parameters.squash_merge { "squash" } else { "merge" },
        };
        let response: MergeResponse = self.send(|| self.client.put(&route, Some(&body))).await?;
        if !response.merged {
            return Err(RemoteError::new(
                RemoteErrorKind::NotMergeable,
                response.message.unwrap_or_else(|| "merge returned merged=false".into()),
            ));
        }
        if parameters.delete_source_branch {
            if let Err(e) = self.delete_pull_request_branch(url).await {
                warn!(url, error = %e, "Merged but failed to delete source branch");
            }
        }
        Ok(())
    }

    async fn create_or_update_merge_status(
        &self,
        url: &str,
        results: &[MergePolicyEvaluationResult],
    ) -> Result<()> {
        let pr = PullRequestRef::parse(url)?;
        let pull = self.fetch_pull(&pr).await?;
        let route = format!("{}/statuses/{}", pr.repo.api_path(), pull.head.sha);
        let target_url = pr.url();
        for result in results {
            let body = StatusRequest {
                state: policy_status_state(result.status),
                context: format!("{MERGE_POLICY_CONTEXT_PREFIX}{}", result.merge_policy_name),
                description: status_description(result),
                target_url: &target_url,
            };
            let _: serde_json::Value = self.send(|| self.client.post(&route, Some(&body))).await?;
        }
        Ok(())
    }

    async fn get_latest_commit(&self, repo: &str, branch: &str) -> Result<Option<String>> {
        self.head_commit(&RepoRef::parse(repo)?, branch).await
    }

    async fn comment_pull_request(&self, url: &str, body: &str) -> Result<()> {
        let pr = PullRequestRef::parse(url)?;
        let route = format!("{}/comments", pr.issue_path());
        let request = CommentRequest { body };
        let _: serde_json::Value = self.send(|| self.client.post(&route, Some(&request))).await?;
        Ok(())
    }

    async fn get_pull_request_comments(&self, url: &str) -> Result<Vec<String>> {
        let pr = PullRequestRef::parse(url)?;
        let route = format!("{}/comments", pr.issue_path());
        let comments: Vec<ApiComment> = self.fetch_all(&route).await?;
        Ok(comments.into_iter().filter_map(|c| c.body).collect())
    }

    async fn get_pull_request_checks(&self, url: &str) -> Result<Vec<Check>> {
        let pr = PullRequestRef::parse(url)?;
        let pull = self.fetch_pull(&pr).await?;
        let commit = format!("{}/commits/{}", pr.repo.api_path(), pull.head.sha);

        let status_route = format!("{commit}/status");
        let combined: CombinedStatus = self.send(|| self.client.get(&status_route, None::<&()>)).await?;
        let runs_route = format!("{commit}/check-runs");
        let runs: CheckRuns = self.send(|| self.client.get(&runs_route, None::<&()>)).await?;

        let statuses = combined.statuses.into_iter().map(|s| Check {
            status: commit_status_state(&s.state),
            is_merge_policy: s.context.starts_with(MERGE_POLICY_CONTEXT_PREFIX),
            name: s.context,
            url: s.target_url.unwrap_or_default(),
        });
        let check_runs = runs.check_runs.into_iter().map(|r| Check {
            status: check_run_state(&r.status, r.conclusion.as_deref()),
            name: r.name,
            url: r.html_url.unwrap_or_default(),
            is_merge_policy: false,
        });
        Ok(statuses.chain(check_runs).collect())
    }

    async fn get_pull_request_reviews(&self, url: &str) -> Result<Vec<Review>> {
        let pr = PullRequestRef::parse(url)?;
        let route = format!("{}/reviews", pr.api_path());
        let reviews: Vec<ApiReview> = self.fetch_all(&route).await?;
        Ok(reviews
            .into_iter()
            .map(|r| Review {
                state: review_state(&r.state),
                reviewer: r.user.map(|u| u.login).unwrap_or_default(),
                submitted_at: r.submitted_at,
            })
            .collect())
    }

    async fn delete_branch(&self, repo: &str, branch: &str) -> Result<()> {
        let repo = RepoRef::parse(repo)?;
        self.delete_ref(&repo, branch).await
    }

    async fn delete_pull_request_branch(&self, url: &str) -> Result<()> {
        let pr = PullRequestRef::parse(url)?;
        let pull = self.fetch_pull(&pr).await?;
        self.delete_ref(&pr.repo, &pull.head.ref_field).await
    }
}
