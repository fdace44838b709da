//! [`RepositoryContent`] over the GitHub contents and git data APIs.
//!
//! Dependency edits are single commits made through the contents API; an
//! update with nothing to write becomes an empty commit built from the
//! branch head's tree.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::client::{GitHubHost, RepoRef};
use super::error::from_octocrab;
use crate::codeflow::SOURCE_MANIFEST_PATH;
use crate::manifest::{self, VERSION_DETAILS_PATH};
use crate::remote::{RemoteError, RepositoryContent, Result, RetryPolicy, retry_with_backoff};
use crate::types::{DependencyDetail, SourceDependency, SourceManifest};

/// A file read from a repository, with the blob sha needed to replace it.
struct FileContent {
    text: String,
    sha: String,
}

#[derive(Debug, Serialize)]
struct CreateRef<'a> {
    #[serde(rename = "ref")]
    ref_field: String,
    sha: &'a str,
}

#[derive(Debug, Serialize)]
struct UpdateRef<'a> {
    sha: &'a str,
    force: bool,
}

#[derive(Debug, Deserialize)]
struct ApiGitCommit {
    sha: String,
    tree: ApiTree,
}

#[derive(Debug, Deserialize)]
struct ApiTree {
    sha: String,
}

#[derive(Debug, Serialize)]
struct CreateCommit<'a> {
    message: &'a str,
    tree: &'a str,
    parents: [&'a str; 1],
}

impl GitHubHost {
    /// Reads `path` at `reference`; `None` if the file or ref does not exist.
    async fn read_file(&self, repo: &RepoRef, path: &str, reference: &str) -> Result<Option<FileContent>> {
        let result = retry_with_backoff(self.retry, RetryPolicy::RetryTransient, || async {
            self.client
                .repos(&repo.owner, &repo.repo)
                .get_content()
                .path(path)
                .r#ref(reference)
                .send()
                .await
                .map_err(from_octocrab)
        })
        .await
        .into_result();

        let items = match result {
            Ok(items) => items,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let Some(item) = items.items.into_iter().next() else {
            return Ok(None);
        };
        let text = item
            .decoded_content()
            .ok_or_else(|| RemoteError::permanent(format!("{path} in {repo} is not a text file")))?;
        Ok(Some(FileContent { text, sha: item.sha }))
    }

    async fn empty_commit(&self, repo: &RepoRef, branch: &str, message: &str) -> Result<()> {
        let head = self
            .head_commit(repo, branch)
            .await?
            .ok_or_else(|| RemoteError::not_found(format!("branch {branch} not found in {repo}")))?;

        let commit_route = format!("{}/git/commits/{head}", repo.api_path());
        let parent: ApiGitCommit = self.send(|| self.client.get(&commit_route, None::<&()>)).await?;

        let create_route = format!("{}/git/commits", repo.api_path());
        let body = CreateCommit {
            message,
            tree: &parent.tree.sha,
            parents: [&parent.sha],
        };
        let created: ApiGitCommit = self.send(|| self.client.post(&create_route, Some(&body))).await?;

        let ref_route = format!("{}/git/refs/heads/{branch}", repo.api_path());
        let update = UpdateRef {
            sha: &created.sha,
            force: false,
        };
        let _: serde_json::Value = self.send(|| self.client.patch(&ref_route, Some(&update))).await?;
        debug!(repo = %repo, branch, sha = %created.sha, "Pushed empty commit");
        Ok(())
    }
}

#[async_trait]
impl RepositoryContent for GitHubHost {
    async fn get_dependencies(
        &self,
        repo: &str,
        branch_or_commit: &str,
        name: Option<&str>,
    ) -> Result<Vec<DependencyDetail>> {
        let repo = RepoRef::parse(repo)?;
        let Some(file) = self.read_file(&repo, VERSION_DETAILS_PATH, branch_or_commit).await? else {
            return Ok(Vec::new());
        };
        let mut dependencies = manifest::parse_dependencies(&file.text);
        if let Some(name) = name {
            dependencies.retain(|d| d.name.eq_ignore_ascii_case(name));
        }
        Ok(dependencies)
    }

    async fn create_new_branch(&self, repo: &str, base_branch: &str, new_branch: &str) -> Result<()> {
        let repo = RepoRef::parse(repo)?;
        let base = self
            .head_commit(&repo, base_branch)
            .await?
            .ok_or_else(|| RemoteError::not_found(format!("branch {base_branch} not found in {repo}")))?;
        let route = format!("{}/git/refs", repo.api_path());
        let body = CreateRef {
            ref_field: format!("refs/heads/{new_branch}"),
            sha: &base,
        };
        let _: serde_json::Value = self.send(|| self.client.post(&route, Some(&body))).await?;
        Ok(())
    }

    #[instrument(skip(self, updates, message), fields(count = updates.len()))]
    async fn commit_updates(
        &self,
        repo: &str,
        branch: &str,
        updates: &[DependencyDetail],
        message: &str,
    ) -> Result<()> {
        let repo = RepoRef::parse(repo)?;
        if updates.is_empty() {
            return self.empty_commit(&repo, branch, message).await;
        }

        let file = self
            .read_file(&repo, VERSION_DETAILS_PATH, branch)
            .await?
            .ok_or_else(|| RemoteError::not_found(format!("{VERSION_DETAILS_PATH} not found in {repo}@{branch}")))?;
        let updated = manifest::apply_updates(&file.text, updates);

        retry_with_backoff(self.retry, RetryPolicy::RetryTransient, || async {
            self.client
                .repos(&repo.owner, &repo.repo)
                .update_file(VERSION_DETAILS_PATH, message, updated.as_bytes(), &file.sha)
                .branch(branch)
                .send()
                .await
                .map_err(from_octocrab)
        })
        .await
        .into_result()?;
        Ok(())
    }

    async fn get_source_dependency(&self, repo: &str, branch: &str) -> Result<Option<SourceDependency>> {
        let repo = RepoRef::parse(repo)?;
        Ok(self
            .read_file(&repo, VERSION_DETAILS_PATH, branch)
            .await?
            .and_then(|file| manifest::source_dependency(&file.text)))
    }

    async fn get_source_manifest(&self, repo: &str, branch: &str) -> Result<SourceManifest> {
        let parsed = RepoRef::parse(repo)?;
        let file = self
            .read_file(&parsed, SOURCE_MANIFEST_PATH, branch)
            .await?
            .ok_or_else(|| RemoteError::not_found(format!("{SOURCE_MANIFEST_PATH} not found in {repo}@{branch}")))?;
        SourceManifest::from_json(&file.text)
            .map_err(|e| RemoteError::permanent(format!("malformed {SOURCE_MANIFEST_PATH}: {e}")).with_source(e))
    }
}
