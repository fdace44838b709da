//! Source-code flow between product repositories and the VMR.
//!
//! Forward flow carries a product repository's changes into its directory
//! under `src/` in the VMR. Backflow carries the VMR's copy of that
//! directory back into the product repository. Both leave a local branch
//! ready to push; pushing and the pull request itself belong to the updater.

pub mod flower;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::description::UpstreamRepoDiff;
use crate::git::{self, Git, GitError};
use crate::remote::RemoteError;
use crate::types::{Build, CodeFlowDirection, DependencyUpdate, SourceManifest, Subscription};

pub use flower::GitCodeFlower;

/// Where the VMR records which commit of each repository it holds.
pub const SOURCE_MANIFEST_PATH: &str = "src/source-manifest.json";

/// Subject prefix of every commit the flower makes.
pub const FLOW_COMMIT_PREFIX: &str = "[codeflow]";

/// A patch that does not apply on the PR branch.
#[derive(Debug, Clone, Error)]
#[error("conflict while flowing {direction:?} into {repository} / {branch} ({} files)", .conflicted_files.len())]
pub struct ConflictError {
    pub direction: CodeFlowDirection,
    pub repository: String,
    pub branch: String,
    pub conflicted_files: Vec<String>,
    /// What `git apply` reported, including the failing hunks.
    pub details: String,
}

#[derive(Debug, Error)]
pub enum CodeFlowError {
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error("target branch {branch} not found in {repository}")]
    TargetBranchNotFound { repository: String, branch: String },

    /// Re-synchronising would overwrite commits made by hand on the PR branch.
    #[error("flow would overwrite manual commits: {}", .commits.join(", "))]
    ManualCommitsInFlow { commits: Vec<String> },

    #[error("subscription cannot be flowed: {0}")]
    InvalidSubscription(String),

    #[error("code flow cancelled")]
    Cancelled,

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed {SOURCE_MANIFEST_PATH}: {0}")]
    Manifest(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CodeFlowError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeFlowResult {
    /// Whether a commit was made on the local branch.
    pub had_updates: bool,
    /// The local clone holding the branch to push.
    pub repo_path: PathBuf,
    pub dependency_updates: Vec<DependencyUpdate>,
    /// Files that flowed but still conflict with the target branch.
    pub conflicted_files: Vec<String>,
}

impl CodeFlowResult {
    pub fn no_updates(repo_path: impl Into<PathBuf>) -> Self {
        CodeFlowResult {
            had_updates: false,
            repo_path: repo_path.into(),
            dependency_updates: Vec::new(),
            conflicted_files: Vec::new(),
        }
    }
}

#[async_trait]
pub trait CodeFlower: Send + Sync {
    /// Flows `build` of the subscription's source repository into the VMR
    /// on local branch `head_branch`.
    async fn flow_forward(
        &self,
        subscription: &Subscription,
        build: &Build,
        head_branch: &str,
        is_new_branch: bool,
        cancel: &CancellationToken,
    ) -> Result<CodeFlowResult>;

    /// Flows `build` of the VMR into the subscription's target repository.
    async fn flow_back(
        &self,
        subscription: &Subscription,
        build: &Build,
        head_branch: &str,
        is_new_branch: bool,
        cancel: &CancellationToken,
    ) -> Result<CodeFlowResult>;

    /// The local VMR clone.
    fn vmr_path(&self) -> &Path;
}

/// Files named in `git apply` failure output.
pub fn parse_conflicted_files(output: &str) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    for line in output.lines() {
        let file = if let Some(rest) = line.strip_prefix("U ") {
            Some(rest.trim())
        } else if let Some(rest) = line.strip_prefix("error: patch failed: ") {
            rest.rsplit_once(':').map(|(file, _)| file)
        } else if let Some(rest) = line.strip_prefix("error: ") {
            rest.split_once(": ")
                .filter(|(_, reason)| reason.contains("does not exist in index") || reason.contains("already exists"))
                .map(|(file, _)| file)
        } else {
            None
        };
        if let Some(file) = file {
            if !files.iter().any(|f| f == file) {
                files.push(file.to_string());
            }
        }
    }
    files
}

/// The VMR source manifest as of `sha`.
pub async fn read_manifest(git: &dyn Git, vmr_path: &Path, sha: &str) -> Result<SourceManifest> {
    match git::show_file(git, vmr_path, SOURCE_MANIFEST_PATH, sha).await? {
        Some(json) => Ok(SourceManifest::from_json(&json)?),
        None => Err(CodeFlowError::Git(GitError::CommandFailed {
            command: format!("git show {sha}:{SOURCE_MANIFEST_PATH}"),
            stderr: format!("{SOURCE_MANIFEST_PATH} not found at {sha}"),
        })),
    }
}

/// How each source repository moved in the VMR between two of its commits.
///
/// `exclude_repo` is left out; it is the repository being backflowed into.
pub async fn upstream_repo_diffs(
    git: &dyn Git,
    vmr_path: &Path,
    previous_sha: Option<&str>,
    current_sha: &str,
    exclude_repo: &str,
) -> Result<Vec<UpstreamRepoDiff>> {
    let Some(previous_sha) = previous_sha.filter(|s| !s.is_empty()) else {
        warn!("No previous flow commit; skipping upstream diffs");
        return Ok(Vec::new());
    };

    let old = read_manifest(git, vmr_path, previous_sha).await?;
    let new = read_manifest(git, vmr_path, current_sha).await?;

    let sha_in = |manifest: &SourceManifest, uri: &str| {
        manifest
            .repositories
            .iter()
            .find(|r| r.remote_uri == uri)
            .map(|r| r.commit_sha.clone())
    };

    let mut uris: Vec<&str> = old.repositories.iter().map(|r| r.remote_uri.as_str()).collect();
    for record in &new.repositories {
        if !uris.contains(&record.remote_uri.as_str()) {
            uris.push(&record.remote_uri);
        }
    }

    Ok(uris
        .into_iter()
        .filter(|uri| *uri != exclude_repo)
        .filter_map(|uri| {
            let (before, after) = (sha_in(&old, uri), sha_in(&new, uri));
            (before != after).then(|| UpstreamRepoDiff {
                repo_uri: uri.to_string(),
                old_commit_sha: before.unwrap_or_default(),
                new_commit_sha: after.unwrap_or_default(),
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::LocalGit;
    use crate::git::testing::{commit_file, init_repo};
    use tempfile::TempDir;

    #[test]
    fn conflicted_files_from_apply_output() {
        let output = "\
error: patch failed: src/runtime/a.txt:1
Falling back to three-way merge...
Applied patch to 'src/runtime/a.txt' with conflicts.
U src/runtime/a.txt
U src/runtime/b.txt
error: src/runtime/c.txt: does not exist in index
";
        assert_eq!(
            parse_conflicted_files(output),
            vec!["src/runtime/a.txt", "src/runtime/b.txt", "src/runtime/c.txt"]
        );
        assert!(parse_conflicted_files("").is_empty());
    }

    fn manifest(entries: &[(&str, &str)]) -> String {
        let repositories: Vec<_> = entries
            .iter()
            .map(|(uri, sha)| {
                serde_json::json!({
                    "path": uri.rsplit('/').next().unwrap(),
                    "remoteUri": uri,
                    "commitSha": sha,
                })
            })
            .collect();
        serde_json::json!({ "repositories": repositories }).to_string()
    }

    #[tokio::test]
    async fn upstream_diffs_list_changed_repositories_only() {
        let temp = TempDir::new().unwrap();
        let vmr = init_repo(temp.path());
        let old = commit_file(
            &vmr,
            SOURCE_MANIFEST_PATH,
            &manifest(&[
                ("https://github.com/dotnet/runtime", "r1"),
                ("https://github.com/dotnet/sdk", "s1"),
                ("https://github.com/dotnet/same", "x"),
            ]),
            "old",
        );
        let new = commit_file(
            &vmr,
            SOURCE_MANIFEST_PATH,
            &manifest(&[
                ("https://github.com/dotnet/runtime", "r2"),
                ("https://github.com/dotnet/sdk", "s2"),
                ("https://github.com/dotnet/same", "x"),
                ("https://github.com/dotnet/added", "a1"),
            ]),
            "new",
        );

        let diffs = upstream_repo_diffs(&LocalGit::default(), &vmr, Some(&old), &new, "https://github.com/dotnet/runtime")
            .await
            .unwrap();

        assert_eq!(
            diffs,
            vec![
                UpstreamRepoDiff {
                    repo_uri: "https://github.com/dotnet/sdk".into(),
                    old_commit_sha: "s1".into(),
                    new_commit_sha: "s2".into(),
                },
                UpstreamRepoDiff {
                    repo_uri: "https://github.com/dotnet/added".into(),
                    old_commit_sha: String::new(),
                    new_commit_sha: "a1".into(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn upstream_diffs_without_previous_flow_are_empty() {
        let temp = TempDir::new().unwrap();
        let vmr = init_repo(temp.path());
        let diffs = upstream_repo_diffs(&LocalGit::default(), &vmr, None, "HEAD", "x").await.unwrap();
        assert!(diffs.is_empty());
    }
}
