//! Patch-based flower over local clones.
//!
//! Forward flow diffs the product repository between the commit recorded in
//! the VMR source manifest and the build commit, and applies that patch under
//! `src/<dir>` of the VMR. Backflow does the reverse using the VMR sha stored
//! in the product repository's `eng/Version.Details.xml`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{
    CodeFlowError, CodeFlowResult, CodeFlower, ConflictError, FLOW_COMMIT_PREFIX, Result,
    SOURCE_MANIFEST_PATH, parse_conflicted_files,
};
use crate::git::{self, Git};
use crate::manifest::{VERSION_DETAILS_PATH, update_version_details, version_details_source_sha};
use crate::types::{Build, CodeFlowDirection, SourceManifest, Subscription};

const EMPTY_TREE: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";
const PATCH_FILE: &str = "depflow-flow.patch";

pub struct GitCodeFlower {
    git: Arc<dyn Git>,
    vmr_path: PathBuf,
    clones_dir: PathBuf,
}

impl GitCodeFlower {
    /// `vmr_path` must be a clone of the VMR with `origin` pointing at it.
    /// Product repositories are cloned under `clones_dir` on first use.
    pub fn new(git: Arc<dyn Git>, vmr_path: impl Into<PathBuf>, clones_dir: impl Into<PathBuf>) -> Self {
        GitCodeFlower {
            git,
            vmr_path: vmr_path.into(),
            clones_dir: clones_dir.into(),
        }
    }

    fn clone_path(&self, repo_uri: &str) -> PathBuf {
        let name: String = repo_uri
            .trim_end_matches('/')
            .trim_end_matches(".git")
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.clones_dir.join(name)
    }

    async fn ensure_clone(&self, repo_uri: &str) -> Result<PathBuf> {
        let path = self.clone_path(repo_uri);
        if path.join(".git").exists() {
            git::run(&*self.git, &path, &["fetch", "-q", "origin"]).await?;
        } else {
            tokio::fs::create_dir_all(&self.clones_dir).await?;
            let dest = path.to_string_lossy().into_owned();
            git::run(&*self.git, &self.clones_dir, &["clone", "-q", repo_uri, &dest]).await?;
        }
        Ok(path)
    }

    /// Checks out `head_branch` fresh: from the remote head branch when it
    /// already exists, otherwise from the target branch.
    async fn prepare_branch(
        &self,
        repo: &Path,
        repo_uri: &str,
        target_branch: &str,
        head_branch: &str,
        is_new_branch: bool,
    ) -> Result<()> {
        let git = &*self.git;
        git::run(git, repo, &["fetch", "-q", "origin"]).await?;

        let target_ref = format!("origin/{target_branch}");
        let head_ref = format!("origin/{head_branch}");
        let base = if !is_new_branch && git::commit_exists(git, repo, &head_ref).await? {
            head_ref
        } else {
            target_ref
        };
        if !git::commit_exists(git, repo, &base).await? {
            return Err(CodeFlowError::TargetBranchNotFound {
                repository: repo_uri.to_string(),
                branch: target_branch.to_string(),
            });
        }

        debug!(repo = %repo.display(), base = %base, head_branch, "Preparing flow branch");
        git::run(git, repo, &["checkout", "-q", "-f", "-B", head_branch, &base]).await?;
        git::run(git, repo, &["clean", "-q", "-fdx"]).await?;
        Ok(())
    }

    /// Commits on the PR branch that touch `path` and were not made by a flow.
    async fn manual_commits(&self, repo: &Path, target_branch: &str, path: &str) -> Result<Vec<String>> {
        let range = format!("origin/{target_branch}..HEAD");
        let log = git::run(&*self.git, repo, &["log", "--format=%H%x09%s", &range, "--", path]).await?;
        Ok(log
            .lines()
            .filter_map(|line| line.split_once('\t'))
            .filter(|(_, subject)| !subject.starts_with(FLOW_COMMIT_PREFIX))
            .map(|(sha, _)| sha.to_string())
            .collect())
    }

    /// Applies `patch` to the index and work tree of `repo`. A failing apply
    /// is rolled back and reported as a conflict.
    async fn apply_patch(
        &self,
        repo: &Path,
        patch: &str,
        extra_args: &[&str],
        conflict: impl FnOnce(Vec<String>, String) -> ConflictError,
    ) -> Result<()> {
        if patch.trim().is_empty() {
            return Ok(());
        }
        let patch_path = repo.join(".git").join(PATCH_FILE);
        tokio::fs::write(&patch_path, patch).await?;
        let patch_arg = patch_path.to_string_lossy().into_owned();

        let mut args = vec!["apply", "--3way", "--index", "--whitespace=nowarn"];
        args.extend_from_slice(extra_args);
        args.push(&patch_arg);
        let output = self.git.execute(repo, &args).await?;
        let _ = tokio::fs::remove_file(&patch_path).await;
        if output.succeeded() {
            return Ok(());
        }

        let details = format!("{}{}", output.stdout, output.stderr);
        let files = parse_conflicted_files(&details);
        warn!(repo = %repo.display(), files = ?files, "Flow patch does not apply");
        git::run(&*self.git, repo, &["reset", "-q", "--hard"]).await?;
        Err(conflict(files, details).into())
    }

    /// Commits the staged changes. Returns false when nothing is staged.
    async fn commit_staged(&self, repo: &Path, message: &str) -> Result<bool> {
        let staged = self.git.execute(repo, &["diff", "--cached", "--quiet"]).await?;
        if staged.succeeded() {
            return Ok(false);
        }
        git::run(&*self.git, repo, &["commit", "-q", "-m", message]).await?;
        Ok(true)
    }

    /// Files that would conflict if the flowed branch were merged into the
    /// target branch now. Leaves the work tree untouched.
    async fn conflicts_with_target(&self, repo: &Path, target_branch: &str) -> Result<Vec<String>> {
        let git = &*self.git;
        let target_ref = format!("origin/{target_branch}");
        let merge = git
            .execute(repo, &["merge", "--no-commit", "--no-ff", &target_ref])
            .await?;
        let combined = format!("{}{}", merge.stdout, merge.stderr);

        let files = if !merge.succeeded() && combined.contains("CONFLICT") {
            git::run(git, repo, &["diff", "--name-only", "--diff-filter=U"])
                .await?
                .lines()
                .map(str::to_string)
                .collect()
        } else {
            Vec::new()
        };

        // Nothing to abort when the branch was already up to date.
        let _ = git.execute(repo, &["merge", "--abort"]).await?;
        Ok(files)
    }
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(CodeFlowError::Cancelled)
    } else {
        Ok(())
    }
}

fn short(sha: &str) -> &str {
    sha.get(..7).unwrap_or(sha)
}

/// Sets `commitSha` and `barId` of the `path` record in a source manifest,
/// adding the record if missing. Unknown fields are preserved.
pub fn update_manifest_json(
    current: Option<&str>,
    path: &str,
    remote_uri: &str,
    commit_sha: &str,
    bar_id: u64,
) -> Result<String> {
    let mut manifest: serde_json::Value = match current {
        Some(json) if !json.trim().is_empty() => serde_json::from_str(json)?,
        _ => serde_json::json!({ "repositories": [] }),
    };
    if !manifest.is_object() {
        return Err(CodeFlowError::InvalidSubscription(format!("{SOURCE_MANIFEST_PATH} is not a JSON object")));
    }
    if !manifest.get("repositories").is_some_and(|r| r.is_array()) {
        manifest["repositories"] = serde_json::json!([]);
    }

    let repositories = manifest["repositories"]
        .as_array_mut()
        .ok_or_else(|| CodeFlowError::InvalidSubscription("source manifest has no repositories".into()))?;
    match repositories
        .iter_mut()
        .find(|r| r.get("path").and_then(|p| p.as_str()) == Some(path))
    {
        Some(record) => {
            record["commitSha"] = commit_sha.into();
            record["barId"] = bar_id.into();
        }
        None => repositories.push(serde_json::json!({
            "path": path,
            "remoteUri": remote_uri,
            "commitSha": commit_sha,
            "barId": bar_id,
        })),
    }

    let mut json = serde_json::to_string_pretty(&manifest)?;
    json.push('\n');
    Ok(json)
}

#[async_trait]
impl CodeFlower for GitCodeFlower {
    #[instrument(skip(self, subscription, build, cancel), fields(subscription_id = %subscription.id, build_id = %build.id))]
    async fn flow_forward(
        &self,
        subscription: &Subscription,
        build: &Build,
        head_branch: &str,
        is_new_branch: bool,
        cancel: &CancellationToken,
    ) -> Result<CodeFlowResult> {
        let dir = subscription
            .target_directory
            .as_deref()
            .filter(|d| !d.is_empty())
            .ok_or_else(|| CodeFlowError::InvalidSubscription(format!("{} has no target directory", subscription.id)))?;
        let vmr = self.vmr_path.as_path();
        let vmr_dir = format!("src/{dir}");

        ensure_not_cancelled(cancel)?;
        self.prepare_branch(
            vmr,
            &subscription.target_repository,
            &subscription.target_branch,
            head_branch,
            is_new_branch,
        )
        .await?;

        let manifest_path = vmr.join(SOURCE_MANIFEST_PATH);
        let manifest_json = match tokio::fs::read_to_string(&manifest_path).await {
            Ok(json) => Some(json),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let previous = match &manifest_json {
            Some(json) => SourceManifest::from_json(json)?
                .repo_version(dir)
                .map(|r| r.commit_sha.clone()),
            None => None,
        };
        let new_sha = build.commit.as_str();
        if previous.as_deref() == Some(new_sha) {
            info!(dir, sha = %new_sha, "VMR already has this commit");
            return Ok(CodeFlowResult::no_updates(vmr));
        }

        ensure_not_cancelled(cancel)?;
        let source = self.ensure_clone(&subscription.source_repository).await?;
        git::ensure_commit(&*self.git, &source, new_sha).await?;

        let from = match &previous {
            Some(sha) => {
                git::ensure_commit(&*self.git, &source, sha).await?;
                sha.clone()
            }
            None => {
                if !is_new_branch {
                    let commits = self.manual_commits(vmr, &subscription.target_branch, &vmr_dir).await?;
                    if !commits.is_empty() {
                        return Err(CodeFlowError::ManualCommitsInFlow { commits });
                    }
                }
                git::run(&*self.git, vmr, &["rm", "-r", "-q", "--ignore-unmatch", &vmr_dir]).await?;
                EMPTY_TREE.to_string()
            }
        };

        let patch = git::run(&*self.git, &source, &["diff", "--binary", "--no-color", &from, new_sha]).await?;
        ensure_not_cancelled(cancel)?;
        let directory_arg = format!("--directory={vmr_dir}");
        self.apply_patch(vmr, &patch, &[&directory_arg], |conflicted_files, details| ConflictError {
            direction: CodeFlowDirection::ForwardFlow,
            repository: subscription.target_repository.clone(),
            branch: head_branch.to_string(),
            conflicted_files,
            details,
        })
        .await?;

        let manifest = update_manifest_json(
            manifest_json.as_deref(),
            dir,
            &subscription.source_repository,
            new_sha,
            build.id.0,
        )?;
        if let Some(parent) = manifest_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&manifest_path, manifest).await?;
        git::run(&*self.git, vmr, &["add", SOURCE_MANIFEST_PATH]).await?;

        let message = format!(
            "{FLOW_COMMIT_PREFIX} Source update {dir} {}..{}",
            previous.as_deref().map(short).unwrap_or("0000000"),
            short(new_sha)
        );
        if !self.commit_staged(vmr, &message).await? {
            return Ok(CodeFlowResult::no_updates(vmr));
        }

        let conflicted_files = if is_new_branch {
            Vec::new()
        } else {
            self.conflicts_with_target(vmr, &subscription.target_branch).await?
        };
        info!(dir, head_branch, "Flowed source into the VMR");
        Ok(CodeFlowResult {
            had_updates: true,
            repo_path: vmr.to_path_buf(),
            dependency_updates: Vec::new(),
            conflicted_files,
        })
    }

    #[instrument(skip(self, subscription, build, cancel), fields(subscription_id = %subscription.id, build_id = %build.id))]
    async fn flow_back(
        &self,
        subscription: &Subscription,
        build: &Build,
        head_branch: &str,
        is_new_branch: bool,
        cancel: &CancellationToken,
    ) -> Result<CodeFlowResult> {
        let dir = subscription
            .source_directory
            .as_deref()
            .filter(|d| !d.is_empty())
            .ok_or_else(|| CodeFlowError::InvalidSubscription(format!("{} has no source directory", subscription.id)))?;
        let vmr = self.vmr_path.as_path();

        ensure_not_cancelled(cancel)?;
        let target = self.ensure_clone(&subscription.target_repository).await?;
        self.prepare_branch(
            &target,
            &subscription.target_repository,
            &subscription.target_branch,
            head_branch,
            is_new_branch,
        )
        .await?;

        let details_path = target.join(VERSION_DETAILS_PATH);
        let details = tokio::fs::read_to_string(&details_path).await?;
        let previous = version_details_source_sha(&details).ok_or_else(|| {
            CodeFlowError::InvalidSubscription(format!(
                "{} records no VMR source in {VERSION_DETAILS_PATH}",
                subscription.target_repository
            ))
        })?;
        let new_sha = build.commit.as_str();
        if previous == new_sha {
            info!(sha = %new_sha, "Repository already has this VMR commit");
            return Ok(CodeFlowResult::no_updates(&target));
        }

        ensure_not_cancelled(cancel)?;
        git::run(&*self.git, vmr, &["fetch", "-q", "origin"]).await?;
        git::ensure_commit(&*self.git, vmr, new_sha).await?;
        git::ensure_commit(&*self.git, vmr, &previous).await?;
        let relative = format!("--relative=src/{dir}");
        let patch = git::run(
            &*self.git,
            vmr,
            &["diff", "--binary", "--no-color", &relative, &previous, new_sha],
        )
        .await?;

        ensure_not_cancelled(cancel)?;
        self.apply_patch(&target, &patch, &[], |conflicted_files, output| ConflictError {
            direction: CodeFlowDirection::BackFlow,
            repository: subscription.target_repository.clone(),
            branch: head_branch.to_string(),
            conflicted_files,
            details: output,
        })
        .await?;

        tokio::fs::write(&details_path, update_version_details(&details, new_sha, build.id.0)).await?;
        git::run(&*self.git, &target, &["add", VERSION_DETAILS_PATH]).await?;

        let message = format!(
            "{FLOW_COMMIT_PREFIX} Backflow from VMR {}..{}",
            short(&previous),
            short(new_sha)
        );
        if !self.commit_staged(&target, &message).await? {
            return Ok(CodeFlowResult::no_updates(&target));
        }

        let conflicted_files = if is_new_branch {
            Vec::new()
        } else {
            self.conflicts_with_target(&target, &subscription.target_branch).await?
        };
        info!(dir, head_branch, "Flowed VMR changes back");
        Ok(CodeFlowResult {
            had_updates: true,
            repo_path: target,
            dependency_updates: Vec::new(),
            conflicted_files,
        })
    }

    fn vmr_path(&self) -> &Path {
        &self.vmr_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::LocalGit;
    use crate::git::testing::{commit_file, git_sync, init_repo};
    use crate::test_utils::{build, subscription};
    use tempfile::TempDir;

    const VERSION_DETAILS: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<Dependencies>
  <Source Uri="https://github.com/dotnet/dotnet" Mapping="runtime" Sha="SHA" BarId="1" />
  <ProductDependencies />
</Dependencies>
"#;

    struct Fixture {
        _temp: TempDir,
        product: PathBuf,
        vmr_origin: PathBuf,
        flower: GitCodeFlower,
    }

    fn uri(path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }

    /// A product repo and a VMR whose manifest points at the product's
    /// first commit, with the VMR cloned locally.
    fn fixture() -> (Fixture, String) {
        let temp = TempDir::new().unwrap();
        let product = init_repo(&temp.path().join("product"));
        let first = commit_file(&product, "lib/a.txt", "one\n", "first");

        let vmr_origin = init_repo(&temp.path().join("vmr-origin"));
        let manifest = update_manifest_json(None, "runtime", &uri(&product), &first, 1).unwrap();
        std::fs::create_dir_all(vmr_origin.join("src/runtime/lib")).unwrap();
        std::fs::write(vmr_origin.join("src/runtime/README.md"), "# Test\n").unwrap();
        std::fs::write(vmr_origin.join("src/runtime/lib/a.txt"), "one\n").unwrap();
        commit_file(&vmr_origin, SOURCE_MANIFEST_PATH, &manifest, "add runtime");

        let vmr = temp.path().join("vmr");
        git_sync(temp.path(), &["clone", "-q", &uri(&vmr_origin), &uri(&vmr)]);
        let flower = GitCodeFlower::new(Arc::new(LocalGit::default()), &vmr, temp.path().join("clones"));
        (
            Fixture {
                _temp: temp,
                product,
                vmr_origin,
                flower,
            },
            first,
        )
    }

    fn forward_subscription(f: &Fixture) -> Subscription {
        let mut sub = subscription(&uri(&f.product), &uri(&f.vmr_origin), "main");
        sub.source_enabled = true;
        sub.target_directory = Some("runtime".into());
        sub
    }

    #[tokio::test]
    async fn forward_flow_applies_source_changes_and_updates_manifest() {
        let (f, _) = fixture();
        let second = commit_file(&f.product, "lib/a.txt", "two\n", "second");
        let sub = forward_subscription(&f);
        let b = build(2, &uri(&f.product), &second);

        let result = f
            .flower
            .flow_forward(&sub, &b, "darc-main-1", true, &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.had_updates);
        assert!(result.conflicted_files.is_empty());
        let vmr = f.flower.vmr_path();
        assert_eq!(std::fs::read_to_string(vmr.join("src/runtime/lib/a.txt")).unwrap(), "two\n");
        let manifest = SourceManifest::from_json(
            &std::fs::read_to_string(vmr.join(SOURCE_MANIFEST_PATH)).unwrap(),
        )
        .unwrap();
        let record = manifest.repo_version("runtime").unwrap();
        assert_eq!(record.commit_sha, second);
        assert_eq!(record.bar_id, Some(crate::types::BuildId(2)));
        assert!(git_sync(vmr, &["log", "-1", "--format=%s"]).starts_with(FLOW_COMMIT_PREFIX));
        assert_eq!(git_sync(vmr, &["rev-parse", "--abbrev-ref", "HEAD"]), "darc-main-1");
    }

    #[tokio::test]
    async fn forward_flow_of_synchronized_commit_is_a_no_op() {
        let (f, first) = fixture();
        let sub = forward_subscription(&f);
        let b = build(1, &uri(&f.product), &first);

        let result = f
            .flower
            .flow_forward(&sub, &b, "darc-main-1", true, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.had_updates);
    }

    #[tokio::test]
    async fn forward_flow_conflict_is_typed_and_rolled_back() {
        let (f, _) = fixture();
        commit_file(&f.vmr_origin, "src/runtime/lib/a.txt", "edited in vmr\n", "vmr edit");
        let second = commit_file(&f.product, "lib/a.txt", "two\n", "second");
        let sub = forward_subscription(&f);
        let b = build(2, &uri(&f.product), &second);

        let err = f
            .flower
            .flow_forward(&sub, &b, "darc-main-1", true, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            CodeFlowError::Conflict(conflict) => {
                assert_eq!(conflict.direction, CodeFlowDirection::ForwardFlow);
                assert_eq!(conflict.branch, "darc-main-1");
                assert!(!conflict.details.is_empty());
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        let status = git_sync(f.flower.vmr_path(), &["status", "--porcelain"]);
        assert!(status.is_empty(), "work tree left dirty: {status}");
    }

    #[tokio::test]
    async fn missing_target_branch_is_reported() {
        let (f, _) = fixture();
        let second = commit_file(&f.product, "lib/a.txt", "two\n", "second");
        let mut sub = forward_subscription(&f);
        sub.target_branch = "release/9.0".into();
        let b = build(2, &uri(&f.product), &second);

        let err = f
            .flower
            .flow_forward(&sub, &b, "darc-release-1", true, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CodeFlowError::TargetBranchNotFound { ref branch, .. } if branch == "release/9.0"));
    }

    #[tokio::test]
    async fn cancelled_flow_stops_before_touching_the_vmr() {
        let (f, _) = fixture();
        let sub = forward_subscription(&f);
        let b = build(2, &uri(&f.product), "abc");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = f.flower.flow_forward(&sub, &b, "darc-main-1", true, &cancel).await.unwrap_err();
        assert!(matches!(err, CodeFlowError::Cancelled));
    }

    #[tokio::test]
    async fn backflow_applies_vmr_changes_and_records_sha() {
        let (f, _) = fixture();
        let previous = git_sync(&f.vmr_origin, &["rev-parse", "HEAD"]);
        commit_file(
            &f.product,
            VERSION_DETAILS_PATH,
            &VERSION_DETAILS.replace("SHA", &previous),
            "version details",
        );
        let vmr_head = commit_file(&f.vmr_origin, "src/runtime/lib/a.txt", "from vmr\n", "vmr change");
        commit_file(&f.vmr_origin, "src/sdk/other.txt", "elsewhere\n", "other repo");
        let vmr_head_after = git_sync(&f.vmr_origin, &["rev-parse", "HEAD"]);
        assert_ne!(vmr_head, vmr_head_after);

        let mut sub = subscription(&uri(&f.vmr_origin), &uri(&f.product), "main");
        sub.source_enabled = true;
        sub.source_directory = Some("runtime".into());
        let b = build(5, &uri(&f.vmr_origin), &vmr_head_after);

        let result = f
            .flower
            .flow_back(&sub, &b, "darc-main-2", true, &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.had_updates);
        let target = result.repo_path;
        assert_eq!(std::fs::read_to_string(target.join("lib/a.txt")).unwrap(), "from vmr\n");
        assert!(!target.join("other.txt").exists());
        let details = std::fs::read_to_string(target.join(VERSION_DETAILS_PATH)).unwrap();
        assert_eq!(version_details_source_sha(&details).as_deref(), Some(vmr_head_after.as_str()));
        assert!(details.contains(r#"BarId="5""#));
    }

    #[test]
    fn manifest_update_preserves_unknown_fields() {
        let json = r#"{"repositories":[{"path":"runtime","remoteUri":"u","commitSha":"a"}],"submodules":[{"path":"x"}]}"#;
        let updated = update_manifest_json(Some(json), "runtime", "u", "b", 9).unwrap();
        let value: serde_json::Value = serde_json::from_str(&updated).unwrap();
        assert_eq!(value["repositories"][0]["commitSha"], "b");
        assert_eq!(value["repositories"][0]["barId"], 9);
        assert_eq!(value["submodules"][0]["path"], "x");

        let added = update_manifest_json(Some(json), "sdk", "s", "c", 3).unwrap();
        let value: serde_json::Value = serde_json::from_str(&added).unwrap();
        assert_eq!(value["repositories"].as_array().unwrap().len(), 2);
    }
}
