//! Computes which dependency versions a build should bump.
//!
//! Two passes:
//!
//! 1. [`get_required_non_coherency_updates`] matches build assets to manifest
//!    entries by name and proposes moving them to the build's version, repo
//!    and commit.
//! 2. [`CoherencyUpdateResolver::get_required_coherency_updates`] re-resolves
//!    every entry pinned to a coherent parent, by reading the parent's own
//!    manifest at the parent's commit.
//!
//! Asset exclusion ([`AssetMatcher`]) is applied by the caller before either
//! pass runs.

pub mod matcher;

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::remote::{RemoteError, RemoteFactory};
use crate::types::{Asset, CoherencyErrorDetails, DependencyDetail, DependencyUpdate};

pub use matcher::AssetMatcher;

#[derive(Debug, Error)]
pub enum ResolverError {
    /// One or more coherent dependencies cannot be satisfied.
    #[error("coherency update failed: {}", .0.iter().map(|e| e.error.as_str()).collect::<Vec<_>>().join("; "))]
    Coherency(Vec<CoherencyErrorDetails>),

    #[error("Dependency {name} has non-existent parent dependency {parent}")]
    MissingParent { name: String, parent: String },

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

pub type Result<T> = std::result::Result<T, ResolverError>;

/// Proposes bumping every manifest entry that names one of `assets`.
///
/// Entries with a coherent parent are left to the coherency pass, pinned
/// entries are never touched, and an entry already at the asset's exact
/// name, version, commit and repo is skipped. Names match
/// case-insensitively, but the asset's casing wins in the result.
pub fn get_required_non_coherency_updates(
    source_repo: &str,
    source_commit: &str,
    assets: &[&Asset],
    dependencies: &[DependencyDetail],
) -> Vec<DependencyUpdate> {
    let mut to_update: Vec<DependencyUpdate> = Vec::new();

    for asset in assets {
        let Some(matching) = dependencies
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(&asset.name) && !d.has_coherent_parent())
        else {
            continue;
        };

        if matching.pinned {
            continue;
        }

        // A build may carry several assets of the same name.
        if to_update.iter().any(|u| u.from == *matching) {
            continue;
        }

        if matching.name == asset.name
            && matching.version == asset.version
            && matching.commit == source_commit
            && matching.repo_uri == source_repo
        {
            continue;
        }

        let mut updated = matching.clone();
        updated.commit = source_commit.to_string();
        updated.repo_uri = source_repo.to_string();
        updated.version = asset.version.clone();
        updated.name = asset.name.clone();

        to_update.push(DependencyUpdate {
            from: matching.clone(),
            to: updated,
        });
    }

    to_update
}

/// Leaves of the coherency trees: entries with a coherent parent that no
/// unpinned entry points to.
///
/// With `X->Y` meaning "X's coherent parent is Y":
/// - `A->B->C->D`: `A`.
/// - `A(pinned)->B->C`: `A` and `B`.
/// - `A(pinned)->B(pinned)->C`: `A` and `B`, and neither walk moves anything.
fn leaves_of_coherency_trees(dependencies: &[DependencyDetail]) -> Vec<&DependencyDetail> {
    dependencies
        .iter()
        .filter(|d| d.has_coherent_parent())
        .filter(|leaf| {
            !dependencies.iter().any(|other| {
                !other.pinned
                    && other
                        .coherent_parent_dependency_name
                        .as_deref()
                        .is_some_and(|p| p.eq_ignore_ascii_case(&leaf.name))
            })
        })
        .collect()
}

fn find_by_name<'a>(dependencies: &'a [DependencyDetail], name: &str) -> Option<&'a DependencyDetail> {
    dependencies.iter().find(|d| d.name.eq_ignore_ascii_case(name))
}

/// Resolves coherent-parent constraints against the parents' manifests.
pub struct CoherencyUpdateResolver {
    remotes: Arc<dyn RemoteFactory>,
}

impl CoherencyUpdateResolver {
    pub fn new(remotes: Arc<dyn RemoteFactory>) -> Self {
        CoherencyUpdateResolver { remotes }
    }

    /// Strict coherency: a dependency with coherent parent `P` must be at the
    /// version `P`'s repository declares at `P`'s commit.
    ///
    /// Chains (`A->B->C`) are walked to their head and updated from the head
    /// down, so each link sees its parent's already-updated commit. A parent
    /// that does not declare the dependency is a coherency error; all such
    /// errors are collected and returned together.
    #[instrument(skip_all, fields(dependencies = dependencies.len()))]
    pub async fn get_required_coherency_updates(
        &self,
        dependencies: &[DependencyDetail],
    ) -> Result<Vec<DependencyUpdate>> {
        let mut to_update: Vec<DependencyUpdate> = Vec::new();
        let leaves = leaves_of_coherency_trees(dependencies);
        if leaves.is_empty() {
            return Ok(to_update);
        }

        let mut errors: Vec<(String, CoherencyErrorDetails)> = Vec::new();
        // Keyed by "{repo}@{commit}".
        let mut manifest_cache: HashMap<String, Vec<DependencyDetail>> = HashMap::new();

        for leaf in leaves {
            let mut stack: Vec<&DependencyDetail> = Vec::new();
            let mut current = leaf;
            while let Some(parent_name) = current.coherent_parent_dependency_name.as_deref() {
                if current.pinned {
                    break;
                }
                stack.push(current);
                current = find_by_name(dependencies, parent_name).ok_or_else(|| {
                    ResolverError::MissingParent {
                        name: current.name.clone(),
                        parent: parent_name.to_string(),
                    }
                })?;
            }

            while let Some(dependency) = stack.pop() {
                let Some(parent_name) = dependency.coherent_parent_dependency_name.as_deref() else {
                    continue;
                };

                // The parent may itself have been updated earlier in this pass.
                let parent = to_update
                    .iter()
                    .map(|u| &u.to)
                    .find(|d| d.name.eq_ignore_ascii_case(parent_name))
                    .or_else(|| find_by_name(dependencies, parent_name))
                    .cloned()
                    .ok_or_else(|| ResolverError::MissingParent {
                        name: dependency.name.clone(),
                        parent: parent_name.to_string(),
                    })?;

                let cache_key = format!("{}@{}", parent.repo_uri, parent.commit);
                if !manifest_cache.contains_key(&cache_key) {
                    let remote = self.remotes.remote_for(&parent.repo_uri)?;
                    let parent_dependencies = remote
                        .get_dependencies(&parent.repo_uri, &parent.commit, None)
                        .await?;
                    manifest_cache.insert(cache_key.clone(), parent_dependencies);
                }
                let parent_dependencies = manifest_cache
                    .get(&cache_key)
                    .map(Vec::as_slice)
                    .unwrap_or_default();

                let Some(cpd_dependency) = find_by_name(parent_dependencies, &dependency.name) else {
                    let error_key = format!("{}{}{}", parent.repo_uri, parent.commit, dependency.name);
                    if !errors.iter().any(|(k, _)| *k == error_key) {
                        errors.push((
                            error_key,
                            CoherencyErrorDetails {
                                error: format!(
                                    "{} @ {} does not contain dependency {}",
                                    parent.repo_uri, parent.commit, dependency.name
                                ),
                                potential_solutions: Vec::new(),
                            },
                        ));
                    }
                    // Anything further up this chain depended on this link.
                    stack.clear();
                    continue;
                };

                if dependency.same_resolution(cpd_dependency) {
                    debug!(dependency = %dependency.name, "Coherent dependency already up to date");
                    continue;
                }

                info!(
                    dependency = %dependency.name,
                    version = %cpd_dependency.version,
                    repo = %cpd_dependency.repo_uri,
                    commit = %cpd_dependency.commit,
                    "Coherent dependency will be updated"
                );

                let mut updated = dependency.clone();
                updated.name = cpd_dependency.name.clone();
                updated.version = cpd_dependency.version.clone();
                updated.repo_uri = cpd_dependency.repo_uri.clone();
                updated.commit = cpd_dependency.commit.clone();

                to_update.push(DependencyUpdate {
                    from: dependency.clone(),
                    to: updated,
                });
            }
        }

        if !errors.is_empty() {
            return Err(ResolverError::Coherency(
                errors.into_iter().map(|(_, e)| e).collect(),
            ));
        }

        Ok(to_update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeRemote, FakeRemoteFactory, arb_dependency};
    use proptest::prelude::*;

    const SOURCE: &str = "https://github.com/dotnet/arcade";

    fn dep(name: &str, version: &str, repo: &str, commit: &str) -> DependencyDetail {
        DependencyDetail::new(name, version, repo, commit)
    }

    fn coherent(name: &str, version: &str, repo: &str, commit: &str, parent: &str) -> DependencyDetail {
        let mut d = dep(name, version, repo, commit);
        d.coherent_parent_dependency_name = Some(parent.to_string());
        d
    }

    // ─── Non-coherency ────────────────────────────────────────────────────────

    #[test]
    fn bumps_matching_dependency() {
        let deps = vec![dep("Ham", "1.0.0-beta.1", SOURCE, "old")];
        let asset = Asset::new("Ham", "1.0.1-beta.1");
        let updates = get_required_non_coherency_updates(SOURCE, "new", &[&asset], &deps);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].from.version, "1.0.0-beta.1");
        assert_eq!(updates[0].to.version, "1.0.1-beta.1");
        assert_eq!(updates[0].to.commit, "new");
    }

    #[test]
    fn name_match_is_case_insensitive_and_corrects_casing() {
        let deps = vec![dep("ham", "1.0.0", SOURCE, "sha")];
        let asset = Asset::new("Ham", "1.0.0");
        let updates = get_required_non_coherency_updates(SOURCE, "sha", &[&asset], &deps);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].to.name, "Ham");
    }

    #[test]
    fn pinned_and_coherent_entries_are_skipped() {
        let mut pinned = dep("Pinned", "1.0.0", SOURCE, "a");
        pinned.pinned = true;
        let child = coherent("Child", "1.0.0", SOURCE, "a", "Pinned");
        let deps = vec![pinned, child];
        let assets = [Asset::new("Pinned", "2.0.0"), Asset::new("Child", "2.0.0")];
        let refs: Vec<&Asset> = assets.iter().collect();
        assert!(get_required_non_coherency_updates(SOURCE, "b", &refs, &deps).is_empty());
    }

    #[test]
    fn duplicate_assets_update_once() {
        let deps = vec![dep("Ham", "1.0.0", SOURCE, "a")];
        let assets = [Asset::new("Ham", "2.0.0"), Asset::new("Ham", "2.0.0")];
        let refs: Vec<&Asset> = assets.iter().collect();
        assert_eq!(get_required_non_coherency_updates(SOURCE, "b", &refs, &deps).len(), 1);
    }

    proptest! {
        #[test]
        fn unmatched_dependencies_are_untouched(
            deps in prop::collection::vec(arb_dependency(), 0..8),
        ) {
            let asset = Asset::new("Definitely.Not.Present.Anywhere", "9.9.9");
            let updates = get_required_non_coherency_updates(SOURCE, "x", &[&asset], &deps);
            prop_assert!(updates.is_empty());
        }

        #[test]
        fn already_current_dependency_needs_no_update(d in arb_dependency()) {
            let mut d = d;
            d.pinned = false;
            d.coherent_parent_dependency_name = None;
            let asset = Asset::new(d.name.clone(), d.version.clone());
            let updates = get_required_non_coherency_updates(&d.repo_uri, &d.commit, &[&asset], std::slice::from_ref(&d));
            prop_assert!(updates.is_empty());
        }
    }

    // ─── Coherency ────────────────────────────────────────────────────────────

    #[test]
    fn leaves_skip_entries_pointed_to_by_unpinned_children() {
        let deps = vec![
            dep("A", "1", SOURCE, "a"),
            coherent("B", "1", SOURCE, "a", "A"),
            coherent("C", "1", SOURCE, "a", "B"),
        ];
        let leaves: Vec<_> = leaves_of_coherency_trees(&deps).iter().map(|d| d.name.clone()).collect();
        assert_eq!(leaves, vec!["C"]);
    }

    #[tokio::test]
    async fn coherent_child_follows_parent_manifest() {
        let remote = FakeRemote::new();
        remote.set_dependencies(
            "https://github.com/dotnet/runtime",
            "rt-sha",
            vec![dep("Child", "5.0.0", "https://github.com/dotnet/child", "child-sha")],
        );
        let resolver = CoherencyUpdateResolver::new(FakeRemoteFactory::single(remote));
        let deps = vec![
            dep("Parent", "5.0.0", "https://github.com/dotnet/runtime", "rt-sha"),
            coherent("Child", "4.0.0", "https://github.com/dotnet/child", "old", "Parent"),
        ];

        let updates = resolver.get_required_coherency_updates(&deps).await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].to.version, "5.0.0");
        assert_eq!(updates[0].to.commit, "child-sha");
        assert_eq!(updates[0].to.coherent_parent_dependency_name.as_deref(), Some("Parent"));
    }

    #[tokio::test]
    async fn chain_updates_use_already_updated_parent() {
        let remote = FakeRemote::new();
        remote.set_dependencies(
            "https://github.com/r/a",
            "a1",
            vec![dep("B", "2", "https://github.com/r/b", "b2")],
        );
        remote.set_dependencies(
            "https://github.com/r/b",
            "b2",
            vec![dep("C", "3", "https://github.com/r/c", "c3")],
        );
        let resolver = CoherencyUpdateResolver::new(FakeRemoteFactory::single(remote));
        let deps = vec![
            dep("A", "1", "https://github.com/r/a", "a1"),
            coherent("B", "1", "https://github.com/r/b", "b1", "A"),
            coherent("C", "1", "https://github.com/r/c", "c1", "B"),
        ];

        let updates = resolver.get_required_coherency_updates(&deps).await.unwrap();
        let names: Vec<_> = updates.iter().map(|u| (u.to.name.as_str(), u.to.version.as_str())).collect();
        assert_eq!(names, vec![("B", "2"), ("C", "3")]);
    }

    #[tokio::test]
    async fn parent_missing_dependency_is_coherency_error() {
        let remote = FakeRemote::new();
        remote.set_dependencies("https://github.com/r/a", "a1", vec![]);
        let resolver = CoherencyUpdateResolver::new(FakeRemoteFactory::single(remote));
        let deps = vec![
            dep("A", "1", "https://github.com/r/a", "a1"),
            coherent("B", "1", "https://github.com/r/b", "b1", "A"),
        ];

        match resolver.get_required_coherency_updates(&deps).await {
            Err(ResolverError::Coherency(errors)) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(
                    errors[0].error,
                    "https://github.com/r/a @ a1 does not contain dependency B"
                );
                assert!(errors[0].potential_solutions.is_empty());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn nonexistent_parent_is_hard_error() {
        let resolver = CoherencyUpdateResolver::new(FakeRemoteFactory::single(FakeRemote::new()));
        let deps = vec![coherent("B", "1", "https://github.com/r/b", "b1", "Ghost")];
        assert!(matches!(
            resolver.get_required_coherency_updates(&deps).await,
            Err(ResolverError::MissingParent { .. })
        ));
    }
}
