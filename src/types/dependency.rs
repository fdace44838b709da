//! Dependency manifest entries, dependency bumps and VMR source manifests.

use serde::{Deserialize, Serialize};

use super::ids::BuildId;

/// Kind of a dependency in the target repository's manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    #[default]
    Product,
    Toolset,
}

/// One entry of a repository's dependency manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyDetail {
    pub name: String,
    pub version: String,
    pub repo_uri: String,
    pub commit: String,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub dependency_type: DependencyType,
    /// The dependency whose source commit this one must stay coherent with.
    #[serde(default)]
    pub coherent_parent_dependency_name: Option<String>,
}

impl DependencyDetail {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        repo_uri: impl Into<String>,
        commit: impl Into<String>,
    ) -> Self {
        DependencyDetail {
            name: name.into(),
            version: version.into(),
            repo_uri: repo_uri.into(),
            commit: commit.into(),
            pinned: false,
            dependency_type: DependencyType::Product,
            coherent_parent_dependency_name: None,
        }
    }

    pub fn has_coherent_parent(&self) -> bool {
        self.coherent_parent_dependency_name.is_some()
    }

    /// Case-sensitive equality on the fields an update can change.
    pub fn same_resolution(&self, other: &DependencyDetail) -> bool {
        self.name == other.name
            && self.version == other.version
            && self.commit == other.commit
            && self.repo_uri == other.repo_uri
    }
}

/// A proposed bump of one dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyUpdate {
    pub from: DependencyDetail,
    pub to: DependencyDetail,
}

/// Flat record of a dependency bump, as persisted in pull request state.
///
/// `None` on the `from` side means the dependency was added; `None` on the
/// `to` side means it was removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyUpdateSummary {
    pub dependency_name: String,
    pub from_version: Option<String>,
    pub to_version: Option<String>,
    pub from_commit_sha: Option<String>,
    pub to_commit_sha: Option<String>,
}

impl From<&DependencyUpdate> for DependencyUpdateSummary {
    fn from(update: &DependencyUpdate) -> Self {
        DependencyUpdateSummary {
            dependency_name: update.to.name.clone(),
            from_version: Some(update.from.version.clone()),
            to_version: Some(update.to.version.clone()),
            from_commit_sha: Some(update.from.commit.clone()),
            to_commit_sha: Some(update.to.commit.clone()),
        }
    }
}

/// The VMR commit a product repository was last backflowed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDependency {
    pub uri: String,
    pub sha: String,
    #[serde(default)]
    pub bar_id: Option<BuildId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryRecord {
    pub path: String,
    pub remote_uri: String,
    pub commit_sha: String,
    #[serde(default)]
    pub bar_id: Option<BuildId>,
}

/// `src/source-manifest.json` of the VMR: which commit of each product
/// repository is currently synchronized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SourceManifest {
    #[serde(default)]
    pub repositories: Vec<RepositoryRecord>,
}

impl SourceManifest {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// The record mapped to the given VMR directory (`path`).
    pub fn repo_version(&self, path: &str) -> Option<&RepositoryRecord> {
        self.repositories.iter().find(|r| r.path == path)
    }

    pub fn by_remote_uri(&self, uri: &str) -> Option<&RepositoryRecord> {
        self.repositories
            .iter()
            .find(|r| r.remote_uri.eq_ignore_ascii_case(uri))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_parses_vmr_layout() {
        let json = r#"{
            "repositories": [
                {"path": "arcade", "remoteUri": "https://github.com/dotnet/arcade", "commitSha": "aaa", "barId": 12},
                {"path": "runtime", "remoteUri": "https://github.com/dotnet/runtime", "commitSha": "bbb"}
            ],
            "submodules": []
        }"#;
        let manifest = SourceManifest::from_json(json).unwrap();
        assert_eq!(manifest.repositories.len(), 2);
        assert_eq!(manifest.repo_version("arcade").unwrap().bar_id, Some(BuildId(12)));
        assert_eq!(manifest.repo_version("runtime").unwrap().bar_id, None);
        assert!(manifest.by_remote_uri("https://github.com/DOTNET/runtime").is_some());
        assert!(manifest.repo_version("sdk").is_none());
    }

    #[test]
    fn summary_from_update_takes_both_sides() {
        let from = DependencyDetail::new("Ham", "1.0.0", "https://github.com/a/b", "111");
        let to = DependencyDetail::new("Ham", "1.0.1", "https://github.com/a/b", "222");
        let summary = DependencyUpdateSummary::from(&DependencyUpdate { from, to });
        assert_eq!(summary.from_version.as_deref(), Some("1.0.0"));
        assert_eq!(summary.to_commit_sha.as_deref(), Some("222"));
    }
}
