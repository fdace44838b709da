//! Builds and the assets they produce.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{BuildId, ChannelId, Sha};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub non_shipping: bool,
}

impl Asset {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Asset {
            name: name.into(),
            version: version.into(),
            non_shipping: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AzDoBuildInfo {
    pub account: String,
    pub project: String,
    pub build_id: u64,
    pub build_number: String,
}

/// An immutable record of a completed build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub commit: Sha,
    #[serde(default)]
    pub github_repository: Option<String>,
    #[serde(default)]
    pub github_branch: Option<String>,
    #[serde(default)]
    pub azdo_repository: Option<String>,
    #[serde(default)]
    pub azdo_branch: Option<String>,
    #[serde(default)]
    pub azdo_build: Option<AzDoBuildInfo>,
    pub date_produced: DateTime<Utc>,
    #[serde(default)]
    pub assets: Vec<Asset>,
    #[serde(default)]
    pub channels: Vec<ChannelId>,
}

impl Build {
    /// The repository the build came from, preferring GitHub.
    pub fn repository(&self) -> &str {
        self.github_repository
            .as_deref()
            .or(self.azdo_repository.as_deref())
            .unwrap_or_default()
    }

    pub fn branch(&self) -> &str {
        self.github_branch
            .as_deref()
            .or(self.azdo_branch.as_deref())
            .unwrap_or_default()
    }

    pub fn build_number(&self) -> String {
        match &self.azdo_build {
            Some(info) => info.build_number.clone(),
            None => self.id.to_string(),
        }
    }

    /// Link to the CI build results, when the build ran in Azure DevOps.
    pub fn build_link(&self) -> Option<String> {
        self.azdo_build.as_ref().map(|info| {
            format!(
                "https://dev.azure.com/{}/{}/_build/results?buildId={}",
                info.account, info.project, info.build_id
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::build;

    #[test]
    fn repository_prefers_github() {
        let mut b = build(1, "https://github.com/dotnet/arcade", "abc");
        b.azdo_repository = Some("https://dev.azure.com/dnceng/internal/_git/arcade".into());
        assert_eq!(b.repository(), "https://github.com/dotnet/arcade");
        b.github_repository = None;
        assert_eq!(b.repository(), "https://dev.azure.com/dnceng/internal/_git/arcade");
    }

    #[test]
    fn build_number_falls_back_to_id() {
        let mut b = build(42, "https://github.com/dotnet/arcade", "abc");
        assert_eq!(b.build_number(), "42");
        assert_eq!(b.build_link(), None);
        b.azdo_build = Some(AzDoBuildInfo {
            account: "dnceng".into(),
            project: "internal".into(),
            build_id: 777,
            build_number: "20240101.3".into(),
        });
        assert_eq!(b.build_number(), "20240101.3");
        assert_eq!(
            b.build_link().as_deref(),
            Some("https://dev.azure.com/dnceng/internal/_build/results?buildId=777")
        );
    }
}
