//! Octocrab client wrapper and GitHub URL parsing.
//!
//! Repositories are addressed by their web URL (`https://github.com/o/r`),
//! pull requests by their API URL (`https://api.github.com/repos/o/r/pulls/N`),
//! which is what the host hands back from `create_pull_request`.

use std::fmt;
use std::sync::Arc;

use octocrab::Octocrab;

use crate::remote::{Remote, RemoteError, RemoteFactory, RetryConfig};

const WEB_PREFIX: &str = "https://github.com/";
const API_PREFIX: &str = "https://api.github.com/repos/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub repo: String,
}

impl RepoRef {
    /// Parses `https://github.com/{owner}/{repo}`, tolerating a trailing `.git`
    /// or slash.
    pub fn parse(url: &str) -> Result<Self, RemoteError> {
        let path = url
            .strip_prefix(WEB_PREFIX)
            .ok_or_else(|| RemoteError::permanent(format!("not a GitHub repository URL: {url}")))?;
        let path = path.trim_end_matches('/');
        let path = path.strip_suffix(".git").unwrap_or(path);
        match path.split('/').collect::<Vec<_>>().as_slice() {
            [owner, repo] if !owner.is_empty() && !repo.is_empty() => Ok(RepoRef {
                owner: owner.to_string(),
                repo: repo.to_string(),
            }),
            _ => Err(RemoteError::permanent(format!("not a GitHub repository URL: {url}"))),
        }
    }

    pub fn api_path(&self) -> String {
        format!("/repos/{}/{}", self.owner, self.repo)
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestRef {
    pub repo: RepoRef,
    pub number: u64,
}

impl PullRequestRef {
    pub fn parse(url: &str) -> Result<Self, RemoteError> {
        let invalid = || RemoteError::permanent(format!("not a GitHub pull request URL: {url}"));
        let path = url.strip_prefix(API_PREFIX).ok_or_else(invalid)?;
        match path.split('/').collect::<Vec<_>>().as_slice() {
            [owner, repo, "pulls", number] if !owner.is_empty() && !repo.is_empty() => Ok(PullRequestRef {
                repo: RepoRef {
                    owner: owner.to_string(),
                    repo: repo.to_string(),
                },
                number: number.parse().map_err(|_| invalid())?,
            }),
            _ => Err(invalid()),
        }
    }

    pub fn url(&self) -> String {
        format!("{API_PREFIX}{}/{}/pulls/{}", self.repo.owner, self.repo.repo, self.number)
    }

    pub fn api_path(&self) -> String {
        format!("{}/pulls/{}", self.repo.api_path(), self.number)
    }

    pub fn issue_path(&self) -> String {
        format!("{}/issues/{}", self.repo.api_path(), self.number)
    }
}

/// A GitHub remote: pull requests and repository content.
#[derive(Clone)]
pub struct GitHubHost {
    pub(super) client: Octocrab,
    pub(super) retry: RetryConfig,
}

impl GitHubHost {
    pub fn new(client: Octocrab) -> Self {
        GitHubHost {
            client,
            retry: RetryConfig::DEFAULT,
        }
    }

    pub fn from_token(token: impl Into<String>) -> Result<Self, octocrab::Error> {
        let client = Octocrab::builder().personal_token(token.into()).build()?;
        Ok(Self::new(client))
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl fmt::Debug for GitHubHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitHubHost")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Serves every `https://github.com/` repository from one host.
pub struct GitHubRemoteFactory {
    host: Arc<GitHubHost>,
}

impl GitHubRemoteFactory {
    pub fn new(host: GitHubHost) -> Self {
        GitHubRemoteFactory { host: Arc::new(host) }
    }
}

impl RemoteFactory for GitHubRemoteFactory {
    fn remote_for(&self, repo: &str) -> Result<Arc<dyn Remote>, RemoteError> {
        RepoRef::parse(repo)?;
        Ok(Arc::clone(&self.host) as Arc<dyn Remote>)
    }
}
