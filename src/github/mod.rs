//! GitHub remote backed by octocrab.
//!
//! [`GitHubHost`] implements both halves of the remote interface. The
//! pull-request half covers PR lifecycle, comments, reviews, checks and the
//! commit statuses that publish merge policy results. The content half reads
//! and edits `eng/Version.Details.xml` and the VMR source manifest. Transient
//! API failures are retried with backoff before they surface as
//! [`RemoteError`](crate::remote::RemoteError)s.

mod client;
mod content;
mod error;
mod host;

pub use client::{GitHubHost, GitHubRemoteFactory, PullRequestRef, RepoRef};
pub use error::from_octocrab;
pub use host::MERGE_POLICY_CONTEXT_PREFIX;
