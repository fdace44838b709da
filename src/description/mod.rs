//! Pull request titles, descriptions and commit messages.
//!
//! Everything here is synchronous text manipulation. A description is made
//! of sections bounded by `[marker]: <> (Begin:...)`/`(End:...)` lines, so
//! one subscription's contribution to a batched PR can be replaced without
//! touching the others. Reference links (`[n]: url`) are numbered from the
//! highest number already present, never reusing one.

pub mod codeflow;
pub mod comments;
pub mod dependency;

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::types::{Build, ChannelId, SubscriptionId};

pub use codeflow::{CodeFlowSection, UpstreamRepoDiff, code_flow_description, dependency_update_block};
pub use comments::{
    OVERWRITTEN_COMMIT_MESSAGE, conflict_comment, merge_conflict_comment, overwritten_commits_comment,
};
pub use dependency::{BuildSection, commit_message, dependency_description};

/// Shas in GitHub compare links are shortened to this many characters.
pub const GITHUB_COMPARISON_SHA_LENGTH: usize = 10;

const TITLE_LENGTH_LIMIT: usize = 150;
const TITLE_DELIMITER: &str = ", ";

static REFERENCE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\[(\d+)\]:").expect("static regex"));

static LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\((https?://\S+|www\.\S+)\)").expect("static regex"));

pub fn section_start_marker(id: SubscriptionId) -> String {
    format!("[marker]: <> (Begin:{id})")
}

pub fn section_end_marker(id: SubscriptionId) -> String {
    format!("[marker]: <> (End:{id})")
}

pub fn subscription_link(id: SubscriptionId) -> String {
    format!("[{id}](https://maestro.dot.net/subscriptions?search={id})")
}

/// The first reference number free for use in `description`.
///
/// This is one more than the largest `[n]:` definition found, so gaps and
/// duplicates are never refilled. An empty description starts at 1.
pub fn starting_reference_id(description: &str) -> u32 {
    REFERENCE_ID
        .captures_iter(description)
        .filter_map(|c| c[1].parse::<u32>().ok())
        .max()
        .unwrap_or(0)
        + 1
}

/// Removes the section between `start` and `end` (inclusive).
///
/// Returns where a replacement should be inserted: the old section's position,
/// or the end of the description when either marker is missing.
pub fn remove_section(description: &mut String, start: &str, end: &str) -> usize {
    match (description.find(start), description.find(end)) {
        (Some(s), Some(e)) if e >= s => {
            description.replace_range(s..e + end.len(), "");
            s
        }
        _ => description.len(),
    }
}

fn is_github(repo: &str) -> bool {
    repo.contains("github.com")
}

fn is_azdo(repo: &str) -> bool {
    repo.contains("dev.azure.com")
}

/// A link comparing two commits of `repo`.
pub fn changes_uri(repo: &str, from_sha: &str, to_sha: &str) -> String {
    if is_github(repo) {
        let short = |s: &str| s.get(..GITHUB_COMPARISON_SHA_LENGTH).unwrap_or(s).to_string();
        return format!("{repo}/compare/{}...{}", short(from_sha), short(to_sha));
    }
    // Azure DevOps cannot compare abbreviated shas.
    format!("{repo}/branches?baseVersion=GC{from_sha}&targetVersion=GC{to_sha}&_a=files")
}

pub fn commit_uri(repo: &str, sha: &str) -> Option<String> {
    if is_github(repo) {
        Some(format!("{repo}/commit/{sha}"))
    } else if is_azdo(repo) {
        Some(format!("{repo}?_a=history&version=GC{sha}"))
    } else {
        None
    }
}

pub fn repo_at_branch_uri(repo: &str, branch: &str) -> String {
    if is_azdo(repo) {
        format!("{repo}?version=GB{branch}")
    } else {
        format!("{repo}/tree/{branch}")
    }
}

/// `github:org:repo` or `azdo:org:project:repo`, as used by the build browser.
pub fn repo_slug(repo: &str) -> Option<String> {
    if let Some(rest) = repo.strip_prefix("https://github.com/") {
        let mut parts = rest.trim_end_matches('/').split('/');
        let (org, name) = (parts.next()?, parts.next()?);
        return Some(format!("github:{org}:{name}"));
    }
    let rest = repo.strip_prefix("https://dev.azure.com/")?;
    let parts: Vec<&str> = rest.split('/').collect();
    if parts.len() >= 4 && parts[2] == "_git" {
        let name = parts[3].split('?').next().unwrap_or(parts[3]);
        return Some(format!("azdo:{}:{}:{name}", parts[0], parts[1]));
    }
    None
}

/// `[number](ci link) ([id](registry link))`, degrading to less when links are unknown.
///
/// `subscription_channel` is used when the build is on more than one channel.
pub fn build_link(build: &Build, subscription_channel: Option<ChannelId>) -> String {
    let number = build.build_number();
    let ci = match build.build_link() {
        Some(link) => format!("[{number}]({link})"),
        None => number,
    };

    let channel = match build.channels.as_slice() {
        [only] => Some(*only),
        _ => subscription_channel,
    };
    match (channel, repo_slug(build.repository())) {
        (Some(channel), Some(slug)) => format!(
            "{ci} ([{id}](https://maestro.dot.net/channel/{channel}/{slug}/build/{id}))",
            id = build.id
        ),
        _ => ci,
    }
}

pub fn format_date_produced(date: DateTime<Utc>) -> String {
    date.format("%B %-d, %Y %-I:%M:%S %p UTC").to_string()
}

fn simple_repo_name(repo: &str) -> String {
    repo.replace("https://github.com/", "")
        .replace("https://dev.azure.com/", "")
        .replace("_git/", "")
}

fn generate_title(base: &str, repos: &[&str]) -> String {
    let mut names: Vec<String> = repos.iter().map(|r| simple_repo_name(r)).collect();
    names.sort();
    names.dedup();

    let total = names.iter().map(String::len).sum::<usize>()
        + TITLE_DELIMITER.len() * names.len().saturating_sub(1)
        + base.len();
    if total > TITLE_LENGTH_LIMIT {
        return format!("{base} {} repositories", names.len());
    }
    format!("{base} {}", names.join(TITLE_DELIMITER))
}

/// Title of a dependency PR. No source repositories means a coherency-only PR.
pub fn dependency_title(target_branch: &str, source_repos: &[&str]) -> String {
    if source_repos.is_empty() {
        return format!("[{target_branch}] Update dependencies to ensure coherency");
    }
    generate_title(&format!("[{target_branch}] Update dependencies from"), source_repos)
}

pub fn code_flow_title(target_branch: &str, source_repos: &[&str]) -> String {
    generate_title(&format!("[{target_branch}] Source code updates from"), source_repos)
}

/// Replaces every `(url)` that occurs at least twice with a numbered
/// reference, appending the `[n]: url` definitions.
pub fn compress_repeated_links(description: &str) -> String {
    let mut repeated: Vec<(&str, usize)> = Vec::new();
    for m in LINK.find_iter(description) {
        match repeated.iter_mut().find(|(link, _)| *link == m.as_str()) {
            Some((_, count)) => *count += 1,
            None => repeated.push((m.as_str(), 1)),
        }
    }
    let repeated: Vec<&str> = repeated
        .into_iter()
        .filter(|(_, count)| *count >= 2)
        .map(|(link, _)| link)
        .collect();
    if repeated.is_empty() {
        return description.to_string();
    }

    let first_id = starting_reference_id(description);
    let mut out = description.to_string();
    for (i, link) in repeated.iter().enumerate() {
        out = out.replace(link, &format!("[{}]", first_id + i as u32));
    }

    out.push('\n');
    for (i, link) in repeated.iter().enumerate() {
        let url = link.trim_start_matches('(').trim_end_matches(')');
        out.push_str(&format!("[{}]: {url}\n", first_id + i as u32));
    }
    out
}
