//! Comments posted on code flow pull requests.

use std::fmt::Write;

use super::{commit_uri, repo_at_branch_uri};
use crate::policy::notifier::parse_tags;
use crate::types::{Subscription, SubscriptionUpdateWorkItem};

pub const OVERWRITTEN_COMMIT_MESSAGE: &str =
    "Stopping code flow updates for this pull request as the following commits would get overwritten:";

/// Link to `repo` at `sha`, falling back to the bare repository URL.
pub fn repo_at_commit_uri(repo: &str, sha: &str) -> String {
    commit_uri(repo, sha).unwrap_or_else(|| repo.to_string())
}

/// Posted when a flow cannot be applied to the PR branch.
///
/// `pr_is_empty` is true when the PR has no flowed changes yet, so the only
/// way forward is resolving the conflict.
pub fn conflict_comment(
    update: &SubscriptionUpdateWorkItem,
    subscription: &Subscription,
    conflicted_files: &[String],
    head_branch: &str,
    pr_is_empty: bool,
) -> String {
    let mut comment = String::new();
    comment.push_str(if pr_is_empty {
        "# :rotating_light: Action Required: conflict detected\n"
    } else {
        "# :stop_sign: Codeflow Paused: conflict detected\n"
    });
    let _ = writeln!(
        comment,
        "A conflict was detected when trying to update this PR with changes from build `{}` of {}.",
        update.build_id,
        repo_at_commit_uri(&update.source_repo, &update.source_sha)
    );
    if !pr_is_empty {
        comment.push_str(
            "\n**:bulb: You can either merge the PR without getting these new updates \
             or manually flow them in and resolve the conflicts so that automated codeflow can resume for this PR.**\n",
        );
    }
    comment.push('\n');

    let tags = subscription
        .pull_request_failure_notification_tags
        .as_deref()
        .map(parse_tags)
        .unwrap_or_default();
    if !tags.is_empty() {
        let _ = writeln!(comment, "{} please help resolve the conflict in this PR.\n", tags.join("\n"));
    }

    comment.push_str("The conflicts in the following files need to be manually resolved:\n");
    for file in relevant_files(subscription, conflicted_files) {
        let _ = writeln!(comment, " - `{file}`");
        if let Some(uri) = repo_file_uri(update, subscription, head_branch, file) {
            let _ = writeln!(comment, "     *View file in [{}]({uri})*", repo_name(repo_of(update, subscription)));
        }
    }

    let _ = write!(
        comment,
        "\n#### :information_source: To resolve the conflicts:\n\
         1. Check out `{head_branch}` of {target}\n\
         2. Run `darc vmr resolve-conflict --subscription {id}`\n\
         3. Resolve the conflicts, commit and push the changes\n\
         4. Once pushed, the `Codeflow verification` check will turn green. \
         If not, a new build might have flown into the PR and you might need to run the command again.\n",
        target = subscription.target_repository,
        id = subscription.id,
    );
    comment
}

/// Posted when a successful flow still conflicts with the target branch.
pub fn merge_conflict_comment(subscription: &Subscription, conflicted_files: &[String]) -> String {
    let mut comment = format!(
        "> [!WARNING]\n> This pull request is in conflict with `{}`. \
         The following files need to be resolved before it can be merged:\n",
        subscription.target_branch
    );
    for file in conflicted_files {
        let _ = writeln!(comment, "> - `{file}`");
    }
    comment
}

/// Posted once when re-synchronising would drop commits pushed by hand.
pub fn overwritten_commits_comment(commits: &[String]) -> String {
    let mut comment = format!("{OVERWRITTEN_COMMIT_MESSAGE}\n");
    for commit in commits {
        let _ = writeln!(comment, "- {commit}");
    }
    comment.push_str("\nCodeflow will resume after this PR is merged or closed.\n");
    comment
}

/// Forward-flow conflicts are reported relative to the product directory.
fn relevant_files<'a>(subscription: &Subscription, files: &'a [String]) -> Vec<&'a str> {
    let Some(dir) = subscription.target_directory.as_deref().filter(|_| subscription.is_forward_flow()) else {
        return files.iter().map(String::as_str).collect();
    };
    let prefix = format!("src/{dir}/");
    files
        .iter()
        .filter_map(|f| f.strip_prefix(prefix.as_str()))
        .collect()
}

fn repo_of<'a>(update: &'a SubscriptionUpdateWorkItem, subscription: &'a Subscription) -> &'a str {
    if subscription.is_backflow() {
        &subscription.target_repository
    } else {
        &update.source_repo
    }
}

fn repo_file_uri(
    update: &SubscriptionUpdateWorkItem,
    subscription: &Subscription,
    head_branch: &str,
    file: &str,
) -> Option<String> {
    if subscription.is_backflow() {
        Some(format!("{}/{file}", repo_at_branch_uri(&subscription.target_repository, head_branch)))
    } else if subscription.is_forward_flow() {
        commit_uri(&update.source_repo, &update.source_sha)
            .map(|uri| format!("{}/{file}", uri.replacen("/commit/", "/blob/", 1)))
    } else {
        None
    }
}

fn repo_name(repo: &str) -> &str {
    repo.strip_prefix("https://github.com/").unwrap_or(repo)
}
