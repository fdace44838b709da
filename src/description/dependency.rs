//! Dependency-only pull requests.

use std::collections::BTreeMap;

use super::{
    build_link, changes_uri, commit_uri, format_date_produced, remove_section, repo_at_branch_uri,
    section_end_marker, section_start_marker, starting_reference_id, subscription_link,
};
use crate::types::{Build, ChannelId, CoherencyErrorDetails, DependencyUpdate, SubscriptionId};

pub const DEFAULT_HEADER: &str = "This pull request updates the following dependencies";
pub const DEPENDENCY_UPDATE_BEGIN: &str = "[DependencyUpdate]: <> (Begin)";
pub const DEPENDENCY_UPDATE_END: &str = "[DependencyUpdate]: <> (End)";
pub const COHERENCY_UPDATES_BEGIN: &str = "[marker]: <> (Begin:Coherency Updates)";
pub const COHERENCY_UPDATES_END: &str = "[marker]: <> (End:Coherency Updates)";
pub const COHERENCY_ERRORS_BEGIN: &str = "[marker]: <> (Begin:Coherency Errors)";
pub const COHERENCY_ERRORS_END: &str = "[marker]: <> (End:Coherency Errors)";

/// Message of the empty commit made when only coherency updates were wanted
/// and they could not be resolved.
pub const COHERENCY_FAILURE_MESSAGE: &str = "Failed to perform coherency update for one or more dependencies.";

/// One subscription's build contribution to a dependency PR.
#[derive(Debug, Clone, Copy)]
pub struct BuildSection<'a> {
    pub subscription_id: SubscriptionId,
    pub subscription_channel: Option<ChannelId>,
    pub source_repo: &'a str,
    pub build: &'a Build,
    pub updates: &'a [DependencyUpdate],
}

/// The full description after applying one subscription's updates.
///
/// `current` is the PR's existing description, if any. The subscription's
/// own section and the coherency sections are replaced in place; everything
/// else is kept.
pub fn dependency_description(
    current: Option<&str>,
    section: Option<BuildSection<'_>>,
    coherency_updates: &[DependencyUpdate],
    coherency_errors: &[CoherencyErrorDetails],
) -> String {
    let mut description = current.unwrap_or(DEFAULT_HEADER).trim_end().to_string();
    description.push_str("\n\n");
    let starting_id = starting_reference_id(&description);

    append_coherency_errors(&mut description, coherency_errors);
    if !coherency_updates.is_empty() {
        append_coherency_updates(&mut description, coherency_updates);
    }
    if let Some(section) = section.filter(|s| !s.updates.is_empty()) {
        append_build_section(&mut description, starting_id, &section);
    }
    description
}

/// Description for a PR whose only commit records a failed coherency update.
pub fn coherency_failure_description(head_branch: &str) -> String {
    format!(
        "Coherency update: {COHERENCY_FAILURE_MESSAGE} Please review the GitHub checks or run \
         `darc update-dependencies --coherency-only` locally against {head_branch} for more information."
    )
}

fn append_build_section(description: &mut String, starting_id: u32, section: &BuildSection<'_>) {
    let start = section_start_marker(section.subscription_id);
    let end = section_end_marker(section.subscription_id);
    let insert_at = remove_section(description, &start, &end);
    let build = section.build;
    let repo = build.repository();

    let mut out = String::new();
    out.push_str(&format!("{start}\n"));
    out.push_str(&format!("## From {}\n", section.source_repo));
    out.push_str(&format!("- **Subscription**: {}\n", subscription_link(section.subscription_id)));
    out.push_str(&format!("- **Build**: {}\n", build_link(build, section.subscription_channel)));
    out.push_str(&format!("- **Date Produced**: {}\n", format_date_produced(build.date_produced)));
    out.push_str(&format!(
        "- **Commit**: [{}]({})\n",
        build.commit,
        commit_uri(repo, build.commit.as_str()).unwrap_or_else(|| repo.to_string())
    ));
    let branch = build.branch();
    if !branch.is_empty() {
        out.push_str(&format!("- **Branch**: [{branch}]({})\n", repo_at_branch_uri(repo, branch)));
    }
    out.push_str(&format!("\n{DEPENDENCY_UPDATE_BEGIN}\n\n- **Dependency Updates**:\n"));

    // Updates sharing a commit range share one link.
    let mut links: Vec<String> = Vec::new();
    let mut range_ids: BTreeMap<(&str, &str), u32> = BTreeMap::new();
    for update in section.updates {
        let range = (update.from.commit.as_str(), update.to.commit.as_str());
        let id = *range_ids.entry(range).or_insert_with(|| {
            links.push(changes_uri(&update.to.repo_uri, range.0, range.1));
            starting_id + links.len() as u32 - 1
        });
        out.push_str(&format!(
            "  - **{}**: [from {} to {}][{id}]\n",
            update.to.name, update.from.version, update.to.version
        ));
    }
    out.push('\n');
    for (i, link) in links.iter().enumerate() {
        out.push_str(&format!("[{}]: {link}\n", starting_id + i as u32));
    }
    out.push_str(&format!("\n{DEPENDENCY_UPDATE_END}\n\n{end}\n"));

    description.insert_str(insert_at, &out);
    description.push('\n');
}

fn append_coherency_updates(description: &mut String, updates: &[DependencyUpdate]) {
    let insert_at = remove_section(description, COHERENCY_UPDATES_BEGIN, COHERENCY_UPDATES_END);

    let mut out = String::new();
    out.push_str(&format!("{COHERENCY_UPDATES_BEGIN}\n"));
    out.push_str("## Coherency Updates\n\n");
    out.push_str("The following updates ensure that dependencies with a *CoherentParentDependency*\n");
    out.push_str("attribute were produced in a build used as input to the parent dependency's build.\n");
    out.push_str(
        "See [Dependency Description Format](https://github.com/dotnet/arcade/blob/master/Documentation/DependencyDescriptionFormat.md#dependency-description-overview)\n",
    );
    out.push_str(&format!("\n{DEPENDENCY_UPDATE_BEGIN}\n\n- **Coherency Updates**:\n"));
    for update in updates {
        out.push_str(&format!(
            "  - **{}**: from {} to {} (parent: {})\n",
            update.to.name,
            update.from.version,
            update.to.version,
            update.to.coherent_parent_dependency_name.as_deref().unwrap_or_default()
        ));
    }
    out.push_str(&format!("\n{DEPENDENCY_UPDATE_END}\n\n{COHERENCY_UPDATES_END}\n"));

    description.insert_str(insert_at, &out);
    description.push('\n');
}

/// Shows unresolved coherency errors, or drops a stale error section once they are fixed.
fn append_coherency_errors(description: &mut String, errors: &[CoherencyErrorDetails]) {
    let insert_at = remove_section(description, COHERENCY_ERRORS_BEGIN, COHERENCY_ERRORS_END);
    if errors.is_empty() {
        return;
    }

    let mut out = format!("{COHERENCY_ERRORS_BEGIN}\n## Coherency Errors\n\n");
    for error in errors {
        out.push_str(&format!("- {}\n", error.error));
        for solution in &error.potential_solutions {
            out.push_str(&format!("  - {solution}\n"));
        }
    }
    out.push_str(&format!("\n{COHERENCY_ERRORS_END}\n"));

    description.insert_str(insert_at, &out);
    description.push('\n');
}

/// Commit message for a set of dependency updates.
///
/// Updates moving between the same two versions are listed on one line.
pub fn commit_message(
    source_repo: &str,
    build_number: &str,
    updates: &[DependencyUpdate],
    coherency_updates: &[DependencyUpdate],
) -> String {
    let mut message = String::new();

    if !updates.is_empty() {
        message.push_str(&format!("Update dependencies from {source_repo} build {build_number}\n"));
        for (versions, names) in group_by_versions(updates, false) {
            message.push_str(&format!("{} {versions}\n", names.join(" , ")));
        }
        message.push('\n');
    }

    if !coherency_updates.is_empty() {
        message.push_str("Dependency coherency updates\n");
        for (versions, names) in group_by_versions(coherency_updates, true) {
            message.push_str(&format!("{} {versions}\n", names.join(",")));
        }
        message.push('\n');
    }

    message
}

fn group_by_versions(updates: &[DependencyUpdate], with_parent: bool) -> Vec<(String, Vec<&str>)> {
    let mut groups: Vec<(String, Vec<&str>)> = Vec::new();
    for update in updates {
        let mut key = format!("From Version {} -> To Version {}", update.from.version, update.to.version);
        if with_parent {
            key.push_str(&format!(
                " (parent: {})",
                update.to.coherent_parent_dependency_name.as_deref().unwrap_or_default()
            ));
        }
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, names)) => names.push(&update.to.name),
            None => groups.push((key, vec![&update.to.name])),
        }
    }
    groups
}
