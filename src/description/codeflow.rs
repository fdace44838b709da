//! Code-flow pull requests.

use serde::{Deserialize, Serialize};

use super::{
    build_link, changes_uri, commit_uri, compress_repeated_links, format_date_produced, repo_at_branch_uri,
    section_end_marker, section_start_marker, subscription_link,
};
use crate::types::{Build, DependencyUpdateSummary, Subscription};

pub const CODE_FLOW_FAQ_URI: &str = "https://github.com/dotnet/dotnet/tree/main/docs/Codeflow-PRs.md";
pub const FOOTER_START: &str = "[marker]: <> (Start:Footer:CodeFlow PR)";
pub const FOOTER_END: &str = "[marker]: <> (End:Footer:CodeFlow PR)";
pub const NOT_AVAILABLE: &str = "Not available";

/// How one source repository moved between two VMR states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamRepoDiff {
    pub repo_uri: String,
    pub old_commit_sha: String,
    pub new_commit_sha: String,
}

#[derive(Debug, Clone, Copy)]
pub struct CodeFlowSection<'a> {
    pub subscription: &'a Subscription,
    pub build: &'a Build,
    /// Source commit flowed by the previous update, if there was one.
    pub previous_source_commit: Option<&'a str>,
    pub dependency_updates: &'a [DependencyUpdateSummary],
}

pub fn code_flow_description(
    section: &CodeFlowSection<'_>,
    head_branch: &str,
    upstream_diffs: &[UpstreamRepoDiff],
    current: Option<&str>,
) -> String {
    let body = subscription_section(section);
    let id = section.subscription.id;

    let description = match current.filter(|c| !c.is_empty()) {
        None => {
            let origin = if section.subscription.is_forward_flow() {
                "the source repo"
            } else {
                "the VMR"
            };
            format!(
                "\n> [!NOTE]\n\
                 > This is a codeflow update. It may contain both source code changes from\n\
                 > [{origin}]({repo})\n\
                 > as well as dependency updates. Learn more [here]({CODE_FLOW_FAQ_URI}).\n\
                 \n\
                 This pull request brings the following source code changes\n{body}",
                repo = section.build.repository(),
            )
        }
        Some(current) => {
            let start = section_start_marker(id);
            let end = section_end_marker(id);
            let start_cut = current.find(&start).unwrap_or(current.len());
            let end_cut = current.find(&end).map_or(current.len(), |e| e + end.len());
            // A missing start marker appends; an end marker before the start is ignored.
            let end_cut = end_cut.max(start_cut);
            format!("{}{body}{}", &current[..start_cut], &current[end_cut..])
        }
    };

    let description = compress_repeated_links(&description);
    with_footer(
        description,
        section.build,
        &section.subscription.target_repository,
        head_branch,
        upstream_diffs,
    )
}

fn subscription_section(section: &CodeFlowSection<'_>) -> String {
    let build = section.build;
    let repo = build.repository();
    let branch = build.branch();
    let id = section.subscription.id;

    format!(
        "\n{start}\n\n\
         ## From {repo}\n\
         - **Subscription**: {subscription}\n\
         - **Build**: {build_link}\n\
         - **Date Produced**: {date}\n\
         - **Commit**: [{commit}]({commit_link})\n\
         - **Commit Diff**: {diff}\n\
         - **Branch**: [{branch}]({branch_link})\n\
         {updates}\n\
         {end}\n",
        start = section_start_marker(id),
        subscription = subscription_link(id),
        build_link = build_link(build, Some(section.subscription.channel_id)),
        date = format_date_produced(build.date_produced),
        commit = build.commit,
        commit_link = commit_uri(repo, build.commit.as_str()).unwrap_or_else(|| repo.to_string()),
        diff = source_diff_link(build, section.previous_source_commit),
        branch_link = repo_at_branch_uri(repo, branch),
        updates = dependency_update_block(section.dependency_updates, repo),
        end = section_end_marker(id),
    )
}

fn source_diff_link(build: &Build, previous: Option<&str>) -> String {
    let Some(previous) = previous.filter(|p| !p.is_empty()) else {
        return NOT_AVAILABLE.to_string();
    };
    let short = |s: &str| s.get(..7).unwrap_or(s).to_string();
    let text = format!("{}...{}", short(previous), build.commit.short());

    if let Some(gh) = build.github_repository.as_deref().filter(|r| !r.is_empty()) {
        format!("[{text}]({gh}/compare/{previous}...{})", build.commit)
    } else if let Some(azdo) = build.azdo_repository.as_deref().filter(|r| !r.is_empty()) {
        format!(
            "[{text}]({azdo}/branchCompare?baseVersion=GC{previous}&targetVersion=GC{}&_a=files)",
            build.commit
        )
    } else {
        NOT_AVAILABLE.to_string()
    }
}

fn dependency_link(repo: &str, from: Option<&str>, to: Option<&str>) -> String {
    match (from.filter(|s| !s.is_empty()), to.filter(|s| !s.is_empty())) {
        (Some(from), Some(to)) => changes_uri(repo, from, to),
        (None, Some(to)) => commit_uri(repo, to).unwrap_or_default(),
        _ => String::new(),
    }
}

/// New, removed and updated dependencies, grouped by identical version and commit moves.
pub fn dependency_update_block(updates: &[DependencyUpdateSummary], repo: &str) -> String {
    if updates.is_empty() {
        return String::new();
    }

    type Key<'a> = (Option<&'a str>, Option<&'a str>, Option<&'a str>, Option<&'a str>);
    let mut groups: Vec<(Key<'_>, Vec<&DependencyUpdateSummary>)> = Vec::new();
    for update in updates {
        let key = (
            update.from_commit_sha.as_deref(),
            update.from_version.as_deref().filter(|v| !v.is_empty()),
            update.to_commit_sha.as_deref(),
            update.to_version.as_deref().filter(|v| !v.is_empty()),
        );
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(update),
            None => groups.push((key, vec![update])),
        }
    }
    for (_, members) in &mut groups {
        members.sort_by(|a, b| a.dependency_name.cmp(&b.dependency_name));
    }

    let mut out = String::new();
    let mut write_kind = |title: &str, header: &dyn Fn(&Key<'_>) -> String, wanted: &dyn Fn(&Key<'_>) -> bool| {
        let matching: Vec<_> = groups.iter().filter(|(k, _)| wanted(k)).collect();
        if matching.is_empty() {
            return;
        }
        out.push_str(&format!("\n**{title}**\n"));
        for (key, members) in matching {
            out.push_str(&format!("{}\n", header(key)));
            for member in members {
                out.push_str(&format!("  - {}\n", member.dependency_name));
            }
        }
    };

    write_kind(
        "New Dependencies",
        &|k| format!("- Added [{}]({})", k.3.unwrap_or_default(), dependency_link(repo, k.0, k.2)),
        &|k| k.1.is_none() && k.3.is_some(),
    );
    write_kind(
        "Removed Dependencies",
        &|k| format!("- Removed {}", k.1.unwrap_or_default()),
        &|k| k.1.is_some() && k.3.is_none(),
    );
    write_kind(
        "Updated Dependencies",
        &|k| {
            format!(
                "- From [{} to {}]({})",
                k.1.unwrap_or_default(),
                k.3.unwrap_or_default(),
                dependency_link(repo, k.0, k.2)
            )
        },
        &|k| k.1.is_some() && k.3.is_some(),
    );
    out
}

fn with_footer(
    mut description: String,
    build: &Build,
    target_repository: &str,
    head_branch: &str,
    upstream_diffs: &[UpstreamRepoDiff],
) -> String {
    if let (Some(start), Some(end)) = (description.find(FOOTER_START), description.find(FOOTER_END)) {
        if end >= start {
            description.replace_range(start..end + FOOTER_END.len(), "");
        }
    }

    description.push_str(&format!("{FOOTER_START}\n\n"));
    let upstream: Vec<_> = upstream_diffs
        .iter()
        .filter(|d| !d.repo_uri.is_empty() && !d.old_commit_sha.is_empty() && !d.new_commit_sha.is_empty())
        .collect();
    if !upstream_diffs.is_empty() {
        description.push_str("## Associated changes in source repos\n");
        for diff in upstream {
            description.push_str(&format!(
                "- {}/compare/{}...{}\n",
                diff.repo_uri.trim_end_matches('/'),
                diff.old_commit_sha,
                diff.new_commit_sha
            ));
        }
        description.push('\n');
    }

    description.push_str(&format!(
        "<details>\n\
         <summary>Diff the source with this PR branch</summary>\n\
         \n\
         ```bash\n\
         darc vmr diff --name-only {}:{}..{target_repository}:{head_branch}\n\
         ```\n\
         </details>\n\n",
        build.repository(),
        build.commit,
    ));
    description.push_str(FOOTER_END);
    description
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{build, subscription};

    fn summary(name: &str, from: Option<(&str, &str)>, to: Option<(&str, &str)>) -> DependencyUpdateSummary {
        DependencyUpdateSummary {
            dependency_name: name.into(),
            from_version: from.map(|f| f.0.into()),
            from_commit_sha: from.map(|f| f.1.into()),
            to_version: to.map(|t| t.0.into()),
            to_commit_sha: to.map(|t| t.1.into()),
        }
    }

    fn forward_subscription() -> Subscription {
        let mut sub = subscription("https://github.com/dotnet/runtime", "https://github.com/dotnet/dotnet", "main");
        sub.source_enabled = true;
        sub.target_directory = Some("runtime".into());
        sub
    }

    #[test]
    fn new_description_has_note_section_and_footer() {
        let sub = forward_subscription();
        let b = build(7, "https://github.com/dotnet/runtime", "1111111111111111");
        let section = CodeFlowSection {
            subscription: &sub,
            build: &b,
            previous_source_commit: Some("0000000000000000"),
            dependency_updates: &[],
        };

        let description = code_flow_description(&section, "darc-main-x", &[], None);

        assert!(description.contains("> [the source repo](https://github.com/dotnet/runtime)"));
        assert!(description.contains("This pull request brings the following source code changes"));
        assert!(description.contains(&section_start_marker(sub.id)));
        assert!(description.contains(
            "- **Commit Diff**: [0000000...1111111](https://github.com/dotnet/runtime/compare/0000000000000000...1111111111111111)"
        ));
        assert!(description.contains(
            "darc vmr diff --name-only https://github.com/dotnet/runtime:1111111111111111..https://github.com/dotnet/dotnet:darc-main-x"
        ));
        assert!(description.ends_with(FOOTER_END));
    }

    #[test]
    fn first_flow_has_no_commit_diff() {
        let sub = forward_subscription();
        let b = build(7, "https://github.com/dotnet/runtime", "1111111");
        let section = CodeFlowSection {
            subscription: &sub,
            build: &b,
            previous_source_commit: None,
            dependency_updates: &[],
        };
        let description = code_flow_description(&section, "darc-main-x", &[], None);
        assert!(description.contains("- **Commit Diff**: Not available"));
    }

    #[test]
    fn update_replaces_section_and_footer_once() {
        let sub = forward_subscription();
        let first_build = build(7, "https://github.com/dotnet/runtime", "1111111");
        let second_build = build(8, "https://github.com/dotnet/runtime", "2222222");
        let first = code_flow_description(
            &CodeFlowSection {
                subscription: &sub,
                build: &first_build,
                previous_source_commit: None,
                dependency_updates: &[],
            },
            "darc-main-x",
            &[],
            None,
        );
        let second = code_flow_description(
            &CodeFlowSection {
                subscription: &sub,
                build: &second_build,
                previous_source_commit: Some("1111111"),
                dependency_updates: &[],
            },
            "darc-main-x",
            &[],
            Some(&first),
        );

        assert_eq!(second.matches(&section_start_marker(sub.id)).count(), 1);
        assert_eq!(second.matches(FOOTER_START).count(), 1);
        assert!(second.contains("[2222222]"));
        assert!(second.contains("> [!NOTE]"));
    }

    #[test]
    fn backflow_mentions_vmr_and_lists_upstream_diffs() {
        let mut sub = subscription("https://github.com/dotnet/dotnet", "https://github.com/dotnet/runtime", "main");
        sub.source_enabled = true;
        sub.source_directory = Some("runtime".into());
        let b = build(9, "https://github.com/dotnet/dotnet", "abcdef0");
        let diffs = [
            UpstreamRepoDiff {
                repo_uri: "https://github.com/dotnet/sdk/".into(),
                old_commit_sha: "old".into(),
                new_commit_sha: "new".into(),
            },
            UpstreamRepoDiff {
                repo_uri: "https://github.com/dotnet/empty".into(),
                old_commit_sha: String::new(),
                new_commit_sha: "new".into(),
            },
        ];
        let description = code_flow_description(
            &CodeFlowSection {
                subscription: &sub,
                build: &b,
                previous_source_commit: None,
                dependency_updates: &[],
            },
            "darc-main-y",
            &diffs,
            None,
        );
        assert!(description.contains("[the VMR](https://github.com/dotnet/dotnet)"));
        assert!(description.contains("## Associated changes in source repos"));
        assert!(description.contains("- https://github.com/dotnet/sdk/compare/old...new"));
        assert!(!description.contains("dotnet/empty"));
    }

    #[test]
    fn dependency_block_groups_by_kind() {
        let updates = [
            summary("Added.B", None, Some(("2.0", "bbb"))),
            summary("Added.A", None, Some(("2.0", "bbb"))),
            summary("Gone", Some(("1.0", "aaa")), None),
            summary("Bumped", Some(("1.0", "aaa")), Some(("2.0", "bbb"))),
        ];
        let block = dependency_update_block(&updates, "https://github.com/dotnet/dotnet");
        assert_eq!(
            block,
            "\n**New Dependencies**\n\
             - Added [2.0](https://github.com/dotnet/dotnet/commit/bbb)\n  - Added.A\n  - Added.B\n\
             \n**Removed Dependencies**\n\
             - Removed 1.0\n  - Gone\n\
             \n**Updated Dependencies**\n\
             - From [1.0 to 2.0](https://github.com/dotnet/dotnet/compare/aaa...bbb)\n  - Bumped\n"
        );
    }

    #[test]
    fn empty_dependency_block() {
        assert_eq!(dependency_update_block(&[], "https://github.com/a/b"), "");
    }
}
