//! Reading and rewriting `eng/Version.Details.xml`.
//!
//! The file lists a repository's dependencies and, for repositories that
//! receive backflow, the VMR commit they were last synchronized with:
//!
//! ```text
//! <Dependencies>
//!   <Source Uri="https://github.com/dotnet/dotnet" Mapping="runtime" Sha="abc" BarId="12" />
//!   <ProductDependencies>
//!     <Dependency Name="Microsoft.NETCore.App" Version="9.0.0" CoherentParentDependency="Microsoft.NET.Sdk">
//!       <Uri>https://github.com/dotnet/runtime</Uri>
//!       <Sha>def</Sha>
//!     </Dependency>
//!   </ProductDependencies>
//!   <ToolsetDependencies>...</ToolsetDependencies>
//! </Dependencies>
//! ```
//!
//! Edits are textual so formatting and comments survive.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::types::{BuildId, DependencyDetail, DependencyType, SourceDependency};

/// Where a product repository records its dependencies and VMR source.
pub const VERSION_DETAILS_PATH: &str = "eng/Version.Details.xml";

static DEPENDENCY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<Dependency\s([^>]*?)>(.*?)</Dependency>").expect("static regex"));
static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"(\w+)="([^"]*)""#).expect("static regex"));
static VERSION_ATTRIBUTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(\bVersion=")([^"]*)(")"#).expect("static regex"));
static URI: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(<Uri>)([^<]*)(</Uri>)").expect("static regex"));
static SHA: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(<Sha>)([^<]*)(</Sha>)").expect("static regex"));
static SOURCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<Source\s([^>]*?)/?>").expect("static regex"));
static SOURCE_SHA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(<Source\s[^>]*?Sha=")([0-9a-fA-F]*)(")"#).expect("static regex"));
static SOURCE_BAR_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(<Source\s[^>]*?BarId=")([0-9]*)(")"#).expect("static regex"));

fn attribute<'a>(attributes: &'a str, name: &str) -> Option<&'a str> {
    ATTRIBUTE
        .captures_iter(attributes)
        .find(|c| &c[1] == name)
        .and_then(|c| c.get(2))
        .map(|m| m.as_str())
}

fn inner(regex: &Regex, body: &str) -> String {
    regex
        .captures(body)
        .map(|c| c[2].trim().to_string())
        .unwrap_or_default()
}

/// Every `<Dependency>` in the file. Entries after `<ToolsetDependencies>`
/// are toolset dependencies.
pub fn parse_dependencies(xml: &str) -> Vec<DependencyDetail> {
    let toolset_start = xml.find("<ToolsetDependencies").unwrap_or(usize::MAX);
    DEPENDENCY
        .captures_iter(xml)
        .filter_map(|c| {
            let whole = c.get(0)?;
            let attributes = &c[1];
            let body = &c[2];
            let name = attribute(attributes, "Name")?;
            let mut detail = DependencyDetail::new(
                name,
                attribute(attributes, "Version").unwrap_or_default(),
                inner(&URI, body),
                inner(&SHA, body),
            );
            detail.pinned = attribute(attributes, "Pinned").is_some_and(|p| p.eq_ignore_ascii_case("true"));
            detail.coherent_parent_dependency_name = attribute(attributes, "CoherentParentDependency")
                .filter(|p| !p.is_empty())
                .map(str::to_string);
            detail.dependency_type = if whole.start() > toolset_start {
                DependencyType::Toolset
            } else {
                DependencyType::Product
            };
            Some(detail)
        })
        .collect()
}

/// Rewrites version, URI and commit of every dependency named in `updates`
/// (names compare case-insensitively). Other entries are left untouched.
pub fn apply_updates(xml: &str, updates: &[DependencyDetail]) -> String {
    DEPENDENCY
        .replace_all(xml, |c: &Captures| {
            let attributes = &c[1];
            let body = &c[2];
            let update = attribute(attributes, "Name")
                .and_then(|name| updates.iter().find(|u| u.name.eq_ignore_ascii_case(name)));
            let Some(update) = update else {
                return c[0].to_string();
            };
            let attributes =
                VERSION_ATTRIBUTE.replace(attributes, |v: &Captures| format!("{}{}{}", &v[1], update.version, &v[3]));
            let body = URI.replace(body, |v: &Captures| format!("{}{}{}", &v[1], update.repo_uri, &v[3]));
            let body = SHA.replace(&body, |v: &Captures| format!("{}{}{}", &v[1], update.commit, &v[3]));
            format!("<Dependency {attributes}>{body}</Dependency>")
        })
        .into_owned()
}

/// The `<Source>` element, if the repository receives backflow.
pub fn source_dependency(xml: &str) -> Option<SourceDependency> {
    let attributes = &SOURCE.captures(xml)?[1];
    let uri = attribute(attributes, "Uri")?;
    let sha = attribute(attributes, "Sha").filter(|s| !s.is_empty())?;
    Some(SourceDependency {
        uri: uri.to_string(),
        sha: sha.to_string(),
        bar_id: attribute(attributes, "BarId")
            .and_then(|id| id.parse().ok())
            .map(BuildId),
    })
}

/// The VMR sha recorded in `<Source>`, if any.
pub fn version_details_source_sha(xml: &str) -> Option<String> {
    SOURCE_SHA
        .captures(xml)
        .map(|c| c[2].to_string())
        .filter(|sha| !sha.is_empty())
}

/// Rewrites the `<Source>` element's `Sha` and `BarId` attributes.
pub fn update_version_details(xml: &str, sha: &str, bar_id: u64) -> String {
    let xml = SOURCE_SHA.replace(xml, |c: &Captures| format!("{}{sha}{}", &c[1], &c[3]));
    SOURCE_BAR_ID
        .replace(&xml, |c: &Captures| format!("{}{bar_id}{}", &c[1], &c[3]))
        .into_owned()
}
