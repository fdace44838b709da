//! Asset-name exclusion globs.

use regex::Regex;

use crate::types::Asset;

/// Matches asset names against `*`/`?` globs, case-insensitively.
///
/// A glob matches the whole name: `Microsoft.*` excludes
/// `Microsoft.NET.Sdk` but not `Not.Microsoft.Thing`.
#[derive(Debug, Clone, Default)]
pub struct AssetMatcher {
    patterns: Vec<Regex>,
}

impl AssetMatcher {
    pub fn new<S: AsRef<str>>(globs: &[S]) -> Result<Self, regex::Error> {
        let patterns = globs
            .iter()
            .map(|g| g.as_ref().trim())
            .filter(|g| !g.is_empty())
            .map(|g| Regex::new(&glob_to_regex(g)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(AssetMatcher { patterns })
    }

    pub fn is_excluded(&self, asset_name: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(asset_name))
    }

    /// The assets that survive exclusion.
    pub fn filter<'a>(&self, assets: &'a [Asset]) -> Vec<&'a Asset> {
        assets.iter().filter(|a| !self.is_excluded(&a.name)).collect()
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push_str("(?i)^");
    for c in glob.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }
    out.push('$');
    out
}
