//! Applies compiled patterns to the changed-file list.

use crate::pattern::{Captures, Pattern};
use serde::Serialize;
use std::collections::BTreeSet;

/// Normalize a path to the form patterns are matched against: forward-slash
/// separators, no leading `./`, no duplicate separators.
pub fn normalize_path(path: &str) -> String {
    let mut p = path.trim().replace('\\', "/");
    while let Some(rest) = p.strip_prefix("./") {
        p = rest.to_string();
    }
    while p.contains("//") {
        p = p.replace("//", "/");
    }
    p
}

// ---------------------------------------------------------------------------
// ChangedFiles
// ---------------------------------------------------------------------------

/// The normalized, deduplicated set of changed paths for one cycle.
///
/// Iteration order is lexicographic regardless of input order, which keeps
/// detection deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangedFiles(BTreeSet<String>);

impl ChangedFiles {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            paths
                .into_iter()
                .map(|p| normalize_path(p.as_ref()))
                .filter(|p| !p.is_empty())
                .collect(),
        )
    }

    pub fn contains(&self, path: &str) -> bool {
        self.0.contains(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ---------------------------------------------------------------------------
// MatchResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchResult {
    pub pattern: String,
    pub path: String,
    pub captures: Captures,
}

/// Every changed file `pattern` matches, in path order.
pub fn match_files(pattern: &Pattern, files: &ChangedFiles) -> Vec<MatchResult> {
    files
        .iter()
        .filter_map(|path| {
            pattern.matches(path).map(|captures| MatchResult {
                pattern: pattern.source().to_string(),
                path: path.to_string(),
                captures,
            })
        })
        .collect()
}

pub fn matches_any(patterns: &[Pattern], path: &str) -> bool {
    patterns.iter().any(|p| p.is_match(path))
}

/// Changed files matching at least one of `patterns`, in path order.
pub fn files_matching_any<'a>(patterns: &[Pattern], files: &'a ChangedFiles) -> Vec<&'a str> {
    files.iter().filter(|f| matches_any(patterns, f)).collect()
}
