//! Working-tree snapshots used to observe what a command changed.

use crate::error::{PolicyError, Result};
use crate::io::sha256_hex;
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Relative path → content digest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot(BTreeMap<String, String>);

impl Snapshot {
    pub fn new(files: BTreeMap<String, String>) -> Self {
        Self(files)
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.0.get(path).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn files(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    /// Paths added, removed, or modified between `self` and `after`, sorted.
    pub fn diff(&self, after: &Snapshot) -> Vec<String> {
        let mut changed = BTreeSet::new();
        for (path, digest) in &self.0 {
            if after.0.get(path) != Some(digest) {
                changed.insert(path.clone());
            }
        }
        for path in after.0.keys() {
            if !self.0.contains_key(path) {
                changed.insert(path.clone());
            }
        }
        changed.into_iter().collect()
    }
}

/// Something that can photograph the files a command might touch.
pub trait ChangeProbe {
    fn snapshot(&self) -> Result<Snapshot>;
}

/// Hashes every regular file under `root` that git would not ignore.
///
/// `.gitignore` rules apply even outside a git repository, so build output
/// such as `target/` stays out of every snapshot. Dot-directories are
/// skipped; dot-files are kept.
pub struct TreeProbe {
    root: PathBuf,
}

impl TreeProbe {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

fn is_hidden_dir(entry: &ignore::DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_some_and(|t| t.is_dir())
        && entry.file_name().to_str().is_some_and(|n| n.starts_with('.'))
}

impl ChangeProbe for TreeProbe {
    fn snapshot(&self) -> Result<Snapshot> {
        let mut files = BTreeMap::new();
        let mut builder = WalkBuilder::new(&self.root);
        builder
            .hidden(false)
            .git_ignore(true)
            .git_exclude(true)
            .git_global(false)
            .require_git(false)
            .follow_links(false);
        builder.filter_entry(|e| !is_hidden_dir(e));

        for result in builder.build() {
            let entry = match result {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable path in snapshot");
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let rel = relative_posix(&self.root, entry.path());
            let data = match std::fs::read(entry.path()) {
                Ok(d) => d,
                // Removed between listing and reading.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(PolicyError::Io(e)),
            };
            files.insert(rel, sha256_hex(&data));
        }
        Ok(Snapshot(files))
    }
}

fn relative_posix(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.to_string_lossy().replace('\\', "/")
}
