//! Changed-file providers.
//!
//! The engine never computes diffs itself; it asks a `ChangeSource` for the
//! changed paths and an opaque baseline identifier under one comparison mode.

use crate::error::{PolicyError, Result};
use crate::io::{self, sha256_hex};
use crate::matcher::ChangedFiles;
use crate::paths;
use crate::rules::CompareTo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

/// Digest recorded for a path that was deleted when a baseline was captured.
const DELETED: &str = "-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub files: ChangedFiles,
    pub baseline: String,
}

pub trait ChangeSource {
    fn changes(&self, mode: CompareTo) -> Result<ChangeSet>;
}

// ---------------------------------------------------------------------------
// StaticChanges
// ---------------------------------------------------------------------------

/// A fixed file list, returned for every comparison mode.
#[derive(Debug, Clone)]
pub struct StaticChanges {
    set: ChangeSet,
}

impl StaticChanges {
    pub fn new<I, S>(files: I, baseline: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            set: ChangeSet {
                files: ChangedFiles::new(files),
                baseline: baseline.into(),
            },
        }
    }
}

impl ChangeSource for StaticChanges {
    fn changes(&self, _mode: CompareTo) -> Result<ChangeSet> {
        Ok(self.set.clone())
    }
}

// ---------------------------------------------------------------------------
// Prompt baseline
// ---------------------------------------------------------------------------

/// State of the working copy when the current prompt started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptBaseline {
    pub head: String,
    pub captured_at: DateTime<Utc>,
    /// Digests of files that were already dirty relative to `head`.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

impl PromptBaseline {
    pub fn load(root: &Path) -> Result<Option<Self>> {
        let path = paths::prompt_baseline_path(root);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(Some(serde_yaml::from_str(&data)?))
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        io::atomic_write(&paths::prompt_baseline_path(root), data.as_bytes())
    }

    /// Opaque identifier: changes whenever a new baseline is captured.
    pub fn id(&self) -> Result<String> {
        let data = serde_yaml::to_string(self)?;
        Ok(format!("prompt:{}", &sha256_hex(data.as_bytes())[..16]))
    }
}

fn file_digest(root: &Path, rel: &str) -> Result<String> {
    match std::fs::read(root.join(rel)) {
        Ok(data) => Ok(sha256_hex(&data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DELETED.to_string()),
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// GitChanges
// ---------------------------------------------------------------------------

/// Derives changed files from a git working copy.
pub struct GitChanges {
    root: PathBuf,
    default_branch: String,
}

impl GitChanges {
    pub fn new(root: impl Into<PathBuf>, default_branch: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            default_branch: default_branch.into(),
        }
    }

    fn git(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(args)
            .output()
            .map_err(|e| PolicyError::ChangeSource(format!("failed to run git: {e}")))
    }

    /// Run git and return stdout, failing on a non-zero exit.
    fn git_stdout(&self, args: &[&str]) -> Result<String> {
        let output = self.git(args)?;
        if !output.status.success() {
            return Err(PolicyError::ChangeSource(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn rev_parse(&self, rev: &str) -> Result<Option<String>> {
        let spec = format!("{rev}^{{commit}}");
        let output = self.git(&["rev-parse", "--verify", "--quiet", &spec])?;
        if !output.status.success() {
            return Ok(None);
        }
        let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(if sha.is_empty() { None } else { Some(sha) })
    }

    /// The default branch tip, preferring the remote-tracking ref.
    fn default_tip(&self) -> Result<Option<String>> {
        let remote = format!("origin/{}", self.default_branch);
        if let Some(sha) = self.rev_parse(&remote)? {
            return Ok(Some(sha));
        }
        self.rev_parse(&self.default_branch)
    }

    fn head(&self) -> Result<String> {
        self.rev_parse("HEAD")?.ok_or_else(|| {
            PolicyError::ChangeSource("HEAD does not resolve; commit at least once".to_string())
        })
    }

    /// Tracked files differing from `rev` in the working tree, plus untracked files.
    fn dirty_since(&self, rev: &str) -> Result<BTreeSet<String>> {
        let mut files: BTreeSet<String> = split_nul(&self.git_stdout(&[
            "diff",
            "--name-only",
            "--no-renames",
            "-z",
            rev,
        ])?);
        files.extend(split_nul(&self.git_stdout(&[
            "ls-files",
            "--others",
            "--exclude-standard",
            "-z",
        ])?));
        // The engine's own state is never a change.
        let own = format!("{}/", paths::POLICY_DIR);
        files.retain(|f| !f.starts_with(&own));
        Ok(files)
    }

    /// Record HEAD and the digests of currently dirty files as the prompt baseline.
    pub fn capture_prompt_baseline(&self) -> Result<PromptBaseline> {
        let head = self.head()?;
        let files = self
            .dirty_since(&head)?
            .into_iter()
            .map(|path| {
                let digest = file_digest(&self.root, &path)?;
                Ok((path, digest))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        let baseline = PromptBaseline {
            head,
            captured_at: Utc::now(),
            files,
        };
        baseline.save(&self.root)?;
        Ok(baseline)
    }

    fn against(&self, sha: String) -> Result<ChangeSet> {
        let files = self.dirty_since(&sha)?;
        Ok(ChangeSet {
            files: ChangedFiles::new(files),
            baseline: sha,
        })
    }

    fn prompt_changes(&self) -> Result<ChangeSet> {
        let Some(baseline) = PromptBaseline::load(&self.root)? else {
            debug!("no prompt baseline captured; comparing against HEAD");
            return self.against(self.head()?);
        };
        let now_dirty = self.dirty_since(&baseline.head)?;
        let mut files = BTreeSet::new();
        for path in &now_dirty {
            match baseline.files.get(path) {
                Some(before) if *before == file_digest(&self.root, path)? => {}
                _ => {
                    files.insert(path.clone());
                }
            }
        }
        // Dirty at capture but since restored to the committed content.
        for path in baseline.files.keys() {
            if !now_dirty.contains(path) {
                files.insert(path.clone());
            }
        }
        Ok(ChangeSet {
            files: ChangedFiles::new(files),
            baseline: baseline.id()?,
        })
    }
}

impl ChangeSource for GitChanges {
    fn changes(&self, mode: CompareTo) -> Result<ChangeSet> {
        match mode {
            CompareTo::Base => {
                let head = self.head()?;
                let Some(tip) = self.default_tip()? else {
                    warn!(branch = %self.default_branch, "default branch not found; comparing against HEAD");
                    return self.against(head);
                };
                let base = self.git_stdout(&["merge-base", &head, &tip])?;
                self.against(base.trim().to_string())
            }
            CompareTo::DefaultTip => {
                let head = self.head()?;
                let tip = match self.default_tip()? {
                    Some(tip) => tip,
                    None => {
                        warn!(branch = %self.default_branch, "default branch not found; comparing against HEAD");
                        head
                    }
                };
                self.against(tip)
            }
            CompareTo::Prompt => self.prompt_changes(),
        }
    }
}

fn split_nul(s: &str) -> BTreeSet<String> {
    s.split('\0')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}
