//! Per-rule detection: decides whether a rule newly fires, is satisfied, or is
//! suppressed for the current changed files, and fingerprints each firing.

use crate::error::Result;
use crate::io::sha256_hex;
use crate::matcher::{files_matching_any, match_files, ChangedFiles};
use crate::pattern::{Captures, Pattern};
use crate::resolver::correspond;
use crate::rules::{Detection, Rule};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::debug;

/// Hex characters kept from the SHA-256 trigger fingerprint.
pub const HASH_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Trigger {
    pub rule: String,
    pub hash: String,
    /// Sorted, deduplicated.
    pub trigger_files: Vec<String>,
    /// Resolved correspondence paths that were not changed. Empty for
    /// trigger/safety rules.
    pub expected_files: Vec<String>,
    pub baseline: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DetectionEvent {
    /// The rule fires; the queue should hold an entry for `hash`.
    Fired(Trigger),
    /// Matched files whose correspondences are all present.
    Satisfied {
        rule: String,
        trigger_files: Vec<String>,
    },
    /// Trigger files matched but a safety pattern also matched.
    Suppressed {
        rule: String,
        trigger_files: Vec<String>,
        safety_files: Vec<String>,
    },
}

impl DetectionEvent {
    pub fn rule(&self) -> &str {
        match self {
            DetectionEvent::Fired(t) => &t.rule,
            DetectionEvent::Satisfied { rule, .. } | DetectionEvent::Suppressed { rule, .. } => {
                rule
            }
        }
    }
}

/// Stable fingerprint of (rule, sorted trigger files, baseline).
///
/// Independent of the order `trigger_files` is given in.
pub fn trigger_hash<S: AsRef<str>>(rule: &str, trigger_files: &[S], baseline: &str) -> String {
    let files: BTreeSet<&str> = trigger_files.iter().map(AsRef::as_ref).collect();
    let key = serde_json::json!([rule, files, baseline]);
    let mut hash = sha256_hex(key.to_string().as_bytes());
    hash.truncate(HASH_LEN);
    hash
}

/// Run detection for every rule, in rule order.
pub fn detect<'a, I>(rules: I, changed: &ChangedFiles, baseline: &str) -> Result<Vec<DetectionEvent>>
where
    I: IntoIterator<Item = &'a Rule>,
{
    let mut events = Vec::new();
    for rule in rules {
        events.extend(detect_rule(rule, changed, baseline)?);
    }
    Ok(events)
}

pub fn detect_rule(rule: &Rule, changed: &ChangedFiles, baseline: &str) -> Result<Vec<DetectionEvent>> {
    let events = match &rule.detection {
        Detection::TriggerSafety { triggers, safety } => {
            detect_trigger_safety(rule, triggers, safety, changed, baseline)
        }
        Detection::Set { patterns } => detect_set(rule, patterns, changed, baseline)?,
        Detection::Pair { trigger, expects } => {
            detect_pair(rule, trigger, expects, changed, baseline)?
        }
    };
    debug!(
        rule = %rule.id,
        mode = rule.detection.kind(),
        events = events.len(),
        "detection complete"
    );
    Ok(events)
}

fn fired(rule: &Rule, trigger_files: Vec<String>, expected: BTreeSet<String>, baseline: &str) -> DetectionEvent {
    DetectionEvent::Fired(Trigger {
        rule: rule.id.clone(),
        hash: trigger_hash(&rule.id, &trigger_files, baseline),
        trigger_files,
        expected_files: expected.into_iter().collect(),
        baseline: baseline.to_string(),
    })
}

fn detect_trigger_safety(
    rule: &Rule,
    triggers: &[Pattern],
    safety: &[Pattern],
    changed: &ChangedFiles,
    baseline: &str,
) -> Vec<DetectionEvent> {
    let trigger_files: Vec<String> = files_matching_any(triggers, changed)
        .into_iter()
        .map(str::to_string)
        .collect();
    if trigger_files.is_empty() {
        return Vec::new();
    }

    let safety_files: Vec<String> = files_matching_any(safety, changed)
        .into_iter()
        .map(str::to_string)
        .collect();
    if !safety_files.is_empty() {
        return vec![DetectionEvent::Suppressed {
            rule: rule.id.clone(),
            trigger_files,
            safety_files,
        }];
    }

    vec![fired(rule, trigger_files, BTreeSet::new(), baseline)]
}

/// Changed files that match a set member, grouped by what they correspond to.
///
/// Groups stay pairwise disjoint: no two share a file or a capture map.
#[derive(Debug, Default)]
struct MatchGroup {
    captures: Vec<Captures>,
    files: BTreeSet<String>,
    missing: BTreeSet<String>,
}

impl MatchGroup {
    fn overlaps(&self, other: &MatchGroup) -> bool {
        self.files.intersection(&other.files).next().is_some()
            || self.captures.iter().any(|c| other.captures.contains(c))
    }

    fn absorb(&mut self, other: MatchGroup) {
        for c in other.captures {
            if !self.captures.contains(&c) {
                self.captures.push(c);
            }
        }
        self.files.extend(other.files);
        self.missing.extend(other.missing);
    }
}

/// Files whose captures agree fire together with the union of what is
/// missing. A file matching several members joins every group it touches.
fn detect_set(
    rule: &Rule,
    patterns: &[Pattern],
    changed: &ChangedFiles,
    baseline: &str,
) -> Result<Vec<DetectionEvent>> {
    let mut groups: Vec<MatchGroup> = Vec::new();

    for (i, pattern) in patterns.iter().enumerate() {
        let siblings: Vec<&Pattern> = patterns
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(_, p)| p)
            .collect();
        for m in match_files(pattern, changed) {
            let c = correspond(&siblings, &m.captures, changed)?;
            let mut group = MatchGroup {
                captures: vec![m.captures],
                files: BTreeSet::from([m.path]),
                missing: c.missing.into_iter().collect(),
            };
            let mut k = 0;
            while k < groups.len() {
                if groups[k].overlaps(&group) {
                    group.absorb(groups.swap_remove(k));
                } else {
                    k += 1;
                }
            }
            groups.push(group);
        }
    }

    groups.sort_by(|a, b| a.files.cmp(&b.files));
    Ok(groups
        .into_iter()
        .map(|g| settle(rule, g.files.into_iter().collect(), g.missing, baseline))
        .collect())
}

/// Only files matching `trigger` can fire; files matching only an `expects`
/// pattern are ignored.
fn detect_pair(
    rule: &Rule,
    trigger: &Pattern,
    expects: &[Pattern],
    changed: &ChangedFiles,
    baseline: &str,
) -> Result<Vec<DetectionEvent>> {
    let siblings: Vec<&Pattern> = expects.iter().collect();
    let mut events = Vec::new();
    for m in match_files(trigger, changed) {
        let c = correspond(&siblings, &m.captures, changed)?;
        events.push(settle(rule, vec![m.path], c.missing.into_iter().collect(), baseline));
    }
    Ok(events)
}

fn settle(rule: &Rule, files: Vec<String>, missing: BTreeSet<String>, baseline: &str) -> DetectionEvent {
    if missing.is_empty() {
        DetectionEvent::Satisfied {
            rule: rule.id.clone(),
            trigger_files: files,
        }
    } else {
        fired(rule, files, missing, baseline)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
