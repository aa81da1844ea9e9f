//! Rule definitions and the rule store.
//!
//! One rule per `.md` file: a YAML front-matter block followed by a free-text
//! body. The file stem is the rule identifier. Detection mode and action are
//! decided once here, at load time, as closed enums.
//!
//! ```text
//! ---
//! set:
//!   - src/{path}.py
//!   - tests/{path}_test.py
//! ---
//! Keep source and tests in step. Update {expected_files}.
//! ```

use crate::error::{PolicyError, Result};
use crate::paths;
use crate::pattern::Pattern;
use crate::template::{Placeholder, Strictness, Template};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// CompareTo / RunFor
// ---------------------------------------------------------------------------

/// Which baseline the changed-files provider diffs against.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CompareTo {
    /// Merge base of HEAD and the default branch.
    #[default]
    Base,
    /// Current tip of the default branch.
    DefaultTip,
    /// Snapshot taken when the current prompt started.
    Prompt,
}

impl CompareTo {
    pub fn as_str(self) -> &'static str {
        match self {
            CompareTo::Base => "base",
            CompareTo::DefaultTip => "default_tip",
            CompareTo::Prompt => "prompt",
        }
    }
}

impl fmt::Display for CompareTo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CompareTo {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "base" => Ok(CompareTo::Base),
            "default_tip" => Ok(CompareTo::DefaultTip),
            "prompt" => Ok(CompareTo::Prompt),
            _ => Err(PolicyError::InvalidConfig(format!(
                "unknown compare_to '{s}': must be base, default_tip, or prompt"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunFor {
    /// Run once per trigger file.
    EachMatch,
    /// Run once with every trigger file substituted jointly.
    AllMatches,
}

// ---------------------------------------------------------------------------
// Detection / Action
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    TriggerSafety {
        triggers: Vec<Pattern>,
        safety: Vec<Pattern>,
    },
    /// Bidirectional: any member expects every other member.
    Set { patterns: Vec<Pattern> },
    /// Directional: only `trigger` fires; `expects` never does.
    Pair {
        trigger: Pattern,
        expects: Vec<Pattern>,
    },
}

impl Detection {
    pub fn kind(&self) -> &'static str {
        match self {
            Detection::TriggerSafety { .. } => "trigger",
            Detection::Set { .. } => "set",
            Detection::Pair { .. } => "pair",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Prompt { body: Template },
    Command { command: Template, run_for: RunFor },
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Prompt { .. } => "prompt",
            Action::Command { .. } => "command",
        }
    }
}

// ---------------------------------------------------------------------------
// Rule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub id: String,
    /// Display title; falls back to `id`.
    pub name: Option<String>,
    pub detection: Detection,
    pub action: Action,
    pub compare_to: Option<CompareTo>,
}

impl Rule {
    /// Parse and validate one rule unit.
    pub fn parse(id: &str, content: &str) -> Result<Self> {
        paths::validate_rule_id(id)?;
        let invalid = |reason: String| PolicyError::InvalidRule {
            rule: id.to_string(),
            reason,
        };

        let (front, body) = split_front_matter(content).ok_or_else(|| {
            invalid("missing front matter block delimited by '---' lines".to_string())
        })?;
        let raw: RawRule = serde_yaml::from_str(front).map_err(|e| invalid(e.to_string()))?;

        let detection = build_detection(&raw).map_err(invalid)?;
        let action = build_action(raw.action, body).map_err(invalid)?;

        Ok(Self {
            id: id.to_string(),
            name: raw.name.filter(|n| !n.trim().is_empty()),
            detection,
            action,
            compare_to: raw.compare_to,
        })
    }

    pub fn title(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn effective_compare_to(&self, default: CompareTo) -> CompareTo {
        self.compare_to.unwrap_or(default)
    }

    pub fn safety_patterns(&self) -> &[Pattern] {
        match &self.detection {
            Detection::TriggerSafety { safety, .. } => safety,
            _ => &[],
        }
    }

    pub fn is_prompt(&self) -> bool {
        matches!(self.action, Action::Prompt { .. })
    }
}

// ---------------------------------------------------------------------------
// Front matter
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRule {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    trigger: Option<OneOrMany>,
    #[serde(default)]
    safety: Option<OneOrMany>,
    #[serde(default)]
    set: Option<Vec<String>>,
    #[serde(default)]
    pair: Option<RawPair>,
    #[serde(default)]
    action: Option<RawAction>,
    #[serde(default)]
    compare_to: Option<CompareTo>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPair {
    trigger: String,
    expects: OneOrMany,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAction {
    command: String,
    run_for: RunFor,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

/// Split `---\n<yaml>\n---\n<body>`. Returns `None` if the block is absent.
fn split_front_matter(content: &str) -> Option<(&str, &str)> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let first_end = content.find('\n')?;
    if content[..first_end].trim_end() != "---" {
        return None;
    }
    let rest = &content[first_end + 1..];
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let front = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Some((front, body));
        }
        offset += line.len();
    }
    None
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn compile_all(sources: Vec<String>) -> std::result::Result<Vec<Pattern>, String> {
    sources
        .iter()
        .map(|s| Pattern::compile(s).map_err(|e| e.to_string()))
        .collect()
}

fn require_concrete(patterns: &[Pattern], mode: &str) -> std::result::Result<(), String> {
    match patterns.iter().find(|p| !p.is_concrete()) {
        Some(p) => Err(format!(
            "{mode} pattern '{p}' uses wildcards or alternation; correspondence patterns must resolve to exact paths"
        )),
        None => Ok(()),
    }
}

fn build_detection(raw: &RawRule) -> std::result::Result<Detection, String> {
    let present: Vec<&str> = [
        ("trigger", raw.trigger.is_some()),
        ("set", raw.set.is_some()),
        ("pair", raw.pair.is_some()),
    ]
    .iter()
    .filter(|(_, p)| *p)
    .map(|(n, _)| *n)
    .collect();

    match present.len() {
        0 => return Err("no detection mode: declare one of trigger, set, or pair".to_string()),
        1 => {}
        _ => {
            return Err(format!(
                "multiple detection modes declared ({}); exactly one is allowed",
                present.join(", ")
            ))
        }
    }
    if raw.safety.is_some() && raw.trigger.is_none() {
        return Err("safety is only valid together with trigger".to_string());
    }

    if let Some(trigger) = &raw.trigger {
        let triggers = compile_all(clone_many(trigger))?;
        if triggers.is_empty() {
            return Err("trigger must list at least one pattern".to_string());
        }
        let safety = match &raw.safety {
            Some(s) => compile_all(clone_many(s))?,
            None => Vec::new(),
        };
        return Ok(Detection::TriggerSafety { triggers, safety });
    }

    if let Some(set) = &raw.set {
        if set.len() < 2 {
            return Err(format!("set needs at least 2 patterns, found {}", set.len()));
        }
        let patterns = compile_all(set.clone())?;
        require_concrete(&patterns, "set")?;
        let first = patterns[0].variable_set();
        for p in &patterns[1..] {
            if p.variable_set() != first {
                return Err(format!(
                    "set patterns must share the same variables: '{}' has {{{}}} but '{}' has {{{}}}",
                    patterns[0],
                    join_vars(&first),
                    p,
                    join_vars(&p.variable_set())
                ));
            }
        }
        return Ok(Detection::Set { patterns });
    }

    let pair = raw
        .pair
        .as_ref()
        .ok_or_else(|| "no detection mode".to_string())?;
    let trigger = Pattern::compile(&pair.trigger).map_err(|e| e.to_string())?;
    let expects = compile_all(clone_many(&pair.expects))?;
    if expects.is_empty() {
        return Err("pair.expects must list at least one pattern".to_string());
    }
    require_concrete(&expects, "pair.expects")?;
    let available = trigger.variable_set();
    for e in &expects {
        if let Some(var) = e.variables().into_iter().find(|v| !available.contains(v)) {
            return Err(format!(
                "pair.expects pattern '{e}' uses variable '{var}' which trigger '{trigger}' does not capture"
            ));
        }
    }
    Ok(Detection::Pair { trigger, expects })
}

fn clone_many(v: &OneOrMany) -> Vec<String> {
    match v {
        OneOrMany::One(s) => vec![s.clone()],
        OneOrMany::Many(items) => items.clone(),
    }
}

fn join_vars(vars: &BTreeSet<&str>) -> String {
    vars.iter().copied().collect::<Vec<_>>().join(", ")
}

fn build_action(raw: Option<RawAction>, body: &str) -> std::result::Result<Action, String> {
    let Some(raw) = raw else {
        if body.trim().is_empty() {
            return Err("prompt rules need a non-empty instruction body".to_string());
        }
        let body = Template::parse(body.trim(), Strictness::Lenient)?;
        return Ok(Action::Prompt { body });
    };

    if raw.command.trim().is_empty() {
        return Err("action.command must not be empty".to_string());
    }
    let command = Template::parse(raw.command.trim(), Strictness::Strict)?;
    if raw.run_for == RunFor::AllMatches {
        for slot in [Placeholder::File, Placeholder::TriggerFile] {
            if command.uses(slot) {
                return Err(format!(
                    "{slot} names a single file; run_for: all_matches commands use {}",
                    Placeholder::Files
                ));
            }
        }
    }
    Ok(Action::Command {
        command,
        run_for: raw.run_for,
    })
}

// ---------------------------------------------------------------------------
// RuleSet (store)
// ---------------------------------------------------------------------------

/// All rules of a project, ordered by identifier.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(mut rules: Vec<Rule>) -> Self {
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        Self { rules }
    }

    /// Load every `*.md` rule directly inside `dir`.
    ///
    /// Any invalid unit fails the whole load. A missing directory yields an
    /// empty set.
    pub fn load(dir: &Path) -> Result<Self> {
        if !dir.exists() {
            return Ok(Self::default());
        }
        let mut units = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(paths::RULE_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem.starts_with('.') {
                continue;
            }
            units.push((stem.to_string(), path));
        }
        units.sort();

        let mut rules = Vec::with_capacity(units.len());
        for (id, path) in units {
            let content = std::fs::read_to_string(&path)?;
            rules.push(Rule::parse(&id, &content)?);
        }
        Ok(Self { rules })
    }

    pub fn get(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == id)
    }

    /// Case-insensitive lookup, as used for dismissal markers.
    pub fn find(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id.eq_ignore_ascii_case(id.trim()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules whose dismissal marker appears in `text`.
    pub fn dismissed_by(&self, text: &str) -> Vec<&Rule> {
        let ids = dismissed_ids(text);
        self.rules
            .iter()
            .filter(|r| ids.contains(&r.id.to_lowercase()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Dismissal markers
// ---------------------------------------------------------------------------

static PROMISE_RE: OnceLock<Regex> = OnceLock::new();

fn promise_re() -> &'static Regex {
    PROMISE_RE.get_or_init(|| {
        Regex::new(r"(?is)<promise>\s*(?:✓\s*)?(.*?)\s*</promise>").expect("promise regex is valid")
    })
}

/// The marker an agent emits to report a prompt rule as addressed.
pub fn dismissal_marker(rule_id: &str) -> String {
    format!("<promise>{rule_id}</promise>")
}

/// Lowercased identifiers named by every dismissal marker in `text`.
pub fn dismissed_ids(text: &str) -> BTreeSet<String> {
    promise_re()
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
