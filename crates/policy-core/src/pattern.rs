//! Path patterns with named captures.
//!
//! A pattern is a glob over forward-slash paths extended with `{...}` blocks:
//!
//! - `{path}` or `{**name}` captures one or more path segments
//! - `{name}` (any other name) or `{*name}` captures exactly one segment
//! - `{a,b}` is alternation over literal sub-patterns, not a capture
//! - `*` matches within a segment, `**/` matches zero or more directories,
//!   `?` matches one non-separator character
//! - `\` escapes the next character
//!
//! Patterns compile to an anchored regex, so matching is total against the
//! path. Captures are lazy: when a path splits more than one way, each capture
//! ends at the earliest point where the rest of the pattern still matches.
//!
//! Only concrete patterns (literals and captures, see [`Pattern::is_concrete`])
//! resolve back to a path. A pattern such as `src/**/{name}.py` matches and
//! captures `name`, but the directories under `**/` are not captured, so
//! `resolve` fails on that segment. Rules only resolve their correspondence
//! patterns, and those are required to be concrete when a rule loads.

use crate::error::{PolicyError, Result};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;

/// Capture name → captured value.
pub type Captures = BTreeMap<String, String>;

/// Name that implies a multi-segment capture without the `**` sigil.
pub const MULTI_SEGMENT_NAME: &str = "path";

// ---------------------------------------------------------------------------
// Segments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    /// Exactly one path segment; never crosses a `/`.
    Single,
    /// One or more path segments.
    Multi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wildcard {
    /// `*`
    Star,
    /// `?`
    Question,
    /// `**/`: zero or more leading directories.
    AnyDirs,
    /// `**` not followed by a separator.
    Any,
}

impl Wildcard {
    pub fn as_str(self) -> &'static str {
        match self {
            Wildcard::Star => "*",
            Wildcard::Question => "?",
            Wildcard::AnyDirs => "**/",
            Wildcard::Any => "**",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Wildcard(Wildcard),
    /// Raw alternatives; each may itself use `*` and `?`.
    Alternation(Vec<String>),
    Capture {
        name: String,
        cardinality: Cardinality,
    },
}

// ---------------------------------------------------------------------------
// Pattern
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    segments: Vec<Segment>,
    regex: Regex,
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for Pattern {}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Pattern {
    /// Compile `source` into a matcher.
    pub fn compile(source: &str) -> Result<Self> {
        let segments = parse(source).map_err(|reason| PolicyError::PatternCompile {
            pattern: source.to_string(),
            reason,
        })?;
        let regex = Regex::new(&to_regex(&segments)).map_err(|e| PolicyError::PatternCompile {
            pattern: source.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            source: source.to_string(),
            segments,
            regex,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Capture names in order of appearance.
    pub fn variables(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Capture { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn variable_set(&self) -> BTreeSet<&str> {
        self.variables().into_iter().collect()
    }

    /// True when the pattern has no wildcards or alternation, so a full set of
    /// captures determines exactly one path.
    pub fn is_concrete(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_) | Segment::Capture { .. }))
    }

    /// Match a normalized relative path. Returns every capture on success.
    pub fn matches(&self, path: &str) -> Option<Captures> {
        let caps = self.regex.captures(path)?;
        let mut out = Captures::new();
        for name in self.variables() {
            let value = caps.name(name)?.as_str();
            out.insert(name.to_string(), value.to_string());
        }
        Some(out)
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    /// Substitute `captures` into the pattern, producing a concrete path.
    pub fn resolve(&self, captures: &Captures) -> Result<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Capture { name, .. } => {
                    let value = captures.get(name).ok_or_else(|| PolicyError::MissingVariable {
                        pattern: self.source.clone(),
                        variable: name.clone(),
                    })?;
                    out.push_str(value);
                }
                Segment::Wildcard(w) => {
                    return Err(PolicyError::Unresolvable {
                        pattern: self.source.clone(),
                        segment: w.as_str().to_string(),
                    });
                }
                Segment::Alternation(alts) => {
                    return Err(PolicyError::Unresolvable {
                        pattern: self.source.clone(),
                        segment: format!("{{{}}}", alts.join(",")),
                    });
                }
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

static NAME_RE: OnceLock<Regex> = OnceLock::new();

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("name regex is valid"))
}

fn parse(source: &str) -> std::result::Result<Vec<Segment>, String> {
    if source.is_empty() {
        return Err("pattern is empty".to_string());
    }

    let chars: Vec<char> = source.chars().collect();
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut seen = BTreeSet::new();
    let mut i = 0;

    let flush = |literal: &mut String, segments: &mut Vec<Segment>| {
        if !literal.is_empty() {
            segments.push(Segment::Literal(std::mem::take(literal)));
        }
    };

    while i < chars.len() {
        match chars[i] {
            '\\' => {
                let next = chars
                    .get(i + 1)
                    .ok_or_else(|| "trailing escape character".to_string())?;
                literal.push(*next);
                i += 2;
            }
            '{' => {
                let close = chars[i + 1..]
                    .iter()
                    .position(|c| *c == '}' || *c == '{')
                    .map(|p| p + i + 1);
                let close = match close {
                    Some(c) if chars[c] == '}' => c,
                    Some(_) => return Err(format!("nested '{{' at position {i}")),
                    None => return Err(format!("unterminated '{{' at position {i}")),
                };
                let body: String = chars[i + 1..close].iter().collect();
                flush(&mut literal, &mut segments);
                segments.push(parse_brace(&body, &mut seen)?);
                i = close + 1;
            }
            '}' => return Err(format!("unbalanced '}}' at position {i}")),
            '*' => {
                flush(&mut literal, &mut segments);
                if chars.get(i + 1) == Some(&'*') {
                    if chars.get(i + 2) == Some(&'/') {
                        segments.push(Segment::Wildcard(Wildcard::AnyDirs));
                        i += 3;
                    } else {
                        segments.push(Segment::Wildcard(Wildcard::Any));
                        i += 2;
                    }
                } else {
                    segments.push(Segment::Wildcard(Wildcard::Star));
                    i += 1;
                }
            }
            '?' => {
                flush(&mut literal, &mut segments);
                segments.push(Segment::Wildcard(Wildcard::Question));
                i += 1;
            }
            c => {
                literal.push(c);
                i += 1;
            }
        }
    }
    flush(&mut literal, &mut segments);
    Ok(segments)
}

fn parse_brace(body: &str, seen: &mut BTreeSet<String>) -> std::result::Result<Segment, String> {
    if body.trim().is_empty() {
        return Err("empty capture '{}'".to_string());
    }

    if body.contains(',') {
        let alternatives: Vec<String> = body.split(',').map(str::to_string).collect();
        return Ok(Segment::Alternation(alternatives));
    }

    let (name, cardinality) = if let Some(rest) = body.strip_prefix("**") {
        (rest, Cardinality::Multi)
    } else if let Some(rest) = body.strip_prefix('*') {
        (rest, Cardinality::Single)
    } else if body == MULTI_SEGMENT_NAME {
        (body, Cardinality::Multi)
    } else {
        (body, Cardinality::Single)
    };

    if name.is_empty() {
        return Err(format!("capture '{{{body}}}' has no name"));
    }
    if !name_re().is_match(name) {
        return Err(format!("invalid capture name '{name}'"));
    }
    if !seen.insert(name.to_string()) {
        return Err(format!("duplicate capture name '{name}'"));
    }

    Ok(Segment::Capture {
        name: name.to_string(),
        cardinality,
    })
}

// ---------------------------------------------------------------------------
// Regex generation
// ---------------------------------------------------------------------------

fn to_regex(segments: &[Segment]) -> String {
    let mut re = String::from("^");
    for segment in segments {
        match segment {
            Segment::Literal(text) => re.push_str(&regex::escape(text)),
            Segment::Wildcard(w) => re.push_str(wildcard_regex(*w)),
            Segment::Alternation(alternatives) => {
                let alts: Vec<String> = alternatives.iter().map(|a| glob_regex(a)).collect();
                re.push_str("(?:");
                re.push_str(&alts.join("|"));
                re.push(')');
            }
            Segment::Capture { name, cardinality } => {
                let body = match cardinality {
                    Cardinality::Single => "[^/]+?",
                    Cardinality::Multi => "[^/]+?(?:/[^/]+?)*?",
                };
                re.push_str(&format!("(?P<{name}>{body})"));
            }
        }
    }
    re.push('$');
    re
}

fn wildcard_regex(w: Wildcard) -> &'static str {
    match w {
        Wildcard::Star => "[^/]*",
        Wildcard::Question => "[^/]",
        Wildcard::AnyDirs => "(?:.*/)?",
        Wildcard::Any => ".*",
    }
}

/// Regex for one alternative inside `{a,b}`: literal text with `*` and `?`.
fn glob_regex(alt: &str) -> String {
    let mut out = String::new();
    let mut literal = String::new();
    for c in alt.chars() {
        match c {
            '*' | '?' => {
                out.push_str(&regex::escape(&std::mem::take(&mut literal)));
                out.push_str(if c == '*' { "[^/]*" } else { "[^/]" });
            }
            c => literal.push(c),
        }
    }
    out.push_str(&regex::escape(&literal));
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
