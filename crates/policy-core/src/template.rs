//! Placeholder templates for prompt bodies and commands.
//!
//! The vocabulary is fixed: `{file}`, `{files}`, `{trigger_file}` and
//! `{expected_files}`. Values always come from a queue entry's own fields.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Placeholder {
    /// The single file a per-file command runs for.
    File,
    /// All trigger files of the entry.
    Files,
    /// The first trigger file.
    TriggerFile,
    /// Resolved expected files that were missing.
    ExpectedFiles,
}

impl Placeholder {
    pub fn all() -> &'static [Placeholder] {
        &[
            Placeholder::File,
            Placeholder::Files,
            Placeholder::TriggerFile,
            Placeholder::ExpectedFiles,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Placeholder::File => "file",
            Placeholder::Files => "files",
            Placeholder::TriggerFile => "trigger_file",
            Placeholder::ExpectedFiles => "expected_files",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        Placeholder::all().iter().copied().find(|p| p.as_str() == name)
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.as_str())
    }
}

/// How unknown `{word}` blocks are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    /// Unknown identifier-like placeholders are errors (commands).
    Strict,
    /// Unknown braces are kept as literal text (prompt bodies).
    Lenient,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Text(String),
    Slot(Placeholder),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    parts: Vec<Part>,
}

/// Values substituted into a template.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext<'a> {
    pub file: Option<&'a str>,
    pub trigger_files: &'a [String],
    pub expected_files: &'a [String],
}

impl Template {
    pub fn parse(source: &str, strictness: Strictness) -> Result<Self, String> {
        let mut parts = Vec::new();
        let mut text = String::new();
        let mut rest = source;

        while let Some(open) = rest.find('{') {
            text.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else {
                text.push_str(&rest[open..]);
                rest = "";
                break;
            };
            let name = &after[..close];
            match Placeholder::parse(name) {
                Some(slot) => {
                    if !text.is_empty() {
                        parts.push(Part::Text(std::mem::take(&mut text)));
                    }
                    parts.push(Part::Slot(slot));
                }
                None if strictness == Strictness::Strict && is_identifier(name) => {
                    let known: Vec<String> =
                        Placeholder::all().iter().map(|p| p.to_string()).collect();
                    return Err(format!(
                        "unknown placeholder '{{{name}}}' (expected one of {})",
                        known.join(", ")
                    ));
                }
                None => {
                    text.push('{');
                    text.push_str(name);
                    text.push('}');
                }
            }
            rest = &after[close + 1..];
        }
        text.push_str(rest);
        if !text.is_empty() {
            parts.push(Part::Text(text));
        }

        Ok(Self {
            source: source.to_string(),
            parts,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn uses(&self, placeholder: Placeholder) -> bool {
        self.parts.iter().any(|p| *p == Part::Slot(placeholder))
    }

    /// Render for display: lists are comma-separated, paths verbatim.
    pub fn render_text(&self, ctx: &TemplateContext<'_>) -> String {
        self.render(ctx, |paths| paths.join(", "), str::to_string)
    }

    /// Render for `sh -c`: every path is shell-quoted, lists space-separated.
    pub fn render_command(&self, ctx: &TemplateContext<'_>) -> String {
        self.render(
            ctx,
            |paths| {
                paths
                    .iter()
                    .map(|p| shell_quote(p))
                    .collect::<Vec<_>>()
                    .join(" ")
            },
            shell_quote,
        )
    }

    fn render(
        &self,
        ctx: &TemplateContext<'_>,
        list: impl Fn(&[String]) -> String,
        one: impl Fn(&str) -> String,
    ) -> String {
        let first = ctx.trigger_files.first().map(String::as_str);
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Text(t) => out.push_str(t),
                Part::Slot(Placeholder::File) => {
                    out.push_str(&ctx.file.or(first).map(&one).unwrap_or_default())
                }
                Part::Slot(Placeholder::TriggerFile) => {
                    out.push_str(&first.map(&one).unwrap_or_default())
                }
                Part::Slot(Placeholder::Files) => out.push_str(&list(ctx.trigger_files)),
                Part::Slot(Placeholder::ExpectedFiles) => out.push_str(&list(ctx.expected_files)),
            }
        }
        out
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Quote `s` for POSIX `sh` unless it only contains safe characters.
pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:@%+=,".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}
