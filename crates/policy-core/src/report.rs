//! Check-cycle results and the batched text report.
//!
//! One block per rule, never one per file: a correspondence rule broken by
//! dozens of files still renders a single block listing every pair.

use crate::evaluator::{render_instruction, EvaluationOutcome};
use crate::queue::{ActionResult, QueueEntry, QueueStatus};
use crate::rules::{dismissal_marker, Action, Rule};
use crate::shell;
use serde::Serialize;
use std::fmt::Write;

/// Output lines shown for each failed command run.
const FAILURE_TAIL_LINES: usize = 20;

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Aggregate state of one rule for one cycle, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOutcome {
    Error,
    Failed,
    Pending,
    Passed,
    Skipped,
    Suppressed,
    Satisfied,
    Quiet,
}

impl RuleOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleOutcome::Error => "error",
            RuleOutcome::Failed => "failed",
            RuleOutcome::Pending => "pending",
            RuleOutcome::Passed => "passed",
            RuleOutcome::Skipped => "skipped",
            RuleOutcome::Suppressed => "suppressed",
            RuleOutcome::Satisfied => "satisfied",
            RuleOutcome::Quiet => "quiet",
        }
    }

    pub fn from_status(status: QueueStatus) -> Self {
        match status {
            QueueStatus::Queued => RuleOutcome::Pending,
            QueueStatus::Passed => RuleOutcome::Passed,
            QueueStatus::Failed => RuleOutcome::Failed,
            QueueStatus::Skipped => RuleOutcome::Skipped,
        }
    }
}

/// One fired trigger and what happened to its queue entry this cycle.
#[derive(Debug, Clone, Serialize)]
pub struct EntryReport {
    pub entry: QueueEntry,
    /// `None` when the entry was already terminal before this cycle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<EvaluationOutcome>,
}

impl EntryReport {
    pub fn status(&self) -> QueueStatus {
        match &self.evaluation {
            Some(outcome) => outcome.status(),
            None => self.entry.status,
        }
    }

    /// Whether the entry belongs in this cycle's text output.
    pub fn is_current(&self) -> bool {
        self.evaluation.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleReport {
    pub rule: String,
    pub title: String,
    pub outcome: RuleOutcome,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<EntryReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub rules: Vec<RuleReport>,
    pub text: String,
}

impl CheckReport {
    pub fn count(&self, outcome: RuleOutcome) -> usize {
        self.rules.iter().filter(|r| r.outcome == outcome).count()
    }

    /// True when something needs the caller's attention.
    pub fn needs_attention(&self) -> bool {
        self.rules.iter().any(|r| {
            matches!(
                r.outcome,
                RuleOutcome::Error | RuleOutcome::Failed | RuleOutcome::Pending
            )
        })
    }
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

/// Render the batched report. `lookup` maps a rule id back to its definition.
pub fn format_report<'a>(
    reports: &[RuleReport],
    lookup: impl Fn(&str) -> Option<&'a Rule>,
) -> String {
    let mut out = String::new();
    let mut applied = Vec::new();

    for report in reports {
        let current: Vec<&EntryReport> = report.entries.iter().filter(|e| e.is_current()).collect();
        match report.outcome {
            RuleOutcome::Error => {
                let reason = report.error.as_deref().unwrap_or("unknown error");
                block_header(&mut out, report, "error");
                let _ = writeln!(out, "{reason}");
            }
            RuleOutcome::Pending => {
                let Some(rule) = lookup(&report.rule) else {
                    continue;
                };
                let pending: Vec<&EntryReport> = current
                    .iter()
                    .copied()
                    .filter(|e| e.status() == QueueStatus::Queued)
                    .collect();
                format_pending(&mut out, report, rule, &pending);
            }
            RuleOutcome::Failed => {
                let failed: Vec<&EntryReport> = current
                    .iter()
                    .copied()
                    .filter(|e| e.status() == QueueStatus::Failed)
                    .collect();
                if failed.is_empty() {
                    continue;
                }
                format_failed(&mut out, report, &failed);
            }
            RuleOutcome::Passed => {
                if current.iter().any(|e| e.status() == QueueStatus::Passed) {
                    applied.push(report.rule.as_str());
                }
            }
            _ => {}
        }
    }

    if !applied.is_empty() {
        if !out.is_empty() {
            out.push('\n');
        }
        let _ = writeln!(
            out,
            "Applied {} command rule{}: {}",
            applied.len(),
            if applied.len() == 1 { "" } else { "s" },
            applied.join(", ")
        );
    }
    out
}

fn block_header(out: &mut String, report: &RuleReport, label: &str) {
    if !out.is_empty() {
        out.push('\n');
    }
    if report.title == report.rule {
        let _ = writeln!(out, "## {} [{label}]", report.rule);
    } else {
        let _ = writeln!(out, "## {} ({}) [{label}]", report.title, report.rule);
    }
}

fn pair_line(entry: &QueueEntry) -> String {
    let triggers = entry.trigger_files.join(", ");
    if entry.expected_files.is_empty() {
        format!("- {triggers}")
    } else {
        format!("- {triggers} → {}", entry.expected_files.join(", "))
    }
}

fn format_pending(out: &mut String, report: &RuleReport, rule: &Rule, entries: &[&EntryReport]) {
    if entries.is_empty() {
        return;
    }
    block_header(out, report, "pending");
    if let Action::Prompt { body } = &rule.action {
        let merged = merged_entry(entries);
        let _ = writeln!(out, "{}", render_instruction(body, &merged));
    }
    out.push('\n');
    for e in entries {
        let _ = writeln!(out, "{}", pair_line(&e.entry));
    }
    let _ = writeln!(
        out,
        "\nWhen addressed, reply with {}",
        dismissal_marker(&report.rule)
    );
}

/// All pending entries of a rule folded into one, for rendering the body once.
fn merged_entry(entries: &[&EntryReport]) -> QueueEntry {
    let mut merged = entries[0].entry.clone();
    for e in &entries[1..] {
        for f in &e.entry.trigger_files {
            if !merged.trigger_files.contains(f) {
                merged.trigger_files.push(f.clone());
            }
        }
        for f in &e.entry.expected_files {
            if !merged.expected_files.contains(f) {
                merged.expected_files.push(f.clone());
            }
        }
    }
    merged
}

fn format_failed(out: &mut String, report: &RuleReport, entries: &[&EntryReport]) {
    block_header(out, report, "failed");
    for e in entries {
        let Some(EvaluationOutcome::Settled { result, .. }) = &e.evaluation else {
            continue;
        };
        let _ = writeln!(out, "{}", pair_line(&e.entry));
        match result {
            ActionResult::Command { runs, verdict } => {
                let _ = writeln!(out, "  {verdict}");
                if let Some(run) = runs.iter().rev().find(|r| !r.output.is_empty()) {
                    for line in tail_lines(&run.output, FAILURE_TAIL_LINES) {
                        let _ = writeln!(out, "    {line}");
                    }
                }
            }
            ActionResult::Skipped { reason } => {
                let _ = writeln!(out, "  {reason}");
            }
            ActionResult::Dismissed => {}
        }
    }
}

fn tail_lines(output: &str, n: usize) -> Vec<&str> {
    let capped = shell::tail(output, shell::MAX_OUTPUT);
    let lines: Vec<&str> = capped.lines().collect();
    lines[lines.len().saturating_sub(n)..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::Trigger;
    use crate::queue::CommandRun;

    fn entry(rule: &str, trigger: &str, expected: &[&str]) -> QueueEntry {
        QueueEntry::from_trigger(&Trigger {
            rule: rule.into(),
            hash: format!("h{trigger}"),
            trigger_files: vec![trigger.into()],
            expected_files: expected.iter().map(|s| s.to_string()).collect(),
            baseline: "b1".into(),
        })
    }

    fn pending(e: QueueEntry) -> EntryReport {
        EntryReport {
            entry: e,
            evaluation: Some(EvaluationOutcome::Pending {
                instruction: String::new(),
            }),
        }
    }

    fn tests_rule() -> Rule {
        Rule::parse(
            "tests",
            "---\nname: Keep tests in sync\nset:\n  - \"src/{path}.py\"\n  - \"tests/{path}_test.py\"\n---\nUpdate {expected_files}.\n",
        )
        .unwrap()
    }

    #[test]
    fn one_block_per_rule_with_every_pair() {
        let rule = tests_rule();
        let report = RuleReport {
            rule: "tests".into(),
            title: "Keep tests in sync".into(),
            outcome: RuleOutcome::Pending,
            entries: vec![
                pending(entry("tests", "src/a.py", &["tests/a_test.py"])),
                pending(entry("tests", "src/b.py", &["tests/b_test.py"])),
                pending(entry("tests", "src/c.py", &["tests/c_test.py"])),
            ],
            error: None,
        };
        let text = format_report(&[report], |id| (id == "tests").then_some(&rule));

        assert_eq!(text.matches("## ").count(), 1);
        assert!(text.contains("## Keep tests in sync (tests) [pending]"));
        assert!(text.contains("Update tests/a_test.py, tests/b_test.py, tests/c_test.py."));
        assert!(text.contains("- src/a.py → tests/a_test.py"));
        assert!(text.contains("- src/c.py → tests/c_test.py"));
        assert!(text.contains("<promise>tests</promise>"));
    }

    #[test]
    fn failed_commands_show_output_tail() {
        let e = entry("fmt", "src/a.py", &[]);
        let output: Vec<String> = (0..30).map(|i| format!("line{i}")).collect();
        let report = RuleReport {
            rule: "fmt".into(),
            title: "fmt".into(),
            outcome: RuleOutcome::Failed,
            entries: vec![EntryReport {
                entry: e,
                evaluation: Some(EvaluationOutcome::Settled {
                    status: QueueStatus::Failed,
                    result: ActionResult::Command {
                        runs: vec![CommandRun {
                            pass: 1,
                            command: "fmt src/a.py".into(),
                            exit_code: Some(1),
                            timed_out: false,
                            output: output.join("\n"),
                            changed_files: vec![],
                            duration_ms: 5,
                        }],
                        verdict: "exit 1: fmt src/a.py".into(),
                    },
                    recorded: true,
                }),
            }],
            error: None,
        };
        let text = format_report(&[report], |_| None);
        assert!(text.starts_with("## fmt [failed]"));
        assert!(text.contains("- src/a.py\n"));
        assert!(text.contains("    line29"));
        assert!(text.contains("    line10"));
        assert!(!text.contains("    line9\n"));
    }

    #[test]
    fn passed_commands_are_summarised() {
        let mut e = entry("fmt", "src/a.py", &[]);
        e.status = QueueStatus::Passed;
        let report = RuleReport {
            rule: "fmt".into(),
            title: "fmt".into(),
            outcome: RuleOutcome::Passed,
            entries: vec![EntryReport {
                entry: e,
                evaluation: Some(EvaluationOutcome::Settled {
                    status: QueueStatus::Passed,
                    result: ActionResult::Command {
                        runs: vec![],
                        verdict: "no changes".into(),
                    },
                    recorded: true,
                }),
            }],
            error: None,
        };
        assert_eq!(
            format_report(&[report], |_| None),
            "Applied 1 command rule: fmt\n"
        );
    }

    #[test]
    fn quiet_cycles_render_nothing() {
        let reports = vec![RuleReport {
            rule: "tests".into(),
            title: "tests".into(),
            outcome: RuleOutcome::Satisfied,
            entries: vec![],
            error: None,
        }];
        assert_eq!(format_report(&reports, |_| None), "");
    }

    #[test]
    fn outcome_severity_orders_errors_first() {
        let mut outcomes = vec![RuleOutcome::Satisfied, RuleOutcome::Failed, RuleOutcome::Pending];
        outcomes.sort();
        assert_eq!(outcomes[0], RuleOutcome::Failed);
    }
}
