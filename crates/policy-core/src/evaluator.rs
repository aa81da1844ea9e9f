//! Turns a queued entry into an outcome: a rendered instruction for prompt
//! rules, or a verified command run for command rules.

use crate::error::{PolicyError, Result};
use crate::matcher::{files_matching_any, ChangedFiles};
use crate::queue::{ActionResult, CommandRun, QueueEntry, QueueStatus, QueueStore};
use crate::rules::{Action, Rule, RunFor};
use crate::shell;
use crate::snapshot::ChangeProbe;
use crate::template::{Template, TemplateContext};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EvaluationOutcome {
    /// Prompt rule: the entry stays queued until its dismissal is reported.
    Pending { instruction: String },
    /// The entry reached a terminal status. `recorded` is false when a
    /// concurrent evaluator settled it first.
    Settled {
        status: QueueStatus,
        result: ActionResult,
        recorded: bool,
    },
}

impl EvaluationOutcome {
    pub fn status(&self) -> QueueStatus {
        match self {
            EvaluationOutcome::Pending { .. } => QueueStatus::Queued,
            EvaluationOutcome::Settled { status, .. } => *status,
        }
    }
}

pub struct Evaluator<'a> {
    root: &'a Path,
    probe: &'a dyn ChangeProbe,
    queue: &'a dyn QueueStore,
    timeout: Duration,
}

/// Render a prompt rule's body for `entry`.
pub fn render_instruction(body: &Template, entry: &QueueEntry) -> String {
    body.render_text(&TemplateContext {
        file: None,
        trigger_files: &entry.trigger_files,
        expected_files: &entry.expected_files,
    })
    .trim()
    .to_string()
}

impl<'a> Evaluator<'a> {
    pub fn new(
        root: &'a Path,
        probe: &'a dyn ChangeProbe,
        queue: &'a dyn QueueStore,
        timeout: Duration,
    ) -> Self {
        Self {
            root,
            probe,
            queue,
            timeout,
        }
    }

    /// Evaluate a queued entry against the current changed files.
    pub fn evaluate(
        &self,
        entry: &QueueEntry,
        rule: &Rule,
        changed: &ChangedFiles,
    ) -> Result<EvaluationOutcome> {
        if entry.is_terminal() {
            return Err(PolicyError::InvalidTransition {
                hash: entry.hash.clone(),
                from: entry.status.to_string(),
                to: "evaluated".to_string(),
            });
        }
        // Another session may have settled it since `entry` was read.
        if let Some(stored) = self.queue.lookup(&entry.hash)? {
            if stored.is_terminal() {
                debug!(hash = %entry.hash, status = %stored.status, "entry already settled");
                return Ok(concurrent_outcome(stored, None));
            }
        }

        let safety_files = files_matching_any(rule.safety_patterns(), changed);
        if !safety_files.is_empty() {
            let reason = format!("safety condition met by {}", safety_files.join(", "));
            return self.settle(entry, QueueStatus::Skipped, ActionResult::Skipped { reason });
        }

        match &rule.action {
            Action::Prompt { body } => Ok(EvaluationOutcome::Pending {
                instruction: render_instruction(body, entry),
            }),
            Action::Command { command, run_for } => {
                let (status, result) = self.run_verified(entry, command, *run_for)?;
                self.settle(entry, status, result)
            }
        }
    }

    /// Record the terminal status. Losing the race to a concurrent
    /// evaluator is not an error: the stored outcome is reported with
    /// `recorded: false`.
    fn settle(
        &self,
        entry: &QueueEntry,
        status: QueueStatus,
        result: ActionResult,
    ) -> Result<EvaluationOutcome> {
        match self
            .queue
            .transition(&entry.hash, status, Some(result.clone()))
        {
            Ok(true) => Ok(EvaluationOutcome::Settled {
                status,
                result,
                recorded: true,
            }),
            Ok(false) | Err(PolicyError::InvalidTransition { .. }) => {
                debug!(hash = %entry.hash, "entry settled concurrently");
                match self.queue.lookup(&entry.hash)? {
                    Some(stored) if stored.is_terminal() => {
                        Ok(concurrent_outcome(stored, Some(result)))
                    }
                    _ => Ok(EvaluationOutcome::Settled {
                        status,
                        result,
                        recorded: false,
                    }),
                }
            }
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // Command execution with idempotency verification
    // -----------------------------------------------------------------------

    /// The concrete commands one pass consists of.
    fn invocations(entry: &QueueEntry, command: &Template, run_for: RunFor) -> Vec<String> {
        let files: Vec<Option<&str>> = match run_for {
            RunFor::EachMatch => entry.trigger_files.iter().map(|f| Some(f.as_str())).collect(),
            RunFor::AllMatches => vec![None],
        };
        files
            .into_iter()
            .map(|file| {
                command.render_command(&TemplateContext {
                    file,
                    trigger_files: &entry.trigger_files,
                    expected_files: &entry.expected_files,
                })
            })
            .collect()
    }

    /// Run every invocation once. Stops at the first failing invocation.
    fn run_pass(
        &self,
        pass: u32,
        invocations: &[String],
        runs: &mut Vec<CommandRun>,
    ) -> Result<PassResult> {
        let mut changed = BTreeSet::new();
        for cmd in invocations {
            let before = self.probe.snapshot()?;
            let out = shell::run(cmd, self.root, self.timeout);
            let after = self.probe.snapshot()?;
            let diff = before.diff(&after);
            changed.extend(diff.iter().cloned());
            runs.push(CommandRun {
                pass,
                command: cmd.clone(),
                exit_code: out.exit_code,
                timed_out: out.timed_out,
                output: out.output,
                changed_files: diff,
                duration_ms: out.duration.as_millis() as u64,
            });
            if out.timed_out {
                return Ok(PassResult::Failed(format!(
                    "timed out after {}s: {cmd}",
                    self.timeout.as_secs()
                )));
            }
            if !out.success {
                let code = out
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                return Ok(PassResult::Failed(format!("exit {code}: {cmd}")));
            }
        }
        Ok(PassResult::Completed(changed.into_iter().collect()))
    }

    fn run_verified(
        &self,
        entry: &QueueEntry,
        command: &Template,
        run_for: RunFor,
    ) -> Result<(QueueStatus, ActionResult)> {
        let invocations = Self::invocations(entry, command, run_for);
        let mut runs = Vec::new();

        let (status, verdict) = match self.run_pass(1, &invocations, &mut runs)? {
            PassResult::Failed(v) => (QueueStatus::Failed, v),
            PassResult::Completed(first) if first.is_empty() => {
                (QueueStatus::Passed, "no changes".to_string())
            }
            PassResult::Completed(first) => {
                debug!(rule = %entry.rule, files = first.len(), "first pass changed files; verifying");
                match self.run_pass(2, &invocations, &mut runs)? {
                    PassResult::Failed(v) => (QueueStatus::Failed, v),
                    PassResult::Completed(second) if second.is_empty() => (
                        QueueStatus::Passed,
                        format!("applied to {}; second pass was a no-op", first.join(", ")),
                    ),
                    PassResult::Completed(second) => (
                        QueueStatus::Failed,
                        format!(
                            "not idempotent: second pass changed {}",
                            second.join(", ")
                        ),
                    ),
                }
            }
        };

        if status == QueueStatus::Failed {
            warn!(rule = %entry.rule, hash = %entry.hash, %verdict, "command failed");
        } else {
            info!(rule = %entry.rule, hash = %entry.hash, %verdict, "command passed");
        }
        Ok((status, ActionResult::Command { runs, verdict }))
    }
}

/// The outcome another writer stored. `fallback` stands in when the stored
/// record carries no result.
fn concurrent_outcome(stored: QueueEntry, fallback: Option<ActionResult>) -> EvaluationOutcome {
    let result = stored
        .result
        .or(fallback)
        .unwrap_or_else(|| ActionResult::Skipped {
            reason: format!("settled as {} by another session", stored.status),
        });
    EvaluationOutcome::Settled {
        status: stored.status,
        result,
        recorded: false,
    }
}

enum PassResult {
    /// Every invocation exited zero; the paths they changed, sorted.
    Completed(Vec<String>),
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::Trigger;
    use crate::queue::FsQueue;
    use crate::snapshot::TreeProbe;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        queue: FsQueue,
        probe: TreeProbe,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let queue = FsQueue::new(dir.path().join(".policy/queue"), Duration::from_secs(120));
            let probe = TreeProbe::new(dir.path());
            Self { dir, queue, probe }
        }

        fn evaluator(&self) -> Evaluator<'_> {
            Evaluator::new(self.dir.path(), &self.probe, &self.queue, Duration::from_secs(10))
        }

        fn queued(&self, rule: &str, files: &[&str]) -> QueueEntry {
            let trigger_files: Vec<String> = files.iter().map(|s| s.to_string()).collect();
            let entry = QueueEntry::from_trigger(&Trigger {
                rule: rule.into(),
                hash: crate::detector::trigger_hash(rule, &trigger_files, "b1"),
                trigger_files,
                expected_files: vec!["tests/a_test.py".into()],
                baseline: "b1".into(),
            });
            self.queue.create(&entry).unwrap();
            entry
        }

        fn status(&self, entry: &QueueEntry) -> QueueStatus {
            self.queue.lookup(&entry.hash).unwrap().unwrap().status
        }
    }

    fn command_rule(command: &str, run_for: &str) -> Rule {
        Rule::parse(
            "fmt",
            &format!(
                "---\ntrigger: \"src/*.py\"\naction:\n  command: \"{command}\"\n  run_for: {run_for}\n---\n"
            ),
        )
        .unwrap()
    }

    fn changed(files: &[&str]) -> ChangedFiles {
        ChangedFiles::new(files)
    }

    #[test]
    fn prompt_renders_and_leaves_entry_queued() {
        let fx = Fixture::new();
        let rule = Rule::parse(
            "tests",
            "---\npair:\n  trigger: \"src/{n}.py\"\n  expects: \"tests/{n}_test.py\"\n---\nAdd {expected_files} for {trigger_file}.\n",
        )
        .unwrap();
        let entry = fx.queued("tests", &["src/a.py"]);
        let out = fx
            .evaluator()
            .evaluate(&entry, &rule, &changed(&["src/a.py"]))
            .unwrap();
        assert_eq!(
            out,
            EvaluationOutcome::Pending {
                instruction: "Add tests/a_test.py for src/a.py.".into()
            }
        );
        assert_eq!(fx.status(&entry), QueueStatus::Queued);
    }

    #[test]
    fn zero_change_first_run_passes() {
        let fx = Fixture::new();
        let entry = fx.queued("fmt", &["src/a.py"]);
        let out = fx
            .evaluator()
            .evaluate(&entry, &command_rule("true {file}", "each_match"), &changed(&["src/a.py"]))
            .unwrap();
        assert_eq!(out.status(), QueueStatus::Passed);
        assert_eq!(fx.status(&entry), QueueStatus::Passed);
        let EvaluationOutcome::Settled { result: ActionResult::Command { runs, .. }, .. } = out else {
            panic!("expected command result");
        };
        assert_eq!(runs.len(), 1);
    }

    #[test]
    fn converging_command_passes_on_second_run() {
        let fx = Fixture::new();
        let entry = fx.queued("fmt", &["src/a.py"]);
        let out = fx
            .evaluator()
            .evaluate(
                &entry,
                &command_rule("printf done > out.txt", "all_matches"),
                &changed(&["src/a.py"]),
            )
            .unwrap();
        assert_eq!(out.status(), QueueStatus::Passed);
        let EvaluationOutcome::Settled { result: ActionResult::Command { runs, verdict }, .. } = out
        else {
            panic!("expected command result");
        };
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].changed_files, vec!["out.txt"]);
        assert!(runs[1].changed_files.is_empty());
        assert!(verdict.contains("no-op"), "{verdict}");
    }

    #[test]
    fn command_changing_files_twice_fails() {
        let fx = Fixture::new();
        let entry = fx.queued("fmt", &["src/a.py"]);
        let out = fx
            .evaluator()
            .evaluate(
                &entry,
                &command_rule("echo x >> grow.txt", "all_matches"),
                &changed(&["src/a.py"]),
            )
            .unwrap();
        assert_eq!(out.status(), QueueStatus::Failed);
        assert_eq!(fx.status(&entry), QueueStatus::Failed);
        let EvaluationOutcome::Settled { result: ActionResult::Command { verdict, .. }, .. } = out
        else {
            panic!("expected command result");
        };
        assert!(verdict.contains("grow.txt"), "{verdict}");
    }

    #[test]
    fn non_zero_exit_fails_with_output() {
        let fx = Fixture::new();
        let entry = fx.queued("fmt", &["src/a.py"]);
        let out = fx
            .evaluator()
            .evaluate(
                &entry,
                &command_rule("echo broken; exit 2", "all_matches"),
                &changed(&["src/a.py"]),
            )
            .unwrap();
        let EvaluationOutcome::Settled { status, result: ActionResult::Command { runs, verdict }, .. } = out
        else {
            panic!("expected command result");
        };
        assert_eq!(status, QueueStatus::Failed);
        assert!(verdict.starts_with("exit 2"));
        assert_eq!(runs[0].output, "broken");
    }

    #[test]
    fn each_match_runs_once_per_trigger_file() {
        let fx = Fixture::new();
        let entry = fx.queued("fmt", &["src/a.py", "src/b.py"]);
        let out = fx
            .evaluator()
            .evaluate(
                &entry,
                &command_rule("true {file}", "each_match"),
                &changed(&["src/a.py", "src/b.py"]),
            )
            .unwrap();
        let EvaluationOutcome::Settled { result: ActionResult::Command { runs, .. }, .. } = out else {
            panic!("expected command result");
        };
        let commands: Vec<&str> = runs.iter().map(|r| r.command.as_str()).collect();
        assert_eq!(commands, vec!["true src/a.py", "true src/b.py"]);
    }

    #[test]
    fn timeout_fails_the_entry() {
        let fx = Fixture::new();
        let entry = fx.queued("fmt", &["src/a.py"]);
        let evaluator =
            Evaluator::new(fx.dir.path(), &fx.probe, &fx.queue, Duration::from_millis(200));
        let out = evaluator
            .evaluate(&entry, &command_rule("sleep 30", "all_matches"), &changed(&["src/a.py"]))
            .unwrap();
        assert_eq!(out.status(), QueueStatus::Failed);
    }

    #[test]
    fn safety_observed_before_evaluation_skips() {
        let fx = Fixture::new();
        let rule = Rule::parse(
            "readme",
            "---\ntrigger: \"src/**/*.py\"\nsafety: README.md\n---\nUpdate the README.\n",
        )
        .unwrap();
        let entry = fx.queued("readme", &["src/a.py"]);
        let out = fx
            .evaluator()
            .evaluate(&entry, &rule, &changed(&["src/a.py", "README.md"]))
            .unwrap();
        assert_eq!(out.status(), QueueStatus::Skipped);
        assert_eq!(fx.status(&entry), QueueStatus::Skipped);
    }

    #[test]
    fn terminal_entries_are_rejected() {
        let fx = Fixture::new();
        let mut entry = fx.queued("fmt", &["src/a.py"]);
        entry.settle(QueueStatus::Passed, None);
        let err = fx
            .evaluator()
            .evaluate(&entry, &command_rule("true", "all_matches"), &changed(&[]))
            .unwrap_err();
        assert!(matches!(err, PolicyError::InvalidTransition { .. }));
    }

    #[test]
    fn entry_settled_elsewhere_is_not_rerun() {
        let fx = Fixture::new();
        let stale = fx.queued("fmt", &["src/a.py"]);
        fx.queue
            .transition(&stale.hash, QueueStatus::Passed, Some(ActionResult::Dismissed))
            .unwrap();

        let out = fx
            .evaluator()
            .evaluate(
                &stale,
                &command_rule("printf ran > stamp.txt", "all_matches"),
                &changed(&["src/a.py"]),
            )
            .unwrap();
        assert_eq!(
            out,
            EvaluationOutcome::Settled {
                status: QueueStatus::Passed,
                result: ActionResult::Dismissed,
                recorded: false,
            }
        );
        assert!(!fx.dir.path().join("stamp.txt").exists());
    }

    /// Hands out the stale queued copy on the first lookup, as if another
    /// session settled the entry while the command was running.
    struct LateSettle<'a> {
        inner: &'a FsQueue,
        stale: QueueEntry,
        lookups: std::cell::Cell<u32>,
    }

    impl QueueStore for LateSettle<'_> {
        fn lookup(&self, hash: &str) -> Result<Option<QueueEntry>> {
            let n = self.lookups.get();
            self.lookups.set(n + 1);
            if n == 0 {
                return Ok(Some(self.stale.clone()));
            }
            self.inner.lookup(hash)
        }
        fn create(&self, entry: &QueueEntry) -> Result<bool> {
            self.inner.create(entry)
        }
        fn transition(
            &self,
            hash: &str,
            status: QueueStatus,
            result: Option<ActionResult>,
        ) -> Result<bool> {
            self.inner.transition(hash, status, result)
        }
        fn list(&self) -> Result<Vec<QueueEntry>> {
            self.inner.list()
        }
        fn remove(&self, hash: &str) -> Result<bool> {
            self.inner.remove(hash)
        }
    }

    #[test]
    fn losing_the_settle_race_reports_stored_outcome() {
        let fx = Fixture::new();
        let stale = fx.queued("fmt", &["src/a.py"]);
        fx.queue
            .transition(
                &stale.hash,
                QueueStatus::Failed,
                Some(ActionResult::Skipped { reason: "other".into() }),
            )
            .unwrap();
        let racing = LateSettle {
            inner: &fx.queue,
            stale: stale.clone(),
            lookups: std::cell::Cell::new(0),
        };
        let evaluator =
            Evaluator::new(fx.dir.path(), &fx.probe, &racing, Duration::from_secs(10));

        let out = evaluator
            .evaluate(&stale, &command_rule("true", "all_matches"), &changed(&["src/a.py"]))
            .unwrap();
        let EvaluationOutcome::Settled { status, result, recorded } = out else {
            panic!("expected settled outcome");
        };
        assert_eq!(status, QueueStatus::Failed);
        assert!(!recorded);
        assert!(matches!(result, ActionResult::Skipped { reason } if reason == "other"));
        assert_eq!(fx.status(&stale), QueueStatus::Failed);
    }
}
