//! Queue entry data model.
//!
//! A `QueueEntry` records one firing of one rule, keyed by its trigger hash.
//! Its status moves `Queued → Passed | Failed | Skipped` exactly once; the
//! terminal states are absorbing.

use crate::detector::Trigger;
use crate::error::PolicyError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// QueueStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Passed,
    Failed,
    Skipped,
}

impl QueueStatus {
    pub fn all() -> &'static [QueueStatus] {
        &[
            QueueStatus::Queued,
            QueueStatus::Passed,
            QueueStatus::Failed,
            QueueStatus::Skipped,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Passed => "passed",
            QueueStatus::Failed => "failed",
            QueueStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, QueueStatus::Queued)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueStatus::all()
            .iter()
            .copied()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| {
                PolicyError::InvalidConfig(format!(
                    "unknown status '{s}': must be queued, passed, failed, or skipped"
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// ActionResult
// ---------------------------------------------------------------------------

/// One execution of a command template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRun {
    /// 1 for the initial run, 2 for the idempotency check.
    pub pass: u32,
    pub command: String,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub timed_out: bool,
    pub output: String,
    /// Files this run added, removed, or modified.
    #[serde(default)]
    pub changed_files: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionResult {
    Command {
        runs: Vec<CommandRun>,
        verdict: String,
    },
    /// A prompt rule whose dismissal marker was reported.
    Dismissed,
    Skipped {
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// QueueEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub hash: String,
    pub rule: String,
    pub trigger_files: Vec<String>,
    #[serde(default)]
    pub expected_files: Vec<String>,
    pub baseline: String,
    pub status: QueueStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ActionResult>,
}

impl QueueEntry {
    /// A fresh `Queued` entry for a detector firing.
    pub fn from_trigger(trigger: &Trigger) -> Self {
        Self {
            hash: trigger.hash.clone(),
            rule: trigger.rule.clone(),
            trigger_files: trigger.trigger_files.clone(),
            expected_files: trigger.expected_files.clone(),
            baseline: trigger.baseline.clone(),
            status: QueueStatus::Queued,
            created_at: Utc::now(),
            evaluated_at: None,
            result: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a terminal transition in memory.
    pub(crate) fn settle(&mut self, status: QueueStatus, result: Option<ActionResult>) {
        self.status = status;
        self.evaluated_at = Some(Utc::now());
        self.result = result;
    }
}
