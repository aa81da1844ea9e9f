use crate::error::{PolicyError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const POLICY_DIR: &str = ".policy";
pub const RULES_DIR: &str = ".policy/rules";
pub const QUEUE_DIR: &str = ".policy/queue";

pub const CONFIG_FILE: &str = ".policy/config.yaml";
pub const QUEUE_DB_FILE: &str = ".policy/queue.redb";
pub const PROMPT_BASELINE_FILE: &str = ".policy/prompt_baseline.yaml";

pub const RULE_EXTENSION: &str = "md";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn policy_dir(root: &Path) -> PathBuf {
    root.join(POLICY_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn queue_dir(root: &Path) -> PathBuf {
    root.join(QUEUE_DIR)
}

pub fn queue_db_path(root: &Path) -> PathBuf {
    root.join(QUEUE_DB_FILE)
}

pub fn prompt_baseline_path(root: &Path) -> PathBuf {
    root.join(PROMPT_BASELINE_FILE)
}

// ---------------------------------------------------------------------------
// Rule identifier validation
// ---------------------------------------------------------------------------

static RULE_ID_RE: OnceLock<Regex> = OnceLock::new();

fn rule_id_re() -> &'static Regex {
    RULE_ID_RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_\-]*$").expect("rule id regex is valid")
    })
}

pub fn validate_rule_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 96 || !rule_id_re().is_match(id) {
        return Err(PolicyError::InvalidRuleId(id.to_string()));
    }
    Ok(())
}
