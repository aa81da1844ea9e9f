use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid pattern '{pattern}': {reason}")]
    PatternCompile { pattern: String, reason: String },

    #[error("pattern '{pattern}' references variable '{variable}' with no captured value")]
    MissingVariable { pattern: String, variable: String },

    #[error("pattern '{pattern}' cannot be resolved to a concrete path: '{segment}' is not a literal or capture")]
    Unresolvable { pattern: String, segment: String },

    #[error("invalid rule '{rule}': {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("rule not found: {0}")]
    RuleNotFound(String),

    #[error("invalid rule id '{0}': must be alphanumeric with hyphens or underscores")]
    InvalidRuleId(String),

    #[error("invalid trigger hash '{0}'")]
    InvalidHash(String),

    #[error("queue entry not found: {0}")]
    EntryNotFound(String),

    #[error("invalid transition for entry {hash} from {from} to {to}")]
    InvalidTransition {
        hash: String,
        from: String,
        to: String,
    },

    #[error("queue database error: {0}")]
    QueueDb(String),

    #[error("change source failed: {0}")]
    ChangeSource(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PolicyError>;
