use crate::error::Result;
use crate::paths;
use crate::rules::CompareTo;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// QueueConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackend {
    /// One YAML record per entry under `.policy/queue/`.
    #[default]
    Files,
    /// A single redb database at `.policy/queue.redb`.
    Redb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub backend: QueueBackend,
    #[serde(default = "default_stale_lock")]
    pub stale_lock_seconds: u64,
}

fn default_stale_lock() -> u64 {
    120
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::default(),
            stale_lock_seconds: default_stale_lock(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_rules_dir")]
    pub rules_dir: String,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default = "default_timeout")]
    pub command_timeout_seconds: u64,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    #[serde(default)]
    pub default_compare_to: CompareTo,
}

fn default_rules_dir() -> String {
    paths::RULES_DIR.to_string()
}

fn default_timeout() -> u64 {
    60
}

fn default_branch() -> String {
    "main".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rules_dir: default_rules_dir(),
            queue: QueueConfig::default(),
            command_timeout_seconds: default_timeout(),
            default_branch: default_branch(),
            default_compare_to: CompareTo::default(),
        }
    }
}

impl Config {
    /// Load `.policy/config.yaml`, or the defaults when it is absent.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn rules_path(&self, root: &Path) -> PathBuf {
        root.join(&self.rules_dir)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        // Commands must always run under a bound.
        if self.command_timeout_seconds == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "command_timeout_seconds must be greater than 0".to_string(),
            });
        } else if self.command_timeout_seconds > 3600 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "command_timeout_seconds={} (over an hour is unusual)",
                    self.command_timeout_seconds
                ),
            });
        }

        if self.rules_dir.trim().is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "rules_dir is empty".to_string(),
            });
        } else if Path::new(&self.rules_dir).is_absolute() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "rules_dir '{}' is absolute; rules usually live inside the project",
                    self.rules_dir
                ),
            });
        }

        if self.default_branch.trim().is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "default_branch is empty".to_string(),
            });
        }

        if self.queue.backend == QueueBackend::Files && self.queue.stale_lock_seconds == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "queue.stale_lock_seconds=0 reclaims every lock immediately".to_string(),
            });
        }

        warnings
    }

    /// True when `validate` reports no errors.
    pub fn is_valid(&self) -> bool {
        !self
            .validate()
            .iter()
            .any(|w| w.level == WarnLevel::Error)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::load(dir.path()).unwrap();
        assert_eq!(cfg.rules_dir, ".policy/rules");
        assert_eq!(cfg.command_timeout_seconds, 60);
        assert_eq!(cfg.queue.backend, QueueBackend::Files);
        assert_eq!(cfg.queue.stale_lock_seconds, 120);
        assert_eq!(cfg.default_compare_to, CompareTo::Base);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let cfg = Config {
            default_branch: "trunk".into(),
            default_compare_to: CompareTo::Prompt,
            queue: QueueConfig {
                backend: QueueBackend::Redb,
                stale_lock_seconds: 30,
            },
            ..Config::default()
        };
        cfg.save(dir.path()).unwrap();
        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.default_branch, "trunk");
        assert_eq!(loaded.default_compare_to, CompareTo::Prompt);
        assert_eq!(loaded.queue.backend, QueueBackend::Redb);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let cfg: Config = serde_yaml::from_str("queue:\n  backend: redb\n").unwrap();
        assert_eq!(cfg.queue.backend, QueueBackend::Redb);
        assert_eq!(cfg.queue.stale_lock_seconds, 120);
        assert_eq!(cfg.default_branch, "main");
    }

    #[test]
    fn validate_default_config_no_warnings() {
        assert!(Config::default().validate().is_empty());
        assert!(Config::default().is_valid());
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let cfg = Config {
            command_timeout_seconds: 0,
            ..Config::default()
        };
        let warnings = cfg.validate();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].level, WarnLevel::Error);
        assert!(!cfg.is_valid());
    }

    #[test]
    fn validate_flags_long_timeout_as_warning() {
        let cfg = Config {
            command_timeout_seconds: 7200,
            ..Config::default()
        };
        let warnings = cfg.validate();
        assert_eq!(warnings[0].level, WarnLevel::Warning);
        assert!(cfg.is_valid());
    }
}
