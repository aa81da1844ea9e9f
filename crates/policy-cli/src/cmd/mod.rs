pub mod baseline;
pub mod check;
pub mod dismiss;
pub mod init;
pub mod pattern;
pub mod queue;
pub mod rules;

use anyhow::Context;
use policy_core::config::{Config, WarnLevel};
use policy_core::queue::QueueStore;
use policy_core::rules::RuleSet;
use std::path::Path;

/// Load the config, refusing one with validation errors.
pub fn load_config(root: &Path) -> anyhow::Result<Config> {
    let config = Config::load(root).context("failed to load .policy/config.yaml")?;
    if let Some(err) = config
        .validate()
        .into_iter()
        .find(|w| w.level == WarnLevel::Error)
    {
        anyhow::bail!("invalid config: {}", err.message);
    }
    Ok(config)
}

pub fn load_rules(root: &Path, config: &Config) -> anyhow::Result<RuleSet> {
    let dir = config.rules_path(root);
    RuleSet::load(&dir).with_context(|| format!("failed to load rules from {}", dir.display()))
}

pub fn open_queue(root: &Path, config: &Config) -> anyhow::Result<Box<dyn QueueStore>> {
    policy_core::queue::open(root, config).context("failed to open queue")
}
