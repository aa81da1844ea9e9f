use super::load_rules;
use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use policy_core::config::{Config, WarnLevel};
use policy_core::rules::{Action, RunFor};
use std::path::Path;

#[derive(Subcommand)]
pub enum RulesSubcommand {
    /// List loaded rules
    List,
    /// Load every rule and the config, reporting the first error
    Validate,
}

pub fn run(root: &Path, subcmd: RulesSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        RulesSubcommand::List => list(root, json),
        RulesSubcommand::Validate => validate(root, json),
    }
}

// ---------------------------------------------------------------------------
// list
// ---------------------------------------------------------------------------

fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let rules = load_rules(root, &config)?;

    let rows: Vec<serde_json::Value> = rules
        .iter()
        .map(|r| {
            let run_for = match &r.action {
                Action::Command { run_for, .. } => Some(match run_for {
                    RunFor::EachMatch => "each_match",
                    RunFor::AllMatches => "all_matches",
                }),
                Action::Prompt { .. } => None,
            };
            serde_json::json!({
                "id": r.id,
                "title": r.title(),
                "mode": r.detection.kind(),
                "action": r.action.kind(),
                "run_for": run_for,
                "compare_to": r.effective_compare_to(config.default_compare_to).as_str(),
            })
        })
        .collect();

    if json {
        return print_json(&rows);
    }
    if rows.is_empty() {
        println!("No rules in {}.", config.rules_dir);
        return Ok(());
    }
    let table = rules
        .iter()
        .map(|r| {
            vec![
                r.id.clone(),
                r.detection.kind().to_string(),
                r.action.kind().to_string(),
                r.effective_compare_to(config.default_compare_to).to_string(),
                r.title().to_string(),
            ]
        })
        .collect();
    print_table(&["ID", "MODE", "ACTION", "COMPARE_TO", "TITLE"], table);
    Ok(())
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn validate(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let warnings = config.validate();
    let rules = load_rules(root, &config)?;

    if json {
        let value = serde_json::json!({
            "rules": rules.len(),
            "warnings": warnings,
        });
        print_json(&value)?;
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
        println!("{} rule(s) valid.", rules.len());
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}
