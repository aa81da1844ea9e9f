use super::{load_config, load_rules, open_queue};
use crate::output::print_json;
use anyhow::Context;
use policy_core::changes::{ChangeSource, GitChanges, StaticChanges};
use policy_core::engine::Engine;
use policy_core::snapshot::TreeProbe;
use std::path::Path;

/// Baseline used for explicit `--file` input when none is given.
const EXPLICIT_BASELINE: &str = "explicit";

pub fn run(
    root: &Path,
    files: &[String],
    baseline: Option<String>,
    transcript: Option<&Path>,
    json: bool,
) -> anyhow::Result<()> {
    let config = load_config(root)?;
    let rules = load_rules(root, &config)?;
    let queue = open_queue(root, &config)?;
    let probe = TreeProbe::new(root);
    let engine = Engine::new(root, &config, queue.as_ref(), &probe);

    if let Some(path) = transcript {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let settled = engine
            .dismiss_from_text(&rules, &text)
            .context("failed to record dismissals")?;
        if !settled.is_empty() && !json {
            eprintln!("dismissed {} queued entr{}", settled.len(), plural_y(settled.len()));
        }
    }

    let source: Box<dyn ChangeSource> = if files.is_empty() {
        Box::new(GitChanges::new(root, config.default_branch.clone()))
    } else {
        Box::new(StaticChanges::new(
            files,
            baseline.unwrap_or_else(|| EXPLICIT_BASELINE.to_string()),
        ))
    };

    let report = engine
        .check(&rules, source.as_ref())
        .context("check failed")?;

    if json {
        print_json(&report)?;
    } else if report.text.is_empty() {
        println!("All policies satisfied.");
    } else {
        print!("{}", report.text);
    }
    Ok(())
}

fn plural_y(n: usize) -> &'static str {
    if n == 1 {
        "y"
    } else {
        "ies"
    }
}
