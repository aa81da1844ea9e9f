use super::load_config;
use crate::output::{print_json, short_hash};
use anyhow::Context;
use policy_core::changes::GitChanges;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = load_config(root)?;
    let baseline = GitChanges::new(root, config.default_branch.clone())
        .capture_prompt_baseline()
        .context("failed to capture prompt baseline")?;

    if json {
        return print_json(&baseline);
    }
    println!(
        "Captured prompt baseline at {} ({} dirty file{}).",
        short_hash(&baseline.head),
        baseline.files.len(),
        if baseline.files.len() == 1 { "" } else { "s" }
    );
    Ok(())
}
