use anyhow::Context;
use policy_core::{config::Config, io, paths};
use std::path::Path;

/// Local state that never belongs in version control.
const GITIGNORE_ENTRIES: &[&str] = &[
    ".policy/queue/",
    ".policy/queue.redb",
    ".policy/prompt_baseline.yaml",
];

pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing policy rules in: {}", root.display());

    for dir in [paths::POLICY_DIR, paths::RULES_DIR] {
        let p = root.join(dir);
        io::ensure_dir(&p).with_context(|| format!("failed to create {}", p.display()))?;
    }

    let config_path = paths::config_path(root);
    if !config_path.exists() {
        Config::default()
            .save(root)
            .context("failed to write config.yaml")?;
        println!("  created: .policy/config.yaml");
    } else {
        println!("  exists:  .policy/config.yaml");
    }

    for entry in GITIGNORE_ENTRIES {
        io::ensure_gitignore_entry(root, entry).context("failed to update .gitignore")?;
    }

    println!("\nAdd rules as .policy/rules/<id>.md, then run `policy check`.");
    Ok(())
}
