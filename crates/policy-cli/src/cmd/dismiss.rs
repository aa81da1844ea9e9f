use super::{load_config, load_rules, open_queue};
use crate::output::print_json;
use anyhow::Context;
use policy_core::engine::Engine;
use policy_core::snapshot::TreeProbe;
use std::path::Path;

pub fn run(
    root: &Path,
    rule_ids: &[String],
    transcript: Option<&Path>,
    json: bool,
) -> anyhow::Result<()> {
    if rule_ids.is_empty() && transcript.is_none() {
        anyhow::bail!("name at least one rule or pass --transcript");
    }
    let config = load_config(root)?;
    let rules = load_rules(root, &config)?;
    let queue = open_queue(root, &config)?;
    let probe = TreeProbe::new(root);
    let engine = Engine::new(root, &config, queue.as_ref(), &probe);

    let settled = match transcript {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            engine.dismiss_from_text(&rules, &text)?
        }
        None => {
            let ids: Vec<&str> = rule_ids.iter().map(String::as_str).collect();
            engine.dismiss(&rules, &ids)?
        }
    };

    if json {
        print_json(&serde_json::json!({ "dismissed": settled }))
    } else {
        println!(
            "Dismissed {} queued entr{}.",
            settled.len(),
            if settled.len() == 1 { "y" } else { "ies" }
        );
        Ok(())
    }
}
