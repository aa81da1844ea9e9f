use super::{load_config, open_queue};
use crate::output::{print_json, print_table, short_hash};
use anyhow::Context;
use clap::Subcommand;
use policy_core::engine::Engine;
use policy_core::queue::{ActionResult, QueueEntry, QueueStatus, QueueStore};
use policy_core::snapshot::TreeProbe;
use std::path::Path;

#[derive(Subcommand)]
pub enum QueueSubcommand {
    /// List queue entries, oldest first
    List {
        /// Only entries with this status (queued, passed, failed, skipped)
        #[arg(long)]
        status: Option<QueueStatus>,
    },
    /// Show one entry in full
    Show {
        /// Full hash or a unique prefix
        hash: String,
    },
    /// Mark a queued entry as skipped
    Skip {
        hash: String,
        #[arg(long, default_value = "skipped by caller")]
        reason: String,
    },
    /// Delete settled entries
    Prune {
        /// Only prune this terminal status (default: all terminal entries)
        #[arg(long)]
        status: Option<QueueStatus>,
    },
}

pub fn run(root: &Path, subcmd: QueueSubcommand, json: bool) -> anyhow::Result<()> {
    let config = load_config(root)?;
    let queue = open_queue(root, &config)?;
    match subcmd {
        QueueSubcommand::List { status } => list(queue.as_ref(), status, json),
        QueueSubcommand::Show { hash } => show(queue.as_ref(), &hash, json),
        QueueSubcommand::Skip { hash, reason } => {
            let entry = find(queue.as_ref(), &hash)?;
            let probe = TreeProbe::new(root);
            let engine = Engine::new(root, &config, queue.as_ref(), &probe);
            let recorded = engine
                .override_entry(&entry.hash, &reason)
                .with_context(|| format!("failed to skip {}", entry.hash))?;
            if json {
                print_json(&serde_json::json!({ "hash": entry.hash, "skipped": recorded }))
            } else {
                if recorded {
                    println!("Skipped {}.", short_hash(&entry.hash));
                } else {
                    println!("{} was settled concurrently.", short_hash(&entry.hash));
                }
                Ok(())
            }
        }
        QueueSubcommand::Prune { status } => prune(queue.as_ref(), status, json),
    }
}

/// Resolve a full hash or unique prefix.
fn find(queue: &dyn QueueStore, hash: &str) -> anyhow::Result<QueueEntry> {
    if let Some(entry) = queue.lookup(hash)? {
        return Ok(entry);
    }
    let mut matches: Vec<QueueEntry> = queue
        .list()?
        .into_iter()
        .filter(|e| e.hash.starts_with(hash))
        .collect();
    match matches.len() {
        0 => anyhow::bail!("queue entry not found: {hash}"),
        1 => Ok(matches.remove(0)),
        n => anyhow::bail!("hash prefix '{hash}' is ambiguous ({n} entries)"),
    }
}

fn list(queue: &dyn QueueStore, status: Option<QueueStatus>, json: bool) -> anyhow::Result<()> {
    let entries: Vec<QueueEntry> = queue
        .list()?
        .into_iter()
        .filter(|e| status.map_or(true, |s| e.status == s))
        .collect();

    if json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }
    let rows = entries
        .iter()
        .map(|e| {
            vec![
                short_hash(&e.hash).to_string(),
                e.rule.clone(),
                e.status.to_string(),
                e.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                e.trigger_files.join(", "),
            ]
        })
        .collect();
    print_table(&["HASH", "RULE", "STATUS", "CREATED", "FILES"], rows);
    Ok(())
}

fn show(queue: &dyn QueueStore, hash: &str, json: bool) -> anyhow::Result<()> {
    let entry = find(queue, hash)?;
    if json {
        return print_json(&entry);
    }
    println!("Hash:     {}", entry.hash);
    println!("Rule:     {}", entry.rule);
    println!("Status:   {}", entry.status);
    println!("Baseline: {}", entry.baseline);
    println!("Created:  {}", entry.created_at.to_rfc3339());
    if let Some(at) = entry.evaluated_at {
        println!("Settled:  {}", at.to_rfc3339());
    }
    println!("\nTrigger files:");
    for f in &entry.trigger_files {
        println!("  {f}");
    }
    if !entry.expected_files.is_empty() {
        println!("\nExpected files:");
        for f in &entry.expected_files {
            println!("  {f}");
        }
    }
    match &entry.result {
        Some(ActionResult::Command { runs, verdict }) => {
            println!("\nResult: {verdict}");
            for run in runs {
                let code = run
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("  pass {} exit {code} ({} ms): {}", run.pass, run.duration_ms, run.command);
                if !run.changed_files.is_empty() {
                    println!("    changed: {}", run.changed_files.join(", "));
                }
            }
        }
        Some(ActionResult::Dismissed) => println!("\nResult: dismissed"),
        Some(ActionResult::Skipped { reason }) => println!("\nResult: skipped ({reason})"),
        None => {}
    }
    Ok(())
}

fn prune(queue: &dyn QueueStore, status: Option<QueueStatus>, json: bool) -> anyhow::Result<()> {
    if status == Some(QueueStatus::Queued) {
        anyhow::bail!("queued entries cannot be pruned; skip them first");
    }
    let mut removed = Vec::new();
    for entry in queue.list()? {
        let selected = match status {
            Some(s) => entry.status == s,
            None => entry.is_terminal(),
        };
        if selected && queue.remove(&entry.hash)? {
            removed.push(entry.hash);
        }
    }
    if json {
        print_json(&serde_json::json!({ "removed": removed }))
    } else {
        println!("Pruned {} entr{}.", removed.len(), if removed.len() == 1 { "y" } else { "ies" });
        Ok(())
    }
}
