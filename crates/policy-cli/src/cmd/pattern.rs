use crate::output::print_json;
use anyhow::Context;
use policy_core::matcher::normalize_path;
use policy_core::pattern::Pattern;
use serde::Serialize;

#[derive(Serialize)]
struct PathMatch {
    path: String,
    matched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    captures: Option<policy_core::pattern::Captures>,
}

pub fn run(pattern: &str, paths: &[String], json: bool) -> anyhow::Result<()> {
    let compiled = Pattern::compile(pattern).context("pattern does not compile")?;

    let results: Vec<PathMatch> = paths
        .iter()
        .map(|p| {
            let path = normalize_path(p);
            let captures = compiled.matches(&path);
            PathMatch {
                matched: captures.is_some(),
                path,
                captures,
            }
        })
        .collect();

    if json {
        return print_json(&serde_json::json!({
            "pattern": compiled.source(),
            "variables": compiled.variables(),
            "results": results,
        }));
    }

    for r in &results {
        match &r.captures {
            None => println!("{}: no match", r.path),
            Some(c) if c.is_empty() => println!("{}: match", r.path),
            Some(c) => {
                let vars: Vec<String> = c.iter().map(|(k, v)| format!("{k}={v}")).collect();
                println!("{}: match ({})", r.path, vars.join(", "));
            }
        }
    }
    Ok(())
}
