mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{queue::QueueSubcommand, rules::RulesSubcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "policy",
    about = "File-change policies for agent-assisted coding: detect, queue, and report rule violations",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .policy/ or .git/)
    #[arg(long, global = true, env = "POLICY_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize .policy/ in the current project
    Init,

    /// Run one check cycle and print the batched report
    Check {
        /// Changed file (repeatable). Without any, changes come from git.
        #[arg(long = "file", value_name = "PATH")]
        files: Vec<String>,

        /// Baseline identifier for explicit --file input
        #[arg(long, requires = "files")]
        baseline: Option<String>,

        /// Agent output to scan for dismissal markers before checking
        #[arg(long, value_name = "FILE")]
        transcript: Option<PathBuf>,
    },

    /// Inspect and validate rules
    Rules {
        #[command(subcommand)]
        subcommand: RulesSubcommand,
    },

    /// Inspect and manage the trigger queue
    Queue {
        #[command(subcommand)]
        subcommand: QueueSubcommand,
    },

    /// Report prompt rules as addressed
    Dismiss {
        /// Rule identifiers (case-insensitive)
        rules: Vec<String>,

        /// Scan this file for dismissal markers instead
        #[arg(long, value_name = "FILE", conflicts_with = "rules")]
        transcript: Option<PathBuf>,
    },

    /// Capture the working copy as the baseline for compare_to: prompt rules
    Baseline,

    /// Match a pattern against paths and print the captures
    Match {
        pattern: String,
        #[arg(required = true)]
        paths: Vec<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Check {
            files,
            baseline,
            transcript,
        } => cmd::check::run(&root, &files, baseline, transcript.as_deref(), cli.json),
        Commands::Rules { subcommand } => cmd::rules::run(&root, subcommand, cli.json),
        Commands::Queue { subcommand } => cmd::queue::run(&root, subcommand, cli.json),
        Commands::Dismiss { rules, transcript } => {
            cmd::dismiss::run(&root, &rules, transcript.as_deref(), cli.json)
        }
        Commands::Baseline => cmd::baseline::run(&root, cli.json),
        Commands::Match { pattern, paths } => cmd::pattern::run(&pattern, &paths, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
