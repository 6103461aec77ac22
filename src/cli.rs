// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};

#[derive(Parser, Debug)]
#[command(
    name = "recall",
    about = "Bounded per-session message memory for multi-session chat clients",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a config file merged on top of the discovered ones
    #[arg(long, short = 'c', env = "RECALL_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Verbosity (-v = debug, -vv = trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Feed a captured transport stream through the memory manager and
    /// print the resulting per-session state
    Replay(ReplayArgs),

    /// Print the merged configuration as YAML
    ShowConfig,

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct ReplayArgs {
    /// JSONL file with one transport event per line
    #[arg(value_name = "EVENTS")]
    pub events: PathBuf,

    /// JSONL file with the backend's message history, one
    /// `{"session_id": …, <message>}` object per line
    #[arg(long, value_name = "MESSAGES")]
    pub history: Option<PathBuf>,

    /// Sessions to select, in order, after the events have been delivered
    #[arg(long, value_name = "ID")]
    pub select: Vec<String>,

    /// Override `memory.message_limit`
    #[arg(long, value_name = "N")]
    pub limit: Option<usize>,

    /// Override `memory.max_sessions`
    #[arg(long, value_name = "N")]
    pub max_sessions: Option<usize>,

    /// Override `memory.zombie_timeout_secs`, e.g. "10m" or "90s"
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    pub zombie_timeout: Option<Duration>,

    /// Print the report as JSON instead of text
    #[arg(long)]
    pub json: bool,
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "recall", &mut std::io::stdout());
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn replay_parses_overrides() {
        let cli = Cli::try_parse_from([
            "recall",
            "-vv",
            "replay",
            "events.jsonl",
            "--history",
            "history.jsonl",
            "--select",
            "a",
            "--select",
            "b",
            "--limit",
            "40",
            "--zombie-timeout",
            "90s",
            "--json",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Commands::Replay(args) = cli.command else {
            panic!("expected replay");
        };
        assert_eq!(args.select, ["a", "b"]);
        assert_eq!(args.limit, Some(40));
        assert_eq!(args.zombie_timeout, Some(Duration::from_secs(90)));
        assert!(args.json);
    }

    #[test]
    fn invalid_duration_is_rejected() {
        assert!(Cli::try_parse_from(["recall", "replay", "e.jsonl", "--zombie-timeout", "soon"]).is_err());
    }
}
