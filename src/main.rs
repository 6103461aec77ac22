// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;
mod replay;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match &cli.command {
        Commands::Completions { shell } => {
            cli::print_completions(*shell);
            Ok(())
        }
        Commands::ShowConfig => {
            let config = recall_config::load(cli.config.as_deref())?;
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            Ok(())
        }
        Commands::Replay(args) => {
            let mut config = recall_config::load(cli.config.as_deref())?;
            replay::apply_overrides(&mut config, args)?;
            let report = replay::run(config, args).await?;
            if args.json {
                let json = serde_json::to_string_pretty(&report).context("encoding replay report")?;
                println!("{json}");
            } else {
                replay::print_text(&report);
            }
            Ok(())
        }
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}
