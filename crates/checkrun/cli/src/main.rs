// Checkrun
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Checkrun CLI
//!
//! Runs a rule catalog against a compiled build description and writes
//! the aggregated findings into the results directory.

mod commands;

use clap::{Args, Parser, Subcommand};
use checkrun_common::AnalysisConfig;
use std::path::PathBuf;
use std::process;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "checkrun")]
#[command(about = "Checkrun - multi-checker static analysis orchestrator")]
#[command(version = "0.1.0")]
pub struct Cli {
    /// Path to configuration file (TOML, overrides $CHECKRUN_CONFIG)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options of an analysis run
#[derive(Args, Debug, Clone)]
pub struct AnalyzeArgs {
    /// JSON list of build actions produced by the compile-command parser
    #[arg(long)]
    pub build_actions: PathBuf,

    /// JSON rule catalog
    #[arg(long)]
    pub rules: PathBuf,

    /// Rule to run (repeatable); all catalog rules when omitted
    #[arg(long = "rule")]
    pub rule: Vec<String>,

    /// Results directory
    #[arg(long)]
    pub results_dir: Option<PathBuf>,

    /// Worker threads, 0 for one per CPU
    #[arg(long)]
    pub workers: Option<usize>,

    /// Contain checkers in memory groups and retry memory kills
    #[arg(long)]
    pub limit_memory: bool,

    /// Skip building the cross-translation-unit index
    #[arg(long)]
    pub no_ctu: bool,
}

/// Subcommands for configuration inspection
#[derive(Subcommand, Debug)]
#[command(about = "Inspect or write checkrun configuration")]
pub enum ConfigCommands {
    /// Show current effective configuration
    Show,
    /// Write the default configuration to a file
    Init { path: PathBuf },
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Analyze a build with the selected rules
    Analyze(AnalyzeArgs),

    /// Inspect or write configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = AnalysisConfig::resolve_config(cli.config)?;

    match cli.command {
        Commands::Analyze(args) => {
            let outcome = commands::analyze::run_analysis(config, args).await?;
            if outcome.interrupted {
                anyhow::bail!("Analysis interrupted after {} of {} rules", outcome.completed, outcome.total);
            }
        }
        Commands::Config { command } => {
            commands::config::handle_config_command(&config, command)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        process::exit(1);
    }
}
