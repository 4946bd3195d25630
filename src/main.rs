use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use stagehand::config::Mode;

mod cmd;

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(version, about = "Moves kanban stages through a pipeline of skill and resolver states")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Repository root (defaults to the current directory)
    #[arg(long, global = true)]
    pub repo: Option<PathBuf>,

    /// Emit logs as JSON on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the pipeline configuration (exit 0 valid, 2 invalid)
    Validate {
        /// Invoke each resolver against a synthetic stage
        #[arg(long)]
        dry_run: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        /// Use simulated external services for the dry run
        #[arg(long)]
        mock: bool,
    },
    /// Run the orchestration loop
    Run {
        /// Run a single tick and wait for the sessions it started
        #[arg(long)]
        once: bool,

        /// Simulate agent sessions and the code host
        #[arg(long)]
        mock: bool,

        /// Override defaults.max_parallel
        #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
        max_parallel: Option<u16>,
    },
    /// Print the compiled pipeline
    States,
}

fn mode(mock: bool) -> Mode {
    if mock { Mode::Simulated } else { Mode::Normal }
}

async fn dispatch(cli: &Cli) -> Result<ExitCode> {
    let repo = match cli.repo.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // Resolvers see the repo's .env
    let _ = dotenvy::from_path(repo.join(".env"));
    let _guard = stagehand::logging::init(&repo, cli.log_json, cli.verbose);

    match &cli.command {
        Commands::Validate {
            dry_run,
            json,
            mock,
        } => cmd::cmd_validate(&repo, *dry_run, *json, mode(*mock)).await,
        Commands::Run {
            once,
            mock,
            max_parallel,
        } => cmd::cmd_run(&repo, *once, mode(*mock), max_parallel.map(usize::from)).await,
        Commands::States => {
            cmd::cmd_states(&repo)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(&cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", console::style("Error:").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
