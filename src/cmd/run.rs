//! Orchestration loop: `stagehand run`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use stagehand::config::{ConfirmationPolicy, Mode};
use stagehand::discovery::{CommandStageQuery, Discovery};
use stagehand::orchestrator::Orchestrator;
use stagehand::session::ConsoleResponder;
use stagehand::store::FrontmatterStageStore;
use stagehand::worktree::{GitWorktreeManager, TestWorktreeManager, WorktreeIsolation};

use super::validate::{print_report, validate_config};
use super::{AGENT_CMD_ENV, EXIT_INVALID, load_config};

pub async fn cmd_run(
    repo: &Path,
    once: bool,
    mode: Mode,
    max_parallel: Option<usize>,
) -> Result<ExitCode> {
    let mut config = load_config(repo).context("Failed to load pipeline configuration")?;
    if let Some(max) = max_parallel {
        config.defaults.max_parallel = max;
    }
    if let Ok(cmd) = std::env::var(AGENT_CMD_ENV)
        && !cmd.trim().is_empty()
    {
        config.defaults.agent_cmd = cmd;
    }

    let report = validate_config(repo, &config, false, mode).await;
    if !report.valid {
        eprintln!("{}", style("Refusing to start with an invalid pipeline").red().bold());
        print_report(&report);
        return Ok(ExitCode::from(EXIT_INVALID));
    }
    for warning in &report.warnings {
        tracing::warn!("{}", warning);
    }

    let worktrees: Arc<dyn WorktreeIsolation> = match mode {
        Mode::Normal => Arc::new(GitWorktreeManager::new(config.defaults.max_parallel)),
        Mode::Simulated => Arc::new(TestWorktreeManager::new()),
    };
    let discovery = Discovery::new(CommandStageQuery::new(&config.defaults.discovery_cmd));
    let confirmation = config.defaults.confirmation;

    let orchestrator = Orchestrator::new(
        config,
        repo,
        mode,
        discovery,
        Arc::new(FrontmatterStageStore::new(repo)),
        worktrees,
    )?;

    let shutdown = orchestrator.shutdown_token();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!();
            eprintln!("{}", style("Shutting down...").yellow());
            signal_token.cancel();
        }
    });

    if confirmation == ConfirmationPolicy::Prompt {
        let responder = ConsoleResponder::new(orchestrator.approvals());
        tokio::spawn(responder.run(shutdown.child_token()));
    }

    println!(
        "{} {} ({})",
        style("stagehand").bold(),
        style("running").green(),
        if once { "single tick" } else { "continuous" }
    );

    let summary = orchestrator.run(once).await?;
    println!(
        "Stopped: {} session(s) terminated, {} worktree(s) released, {} lock(s) released",
        summary.sessions_terminated, summary.worktrees_released, summary.locks_released
    );
    Ok(ExitCode::SUCCESS)
}
