//! Pipeline validation command: `stagehand validate`.

use anyhow::Result;
use console::style;
use std::path::Path;
use std::process::ExitCode;

use stagehand::code_host::create_code_host;
use stagehand::config::{Mode, PipelineConfig};
use stagehand::resolvers::{ResolverContext, ResolverRegistry};
use stagehand::skills::SkillsLoader;
use stagehand::validation::{PipelineValidator, ValidationReport};

use super::{EXIT_INVALID, load_config};

pub async fn cmd_validate(repo: &Path, dry_run: bool, json: bool, mode: Mode) -> Result<ExitCode> {
    let config = match load_config(repo) {
        Ok(config) => config,
        Err(e) => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({ "valid": false, "config_error": e.to_string() })
                );
            } else {
                eprintln!("{} {}", style("Invalid configuration:").red().bold(), e);
            }
            return Ok(ExitCode::from(EXIT_INVALID));
        }
    };

    let report = validate_config(repo, &config, dry_run, mode).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(if report.valid {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_INVALID)
    })
}

/// Run all four layers with the built-in resolvers and the repo's skills.
pub async fn validate_config(
    repo: &Path,
    config: &PipelineConfig,
    dry_run: bool,
    mode: Mode,
) -> ValidationReport {
    let registry = ResolverRegistry::with_builtins();
    let skills = SkillsLoader::for_repo(repo, &config.defaults.skills_dir);
    let context = ResolverContext::from_process_env(create_code_host(config.defaults.code_host, mode));

    PipelineValidator::new(&registry)
        .with_skill_reader(&skills)
        .with_context(context)
        .with_timeouts(
            config.defaults.resolver_timeout(),
            config.defaults.skill_read_timeout(),
        )
        .validate(config, dry_run)
        .await
}

pub fn print_report(report: &ValidationReport) {
    for issue in &report.errors {
        println!("  {} {}", style("error").red().bold(), issue);
    }
    for issue in &report.warnings {
        println!("  {} {}", style("warning").yellow(), issue);
    }

    println!();
    if report.valid {
        println!(
            "{} ({} warning{})",
            style("Pipeline is valid").green().bold(),
            report.warnings.len(),
            if report.warnings.len() == 1 { "" } else { "s" }
        );
    } else {
        println!(
            "{} ({} error{}, {} warning{})",
            style("Pipeline is invalid").red().bold(),
            report.errors.len(),
            if report.errors.len() == 1 { "" } else { "s" },
            report.warnings.len(),
            if report.warnings.len() == 1 { "" } else { "s" }
        );
    }
}
