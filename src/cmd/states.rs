//! Compiled pipeline listing: `stagehand states`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use stagehand::pipeline::{Automation, PipelineStateMachine};

use super::load_config;

pub fn cmd_states(repo: &Path) -> Result<()> {
    let config = load_config(repo)?;
    let machine = PipelineStateMachine::from_config(&config).context("Failed to compile pipeline")?;

    println!();
    println!("{}", style("Pipeline").bold());
    println!("Entry phase: {}", style(&machine.entry_state().name).cyan());
    println!();

    for state in machine.states() {
        let automation = match &state.automation {
            Automation::Skill(name) => format!("skill {}", name),
            Automation::Resolver(name) => format!("resolver {}", name),
        };
        println!(
            "  {} {}",
            style(&state.name).bold(),
            style(format!("[status: {}]", state.status)).dim()
        );
        println!("      {}", automation);
        println!("      -> {}", state.transitions_to.join(", "));
    }
    println!();
    Ok(())
}
