mod run;
mod states;
mod validate;

pub use run::cmd_run;
pub use states::cmd_states;
pub use validate::cmd_validate;

use std::path::Path;

use stagehand::config::PipelineConfig;
use stagehand::errors::ConfigError;

/// Exit code for an invalid pipeline or bad usage.
pub const EXIT_INVALID: u8 = 2;

/// Overrides `defaults.agent_cmd` for this invocation.
pub const AGENT_CMD_ENV: &str = "STAGEHAND_AGENT_CMD";

/// Layered config for `repo`. `STAGEHAND_CONFIG` replaces the global file.
fn load_config(repo: &Path) -> Result<PipelineConfig, ConfigError> {
    match std::env::var_os("STAGEHAND_CONFIG") {
        Some(global) => PipelineConfig::load_layered(Some(Path::new(&global)), repo),
        None => PipelineConfig::load(repo),
    }
}
