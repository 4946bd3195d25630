//! Pipeline configuration for stagehand.
//!
//! Configuration is YAML and layered from two optional files:
//! - global: `$XDG_CONFIG_HOME/stagehand/config.yaml`
//! - repo: `<repo>/.stagehand.yaml`
//!
//! The repo file replaces `entry_phase` and the whole `phases` list when it
//! declares them; `defaults` merge key-by-key with repo values winning. When
//! neither file declares phases the built-in pipeline is used.
//!
//! # Configuration File Format
//!
//! ```yaml
//! workflow:
//!   entry_phase: Design
//!   phases:
//!     - name: Design
//!       status: Design
//!       skill: phase-design
//!       transitions_to: [Build]
//!     - name: PR Created
//!       status: PR Created
//!       resolver: pr-status
//!       transitions_to: [Done, Addressing Comments]
//!   defaults:
//!     max_parallel: 2
//!     poll_interval_secs: 30
//!     confirmation: prompt
//! jira:
//!   project: ENG
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::code_host::CodeHostPlatform;
use crate::errors::ConfigError;
use crate::pipeline::{Automation, PipelineState};

/// Repo-level config file name, relative to the repository root.
pub const REPO_CONFIG_FILE: &str = ".stagehand.yaml";

/// Directory under the user config dir holding the global config.
pub const GLOBAL_CONFIG_DIR: &str = "stagehand";

/// Global config file name.
pub const GLOBAL_CONFIG_FILE: &str = "config.yaml";

/// Directory under the repository root for runtime state (locks, logs).
pub const STATE_DIR: &str = ".stagehand";

/// Whether external services are real or simulated.
///
/// Threaded through constructors explicitly; never read from the environment
/// inside core logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Normal,
    Simulated,
}

/// How blocking approval requests from sessions are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationPolicy {
    /// Ask a human.
    #[default]
    Prompt,
    /// Approve every request without asking.
    AutoApprove,
    /// Deny every request without asking.
    Deny,
}

impl std::fmt::Display for ConfirmationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfirmationPolicy::Prompt => write!(f, "prompt"),
            ConfirmationPolicy::AutoApprove => write!(f, "auto_approve"),
            ConfirmationPolicy::Deny => write!(f, "deny"),
        }
    }
}

/// Workflow-wide tunables, after layering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefaults {
    /// Worktree pool size and the cap on concurrently running sessions.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Idle wait between ticks.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub confirmation: ConfirmationPolicy,
    /// Agent CLI used for skill sessions.
    #[serde(default = "default_agent_cmd")]
    pub agent_cmd: String,
    /// External command answering "what is ready".
    #[serde(default = "default_discovery_cmd")]
    pub discovery_cmd: String,
    /// Skills directory, relative to the repository root.
    #[serde(default = "default_skills_dir")]
    pub skills_dir: String,
    #[serde(default = "default_resolver_timeout_secs")]
    pub resolver_timeout_secs: u64,
    #[serde(default = "default_skill_read_timeout_secs")]
    pub skill_read_timeout_secs: u64,
    #[serde(default)]
    pub code_host: CodeHostPlatform,
    /// Keys this crate does not interpret, kept for collaborators.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

fn default_max_parallel() -> usize {
    1
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_agent_cmd() -> String {
    "claude".to_string()
}

fn default_discovery_cmd() -> String {
    "kanban-cli".to_string()
}

fn default_skills_dir() -> String {
    "skills".to_string()
}

fn default_resolver_timeout_secs() -> u64 {
    30
}

fn default_skill_read_timeout_secs() -> u64 {
    5
}

impl Default for WorkflowDefaults {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            poll_interval_secs: default_poll_interval_secs(),
            confirmation: ConfirmationPolicy::default(),
            agent_cmd: default_agent_cmd(),
            discovery_cmd: default_discovery_cmd(),
            skills_dir: default_skills_dir(),
            resolver_timeout_secs: default_resolver_timeout_secs(),
            skill_read_timeout_secs: default_skill_read_timeout_secs(),
            code_host: CodeHostPlatform::default(),
            extra: BTreeMap::new(),
        }
    }
}

impl WorkflowDefaults {
    /// Build typed defaults from a merged YAML mapping.
    pub fn from_mapping(mapping: serde_yaml::Mapping) -> Result<Self, ConfigError> {
        let defaults: WorkflowDefaults = serde_yaml::from_value(serde_yaml::Value::Mapping(mapping))
            .map_err(|e| ConfigError::InvalidDefault {
                key: "workflow.defaults".to_string(),
                message: e.to_string(),
            })?;
        let positive = [
            ("max_parallel", defaults.max_parallel as u64),
            ("poll_interval_secs", defaults.poll_interval_secs),
            ("resolver_timeout_secs", defaults.resolver_timeout_secs),
            ("skill_read_timeout_secs", defaults.skill_read_timeout_secs),
        ];
        if let Some((key, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::InvalidDefault {
                key: key.to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(defaults)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn resolver_timeout(&self) -> Duration {
        Duration::from_secs(self.resolver_timeout_secs)
    }

    pub fn skill_read_timeout(&self) -> Duration {
        Duration::from_secs(self.skill_read_timeout_secs)
    }
}

/// A loaded, immutable pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub entry_phase: String,
    pub phases: Vec<PipelineState>,
    pub defaults: WorkflowDefaults,
    pub jira: Option<serde_yaml::Value>,
    pub cron: Option<serde_yaml::Value>,
}

impl PipelineConfig {
    /// Compile a (possibly layered) config file.
    pub fn from_file(file: ConfigFile) -> Result<Self, ConfigError> {
        let defaults = WorkflowDefaults::from_mapping(file.workflow.defaults)?;

        let (entry_phase, phases) = match file.workflow.phases {
            None => {
                let builtin = Self::builtin_phases();
                let entry = file
                    .workflow
                    .entry_phase
                    .unwrap_or_else(|| builtin[0].name.clone());
                (entry, builtin)
            }
            Some(entries) => {
                if entries.is_empty() {
                    return Err(ConfigError::NoPhases);
                }
                let entry = file
                    .workflow
                    .entry_phase
                    .ok_or(ConfigError::MissingEntryPhase)?;
                let phases = entries
                    .into_iter()
                    .map(PhaseEntry::into_state)
                    .collect::<Result<Vec<_>, _>>()?;
                (entry, phases)
            }
        };

        Ok(Self {
            entry_phase,
            phases,
            defaults,
            jira: file.jira,
            cron: file.cron,
        })
    }

    /// Parse a single YAML document.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile =
            serde_yaml::from_str(content).map_err(|source| ConfigError::ParseFailed {
                path: PathBuf::from("<inline>"),
                source,
            })?;
        Self::from_file(file)
    }

    /// Load the layered configuration for a repository, using the user's
    /// global config location.
    pub fn load(repo_path: &Path) -> Result<Self, ConfigError> {
        Self::load_layered(global_config_path().as_deref(), repo_path)
    }

    /// Load the layered configuration with an explicit global path.
    pub fn load_layered(global: Option<&Path>, repo_path: &Path) -> Result<Self, ConfigError> {
        let global_file = match global {
            Some(path) => ConfigFile::load_or_default(path)?,
            None => ConfigFile::default(),
        };
        let repo_file = ConfigFile::load_or_default(&repo_path.join(REPO_CONFIG_FILE))?;
        Self::from_file(global_file.merged_with(repo_file))
    }

    /// The pipeline used when no file declares phases.
    pub fn builtin() -> Self {
        let phases = Self::builtin_phases();
        Self {
            entry_phase: phases[0].name.clone(),
            phases,
            defaults: WorkflowDefaults::default(),
            jira: None,
            cron: None,
        }
    }

    fn builtin_phases() -> Vec<PipelineState> {
        let skill = |name: &str| Automation::Skill(name.to_string());
        let resolver = |name: &str| Automation::Resolver(name.to_string());
        vec![
            PipelineState::new("Design", "Design", skill("phase-design"), &["Build"]),
            PipelineState::new("Build", "Build", skill("phase-build"), &["Testing Router"]),
            PipelineState::new(
                "Testing Router",
                "Routing Tests",
                resolver("testing-router"),
                &["Manual Testing", "Finalize"],
            ),
            PipelineState::new(
                "Manual Testing",
                "Manual Testing",
                skill("manual-testing"),
                &["Finalize"],
            ),
            PipelineState::new(
                "Finalize",
                "Finalize",
                skill("phase-finalize"),
                &["PR Created", "Done"],
            ),
            PipelineState::new(
                "PR Created",
                "PR Created",
                resolver("pr-status"),
                &["Done", "Addressing Comments"],
            ),
            PipelineState::new(
                "Addressing Comments",
                "Addressing Comments",
                skill("review-cycle"),
                &["PR Created"],
            ),
        ]
    }
}

/// Location of the global config file, if the platform has a config dir.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(GLOBAL_CONFIG_DIR).join(GLOBAL_CONFIG_FILE))
}

/// Runtime state directory for a repository.
pub fn state_dir(repo_path: &Path) -> PathBuf {
    repo_path.join(STATE_DIR)
}
