//! Compiled, lookup-oriented view of a pipeline configuration.

use std::collections::HashMap;

use crate::config::PipelineConfig;
use crate::errors::ConfigError;

use super::PipelineState;

/// Name- and status-indexed lookup tables over a pipeline's states.
///
/// Built once per run from a validated [`PipelineConfig`]. Lookups never fail
/// for missing keys; they return `None`.
#[derive(Debug, Clone)]
pub struct PipelineStateMachine {
    states: Vec<PipelineState>,
    by_name: HashMap<String, usize>,
    by_status: HashMap<String, usize>,
    entry: usize,
}

impl PipelineStateMachine {
    /// Build both lookup tables in one pass.
    ///
    /// Fails only when the declared entry phase names no state.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, ConfigError> {
        let states = config.phases.clone();
        let mut by_name = HashMap::with_capacity(states.len());
        let mut by_status = HashMap::with_capacity(states.len());

        for (i, state) in states.iter().enumerate() {
            by_name.insert(state.name.clone(), i);
            by_status.insert(state.status.clone(), i);
        }

        let entry = *by_name
            .get(&config.entry_phase)
            .ok_or_else(|| ConfigError::UnknownEntryPhase(config.entry_phase.clone()))?;

        Ok(Self {
            states,
            by_name,
            by_status,
            entry,
        })
    }

    pub fn entry_state(&self) -> &PipelineState {
        &self.states[self.entry]
    }

    pub fn state_by_name(&self, name: &str) -> Option<&PipelineState> {
        self.by_name.get(name).map(|&i| &self.states[i])
    }

    pub fn state_by_status(&self, status: &str) -> Option<&PipelineState> {
        self.by_status.get(status).map(|&i| &self.states[i])
    }

    /// All states, in declaration order.
    pub fn states(&self) -> &[PipelineState] {
        &self.states
    }

    /// States advanced by an interactive skill session.
    pub fn skill_states(&self) -> impl Iterator<Item = &PipelineState> {
        self.states.iter().filter(|s| s.automation.is_skill())
    }

    /// States advanced by a resolver function.
    pub fn resolver_states(&self) -> impl Iterator<Item = &PipelineState> {
        self.states.iter().filter(|s| s.automation.is_resolver())
    }
}
