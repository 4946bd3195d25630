use serde::{Deserialize, Serialize};

use super::DONE_TARGET;

/// How a state is advanced: by an interactive agent session running a skill,
/// or by a resolver function evaluated on each tick.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Automation {
    Skill(String),
    Resolver(String),
}

impl Automation {
    /// The skill or resolver name.
    pub fn name(&self) -> &str {
        match self {
            Automation::Skill(name) | Automation::Resolver(name) => name,
        }
    }

    pub fn is_skill(&self) -> bool {
        matches!(self, Automation::Skill(_))
    }

    pub fn is_resolver(&self) -> bool {
        matches!(self, Automation::Resolver(_))
    }
}

impl std::fmt::Display for Automation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Automation::Skill(name) => write!(f, "skill:{}", name),
            Automation::Resolver(name) => write!(f, "resolver:{}", name),
        }
    }
}

/// A single state of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineState {
    /// Unique name used when authoring transitions.
    pub name: String,
    /// Unique status value persisted on work items sitting in this state.
    pub status: String,
    pub automation: Automation,
    /// Ordered target names. May include [`DONE_TARGET`].
    pub transitions_to: Vec<String>,
}

impl PipelineState {
    pub fn new(name: &str, status: &str, automation: Automation, transitions_to: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            status: status.to_string(),
            automation,
            transitions_to: transitions_to.iter().map(|t| t.to_string()).collect(),
        }
    }

    /// True when `target` is declared verbatim in `transitions_to`.
    pub fn declares_transition(&self, target: &str) -> bool {
        self.transitions_to.iter().any(|t| t == target)
    }

    /// True when this state has a direct edge to the Done sentinel.
    pub fn transitions_to_done(&self) -> bool {
        self.declares_transition(DONE_TARGET)
    }

    /// Targets other than the Done sentinel.
    pub fn state_targets(&self) -> impl Iterator<Item = &str> {
        self.transitions_to
            .iter()
            .map(String::as_str)
            .filter(|t| *t != DONE_TARGET)
    }
}
