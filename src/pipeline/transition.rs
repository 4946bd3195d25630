//! Validation and resolution of single state transitions.
//!
//! Transitions are authored by state name but persisted by status. Callers hand
//! in the stage's current *status* and the requested target *name*; on success
//! they get back the *status* string to persist.

use thiserror::Error;

use super::{COMPLETE_STATUS, DONE_TARGET, PipelineStateMachine};

/// Why a transition was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Source status '{0}' not found in pipeline")]
    SourceNotFound(String),

    #[error("'{to}' is not a valid transition from '{from}' (valid targets: {})", .valid_targets.join(", "))]
    NotAllowed {
        from: String,
        to: String,
        valid_targets: Vec<String>,
    },

    #[error("Transition target '{0}' not found in pipeline")]
    TargetNotFound(String),
}

/// Checks requested transitions against a compiled pipeline.
#[derive(Debug, Clone, Copy)]
pub struct TransitionValidator<'a> {
    machine: &'a PipelineStateMachine,
}

impl<'a> TransitionValidator<'a> {
    pub fn new(machine: &'a PipelineStateMachine) -> Self {
        Self { machine }
    }

    /// Validate moving a stage currently at `from_status` to the state named `to_name`.
    ///
    /// Valid iff `to_name` appears verbatim in the source state's
    /// `transitions_to` and, unless it is the Done sentinel, names a state.
    pub fn validate(&self, from_status: &str, to_name: &str) -> Result<(), TransitionError> {
        let source = self
            .machine
            .state_by_status(from_status)
            .ok_or_else(|| TransitionError::SourceNotFound(from_status.to_string()))?;

        if !source.declares_transition(to_name) {
            return Err(TransitionError::NotAllowed {
                from: source.name.clone(),
                to: to_name.to_string(),
                valid_targets: source.transitions_to.clone(),
            });
        }

        if to_name != DONE_TARGET && self.machine.state_by_name(to_name).is_none() {
            return Err(TransitionError::TargetNotFound(to_name.to_string()));
        }

        Ok(())
    }

    /// Status string to persist for a valid transition, or `None` when invalid.
    pub fn resolve_transition_target(&self, from_status: &str, to_name: &str) -> Option<String> {
        self.validate(from_status, to_name).ok()?;
        if to_name == DONE_TARGET {
            return Some(COMPLETE_STATUS.to_string());
        }
        self.machine
            .state_by_name(to_name)
            .map(|state| state.status.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::pipeline::{Automation, PipelineState};

    fn machine() -> PipelineStateMachine {
        let mut config = PipelineConfig::builtin();
        config.entry_phase = "A".into();
        config.phases = vec![
            PipelineState::new("A", "Doing A", Automation::Skill("a".into()), &["B", "Done"]),
            PipelineState::new("B", "Doing B", Automation::Skill("b".into()), &["A", "Ghost"]),
            PipelineState::new("C", "Doing C", Automation::Skill("c".into()), &["C", "Done"]),
        ];
        PipelineStateMachine::from_config(&config).unwrap()
    }

    #[test]
    fn test_validate_declared_transition() {
        let machine = machine();
        let validator = TransitionValidator::new(&machine);
        assert_eq!(validator.validate("Doing A", "B"), Ok(()));
        assert_eq!(validator.validate("Doing A", "Done"), Ok(()));
    }

    #[test]
    fn test_validate_unknown_source_status() {
        let machine = machine();
        let validator = TransitionValidator::new(&machine);
        // a state *name* is not a status
        assert_eq!(
            validator.validate("A", "B"),
            Err(TransitionError::SourceNotFound("A".into()))
        );
    }

    #[test]
    fn test_validate_undeclared_transition_lists_targets() {
        let machine = machine();
        let validator = TransitionValidator::new(&machine);
        let err = validator.validate("Doing B", "Done").unwrap_err();
        match &err {
            TransitionError::NotAllowed { valid_targets, .. } => {
                assert_eq!(valid_targets, &vec!["A".to_string(), "Ghost".to_string()]);
            }
            other => panic!("Expected NotAllowed, got {:?}", other),
        }
        assert!(err.to_string().contains("A, Ghost"));
    }

    #[test]
    fn test_self_transition_requires_declaration() {
        let machine = machine();
        let validator = TransitionValidator::new(&machine);
        assert!(matches!(
            validator.validate("Doing A", "A"),
            Err(TransitionError::NotAllowed { .. })
        ));
        assert_eq!(validator.validate("Doing C", "C"), Ok(()));
    }

    #[test]
    fn test_validate_missing_target_state() {
        let machine = machine();
        let validator = TransitionValidator::new(&machine);
        assert_eq!(
            validator.validate("Doing B", "Ghost"),
            Err(TransitionError::TargetNotFound("Ghost".into()))
        );
    }

    #[test]
    fn test_resolve_returns_target_status() {
        let machine = machine();
        let validator = TransitionValidator::new(&machine);
        assert_eq!(
            validator.resolve_transition_target("Doing A", "B"),
            Some("Doing B".to_string())
        );
        assert_eq!(validator.resolve_transition_target("Doing B", "Ghost"), None);
        assert_eq!(validator.resolve_transition_target("Doing A", "C"), None);
    }

    #[test]
    fn test_resolve_done_is_always_complete_status() {
        let machine = machine();
        let validator = TransitionValidator::new(&machine);
        for from in ["Doing A", "Doing C"] {
            assert_eq!(
                validator.resolve_transition_target(from, DONE_TARGET),
                Some(COMPLETE_STATUS.to_string())
            );
        }
    }
}
