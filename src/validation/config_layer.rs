//! Layer 1: static structure of the configuration.

use std::collections::{HashMap, HashSet};

use crate::config::PipelineConfig;
use crate::pipeline::{DONE_TARGET, is_reserved_status};

use super::{Layer, LayerFindings};

pub fn check(config: &PipelineConfig) -> LayerFindings {
    let mut findings = LayerFindings::new(Layer::Config);

    let mut name_counts: HashMap<&str, usize> = HashMap::new();
    let mut status_counts: HashMap<&str, usize> = HashMap::new();
    for state in &config.phases {
        *name_counts.entry(state.name.as_str()).or_default() += 1;
        *status_counts.entry(state.status.as_str()).or_default() += 1;
    }

    let mut reported = HashSet::new();
    for state in &config.phases {
        let name = state.name.as_str();
        if name_counts[name] > 1 && reported.insert(("name", name)) {
            findings.error(Some(name), format!("Duplicate phase name '{}'", name));
        }
        let status = state.status.as_str();
        if status_counts[status] > 1 && reported.insert(("status", status)) {
            findings.error(
                Some(name),
                format!("Duplicate status '{}' (used by {} phases)", status, status_counts[status]),
            );
        }
        if is_reserved_status(status) {
            findings.error(
                Some(name),
                format!("Phase '{}' uses reserved status '{}'", name, status),
            );
        }
    }

    if !name_counts.contains_key(config.entry_phase.as_str()) {
        findings.error(
            None,
            format!(
                "Entry phase '{}' does not name a declared phase",
                config.entry_phase
            ),
        );
    }

    for state in &config.phases {
        for target in &state.transitions_to {
            if target != DONE_TARGET && !name_counts.contains_key(target.as_str()) {
                findings.error(
                    Some(&state.name),
                    format!(
                        "Phase '{}' transitions to unknown target '{}'",
                        state.name, target
                    ),
                );
            }
        }
    }

    let targeted: HashSet<&str> = config
        .phases
        .iter()
        .flat_map(|s| s.state_targets().filter(move |t| *t != s.name))
        .collect();
    for state in &config.phases {
        if state.name != config.entry_phase && !targeted.contains(state.name.as_str()) {
            findings.warning(
                Some(&state.name),
                format!(
                    "Phase '{}' is never a transition target and is not the entry phase",
                    state.name
                ),
            );
        }
    }

    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkflowDefaults;
    use crate::pipeline::{Automation, PipelineState};
    use crate::validation::Severity;

    fn config(entry: &str, phases: Vec<PipelineState>) -> PipelineConfig {
        PipelineConfig {
            entry_phase: entry.to_string(),
            phases,
            defaults: WorkflowDefaults::default(),
            jira: None,
            cron: None,
        }
    }

    fn state(name: &str, status: &str, targets: &[&str]) -> PipelineState {
        PipelineState::new(name, status, Automation::Skill("s".into()), targets)
    }

    fn messages(findings: &LayerFindings, severity: Severity) -> Vec<String> {
        findings
            .issues()
            .iter()
            .filter(|i| i.severity == severity)
            .map(|i| i.message.clone())
            .collect()
    }

    #[test]
    fn test_builtin_pipeline_is_clean() {
        let findings = check(&PipelineConfig::builtin());
        assert!(findings.issues().is_empty(), "{:?}", findings.issues());
    }

    #[test]
    fn test_duplicate_names_and_statuses() {
        let cfg = config(
            "A",
            vec![
                state("A", "Shared", &["Done"]),
                state("A", "Other", &["Done"]),
                state("B", "Shared", &["Done"]),
            ],
        );
        let errors = messages(&check(&cfg), Severity::Error);
        assert!(errors.iter().any(|e| e.contains("Duplicate phase name 'A'")));
        assert!(errors.iter().any(|e| e.contains("Duplicate status 'Shared'")));
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_reserved_status_rejected() {
        let cfg = config("A", vec![state("A", "Complete", &["Done"])]);
        let errors = messages(&check(&cfg), Severity::Error);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("reserved status 'Complete'"));
    }

    #[test]
    fn test_missing_entry_and_unknown_target() {
        let cfg = config("Nope", vec![state("A", "A", &["Ghost", "Done"])]);
        let errors = messages(&check(&cfg), Severity::Error);
        assert!(errors.iter().any(|e| e.contains("Entry phase 'Nope'")));
        assert!(errors.iter().any(|e| e.contains("unknown target 'Ghost'")));
    }

    #[test]
    fn test_untargeted_phase_is_warning_only() {
        let cfg = config(
            "A",
            vec![state("A", "A", &["Done"]), state("Orphan", "Orphan", &["Orphan", "Done"])],
        );
        let findings = check(&cfg);
        assert!(!findings.has_errors());
        let warnings = messages(&findings, Severity::Warning);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("'Orphan'"));
    }
}
