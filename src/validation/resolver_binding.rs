//! Layer 4: resolver names are bound, and optionally behave under a dry run.
//!
//! A dry-run target outside the phase's own `transitions_to` is a warning, not
//! an error: the resolver may know of targets the validator cannot see.

use std::time::Duration;

use crate::config::PipelineConfig;
use crate::pipeline::{Automation, PipelineState};
use crate::resolvers::{ResolverContext, ResolverRegistry, StageInput};

use super::{Layer, LayerFindings};

pub async fn check(
    config: &PipelineConfig,
    registry: &ResolverRegistry,
    context: &ResolverContext,
    dry_run: bool,
    timeout: Duration,
) -> LayerFindings {
    let mut findings = LayerFindings::new(Layer::ResolverBinding);

    for state in &config.phases {
        let Automation::Resolver(resolver) = &state.automation else {
            continue;
        };

        if !registry.has(resolver) {
            findings.error(
                Some(&state.name),
                format!(
                    "Phase '{}' references unregistered resolver '{}'",
                    state.name, resolver
                ),
            );
            continue;
        }

        if !dry_run {
            continue;
        }

        let input = synthetic_stage(state);
        match registry
            .execute_bounded(resolver, &input, context, timeout)
            .await
        {
            Ok(None) => {}
            Ok(Some(target)) if state.declares_transition(&target) => {}
            Ok(Some(target)) => findings.warning(
                Some(&state.name),
                format!(
                    "Resolver '{}' returned '{}', which is not a declared transition of phase '{}' (expected one of: {})",
                    resolver,
                    target,
                    state.name,
                    state.transitions_to.join(", ")
                ),
            ),
            Err(e) => findings.error(
                Some(&state.name),
                format!("Dry run of phase '{}' failed: {}", state.name, e),
            ),
        }
    }

    findings
}

/// Stage projection used for dry runs of resolvers bound to `state`.
pub fn synthetic_stage(state: &PipelineState) -> StageInput {
    StageInput {
        id: "STAGE-000-000-000".to_string(),
        ticket: Some("TICKET-000-000".to_string()),
        epic: Some("EPIC-000".to_string()),
        title: format!("Dry run for {}", state.name),
        status: state.status.clone(),
        worktree_branch: Some("dry-run".to_string()),
        refinement_type: Vec::new(),
        pr_url: Some("https://example.invalid/pull/0".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkflowDefaults;
    use crate::validation::Severity;
    use std::collections::HashMap;

    fn config(phases: Vec<PipelineState>) -> PipelineConfig {
        PipelineConfig {
            entry_phase: phases[0].name.clone(),
            phases,
            defaults: WorkflowDefaults::default(),
            jira: None,
            cron: None,
        }
    }

    fn resolver_state(resolver: &str, targets: &[&str]) -> PipelineState {
        PipelineState::new(
            "Check",
            "Checking",
            Automation::Resolver(resolver.to_string()),
            targets,
        )
    }

    async fn run(registry: &ResolverRegistry, state: PipelineState, dry_run: bool) -> LayerFindings {
        let ctx = ResolverContext::new(HashMap::new(), None);
        check(&config(vec![state]), registry, &ctx, dry_run, Duration::from_secs(1)).await
    }

    #[tokio::test]
    async fn test_unregistered_resolver_is_error() {
        let registry = ResolverRegistry::new();
        let findings = run(&registry, resolver_state("ghost", &["Done"]), false).await;
        assert!(findings.has_errors());
        assert!(findings.issues()[0].message.contains("unregistered resolver 'ghost'"));
    }

    #[tokio::test]
    async fn test_dry_run_failure_is_error_with_message() {
        let mut registry = ResolverRegistry::new();
        registry
            .register_fn("flaky", |_, _| Err(anyhow::anyhow!("upstream unavailable")))
            .unwrap();
        let findings = run(&registry, resolver_state("flaky", &["Done"]), true).await;
        assert_eq!(findings.issues().len(), 1);
        assert_eq!(findings.issues()[0].severity, Severity::Error);
        assert!(findings.issues()[0].message.contains("upstream unavailable"));
    }

    #[tokio::test]
    async fn test_undeclared_target_is_warning() {
        let mut registry = ResolverRegistry::new();
        registry
            .register_fn("wanderer", |_, _| Ok(Some("Elsewhere".into())))
            .unwrap();
        let findings = run(&registry, resolver_state("wanderer", &["Done"]), true).await;
        assert!(!findings.has_errors());
        assert_eq!(findings.issues().len(), 1);
        assert!(findings.issues()[0].message.contains("'Elsewhere'"));
    }

    #[tokio::test]
    async fn test_null_and_declared_targets_accepted() {
        let mut registry = ResolverRegistry::new();
        registry.register_fn("idle", |_, _| Ok(None)).unwrap();
        registry
            .register_fn("finisher", |_, _| Ok(Some("Done".into())))
            .unwrap();
        assert!(run(&registry, resolver_state("idle", &["Done"]), true).await.issues().is_empty());
        assert!(
            run(&registry, resolver_state("finisher", &["Done"]), true)
                .await
                .issues()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_without_dry_run_resolvers_are_not_invoked() {
        let mut registry = ResolverRegistry::new();
        registry
            .register_fn("explosive", |_, _| Err(anyhow::anyhow!("should not run")))
            .unwrap();
        assert!(run(&registry, resolver_state("explosive", &["Done"]), false).await.issues().is_empty());
    }

    #[test]
    fn test_synthetic_stage_carries_state_status() {
        let state = resolver_state("x", &["Done"]);
        let stage = synthetic_stage(&state);
        assert_eq!(stage.status, "Checking");
        assert!(stage.pr_url.is_some());
    }
}
