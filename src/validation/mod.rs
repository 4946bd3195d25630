//! Four-layer pipeline validation.
//!
//! | Layer | Module               | Checks                                              |
//! |-------|----------------------|-----------------------------------------------------|
//! | 1     | [`config_layer`]     | names, statuses, entry phase, declared targets      |
//! | 2     | [`graph`]            | every phase reaches Done and is reachable from entry |
//! | 3     | [`skill_content`]    | skill files exist (advisory)                        |
//! | 4     | [`resolver_binding`] | resolvers are registered; optional dry run          |
//!
//! Findings are data, not errors: [`PipelineValidator::validate`] always
//! returns a [`ValidationReport`]. Layer 2 is skipped, with a warning, when
//! layer 1 reported errors.

pub mod config_layer;
pub mod graph;
pub mod resolver_binding;
pub mod skill_content;

use serde::Serialize;
use std::time::Duration;

use crate::config::PipelineConfig;
use crate::resolvers::{ResolverContext, ResolverRegistry};
use crate::skills::SkillContentReader;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Config,
    Graph,
    SkillContent,
    ResolverBinding,
}

impl Layer {
    pub fn number(self) -> u8 {
        match self {
            Layer::Config => 1,
            Layer::Graph => 2,
            Layer::SkillContent => 3,
            Layer::ResolverBinding => 4,
        }
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Layer::Config => "config",
            Layer::Graph => "graph",
            Layer::SkillContent => "skill content",
            Layer::ResolverBinding => "resolver binding",
        };
        write!(f, "layer {} ({})", self.number(), label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// A single layer-attributed finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub layer: Layer,
    pub severity: Severity,
    /// Phase the finding is about, when it concerns one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.layer, self.message)
    }
}

/// Issues collected by one layer.
#[derive(Debug, Clone)]
pub struct LayerFindings {
    layer: Layer,
    issues: Vec<ValidationIssue>,
}

impl LayerFindings {
    pub fn new(layer: Layer) -> Self {
        Self {
            layer,
            issues: Vec::new(),
        }
    }

    pub fn error(&mut self, phase: Option<&str>, message: impl Into<String>) {
        self.push(Severity::Error, phase, message.into());
    }

    pub fn warning(&mut self, phase: Option<&str>, message: impl Into<String>) {
        self.push(Severity::Warning, phase, message.into());
    }

    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Error)
    }

    pub fn issues(&self) -> &[ValidationIssue] {
        &self.issues
    }

    fn push(&mut self, severity: Severity, phase: Option<&str>, message: String) {
        self.issues.push(ValidationIssue {
            layer: self.layer,
            severity,
            phase: phase.map(str::to_string),
            message,
        });
    }
}

/// Aggregate result of all four layers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    /// Concatenate layer findings; valid iff no layer reported an error.
    pub fn from_layers(layers: impl IntoIterator<Item = LayerFindings>) -> Self {
        let mut report = Self::default();
        for findings in layers {
            for issue in findings.issues {
                match issue.severity {
                    Severity::Error => report.errors.push(issue),
                    Severity::Warning => report.warnings.push(issue),
                }
            }
        }
        report.valid = report.errors.is_empty();
        report
    }

    pub fn errors_in(&self, layer: Layer) -> impl Iterator<Item = &ValidationIssue> {
        self.errors.iter().filter(move |i| i.layer == layer)
    }

    pub fn warnings_in(&self, layer: Layer) -> impl Iterator<Item = &ValidationIssue> {
        self.warnings.iter().filter(move |i| i.layer == layer)
    }
}

/// Runs the four layers against one configuration.
pub struct PipelineValidator<'a> {
    registry: &'a ResolverRegistry,
    skill_reader: Option<&'a dyn SkillContentReader>,
    context: ResolverContext,
    resolver_timeout: Duration,
    skill_read_timeout: Duration,
}

impl<'a> PipelineValidator<'a> {
    /// Validator with no skill reader and an empty resolver context.
    pub fn new(registry: &'a ResolverRegistry) -> Self {
        let defaults = crate::config::WorkflowDefaults::default();
        Self {
            registry,
            skill_reader: None,
            context: ResolverContext::new(Default::default(), None),
            resolver_timeout: defaults.resolver_timeout(),
            skill_read_timeout: defaults.skill_read_timeout(),
        }
    }

    pub fn with_skill_reader(mut self, reader: &'a dyn SkillContentReader) -> Self {
        self.skill_reader = Some(reader);
        self
    }

    /// Context handed to resolvers during a dry run.
    pub fn with_context(mut self, context: ResolverContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_timeouts(mut self, resolver: Duration, skill_read: Duration) -> Self {
        self.resolver_timeout = resolver;
        self.skill_read_timeout = skill_read;
        self
    }

    pub async fn validate(&self, config: &PipelineConfig, dry_run: bool) -> ValidationReport {
        let layer1 = config_layer::check(config);

        let layer2 = if layer1.has_errors() {
            let mut skipped = LayerFindings::new(Layer::Graph);
            skipped.warning(None, "Skipped graph analysis because layer 1 reported errors");
            skipped
        } else {
            graph::check(config)
        };

        let layer3 = skill_content::check(config, self.skill_reader, self.skill_read_timeout).await;

        let layer4 = resolver_binding::check(
            config,
            self.registry,
            &self.context,
            dry_run,
            self.resolver_timeout,
        )
        .await;

        let report = ValidationReport::from_layers([layer1, layer2, layer3, layer4]);
        tracing::debug!(
            valid = report.valid,
            errors = report.errors.len(),
            warnings = report.warnings.len(),
            dry_run,
            "Pipeline validated"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_host::{PrStatus, SimulatedCodeHost};
    use crate::config::WorkflowDefaults;
    use crate::pipeline::{Automation, PipelineState};
    use crate::resolvers::PrStatusResolver;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct KnownSkills(Vec<&'static str>);

    #[async_trait]
    impl SkillContentReader for KnownSkills {
        async fn read_skill(&self, name: &str) -> anyhow::Result<Option<String>> {
            Ok(self.0.contains(&name).then(|| format!("# {}", name)))
        }
    }

    fn config(entry: &str, phases: Vec<PipelineState>) -> PipelineConfig {
        PipelineConfig {
            entry_phase: entry.to_string(),
            phases,
            defaults: WorkflowDefaults::default(),
            jira: None,
            cron: None,
        }
    }

    fn skill(name: &str, targets: &[&str]) -> PipelineState {
        PipelineState::new(name, name, Automation::Skill(name.to_lowercase()), targets)
    }

    fn resolver(name: &str, resolver: &str, targets: &[&str]) -> PipelineState {
        PipelineState::new(name, name, Automation::Resolver(resolver.to_string()), targets)
    }

    #[test]
    fn test_report_valid_iff_no_errors() {
        let mut layer = LayerFindings::new(Layer::SkillContent);
        layer.warning(Some("A"), "advisory");
        let report = ValidationReport::from_layers([layer]);
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 1);

        let mut layer = LayerFindings::new(Layer::Config);
        layer.error(None, "broken");
        let report = ValidationReport::from_layers([layer]);
        assert!(!report.valid);
        assert_eq!(report.errors_in(Layer::Config).count(), 1);
    }

    #[test]
    fn test_layer_display_and_serialization() {
        assert_eq!(Layer::ResolverBinding.to_string(), "layer 4 (resolver binding)");
        let json = serde_json::to_string(&Layer::SkillContent).unwrap();
        assert_eq!(json, "\"skill_content\"");
    }

    #[tokio::test]
    async fn test_clean_pipeline_dry_run_has_no_findings() {
        let mut registry = ResolverRegistry::new();
        registry.register("pr-status", PrStatusResolver).unwrap();
        let host = SimulatedCodeHost::new(PrStatus {
            merged: false,
            has_unresolved_comments: false,
            state: "open".into(),
        });
        let context = ResolverContext::new(HashMap::new(), Some(Arc::new(host)));
        let reader = KnownSkills(vec!["a"]);

        let cfg = config(
            "A",
            vec![skill("A", &["B"]), resolver("B", "pr-status", &["Done"])],
        );
        let report = PipelineValidator::new(&registry)
            .with_skill_reader(&reader)
            .with_context(context)
            .validate(&cfg, true)
            .await;

        assert!(report.valid, "{:?}", report.errors);
        assert!(report.errors.is_empty());
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    }

    #[tokio::test]
    async fn test_bad_entry_and_unregistered_resolver_aggregate() {
        let registry = ResolverRegistry::new();
        let cfg = config(
            "NonExistent",
            vec![skill("A", &["B"]), resolver("B", "no-such-resolver", &["Done"])],
        );
        let report = PipelineValidator::new(&registry).validate(&cfg, false).await;

        assert!(!report.valid);
        assert!(report.errors_in(Layer::Config).count() >= 1);
        assert!(report.errors_in(Layer::ResolverBinding).count() >= 1);
        assert!(
            report
                .warnings_in(Layer::Graph)
                .any(|w| w.message.contains("Skipped"))
        );
    }

    #[tokio::test]
    async fn test_mutual_cycle_cannot_reach_done() {
        let registry = ResolverRegistry::new();
        let cfg = config("A", vec![skill("A", &["B"]), skill("B", &["A"])]);
        let report = PipelineValidator::new(&registry).validate(&cfg, false).await;

        assert!(!report.valid);
        let stuck: Vec<_> = report
            .errors_in(Layer::Graph)
            .filter(|e| e.message.contains("cannot reach Done"))
            .filter_map(|e| e.phase.as_deref())
            .collect();
        assert_eq!(stuck, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_missing_reader_is_a_skip_warning_only() {
        let registry = ResolverRegistry::new();
        let cfg = config("A", vec![skill("A", &["Done"])]);
        let report = PipelineValidator::new(&registry).validate(&cfg, false).await;
        assert!(report.valid);
        assert_eq!(report.warnings_in(Layer::SkillContent).count(), 1);
    }

    #[tokio::test]
    async fn test_report_serializes_with_layer_attribution() {
        let registry = ResolverRegistry::new();
        let cfg = config("A", vec![resolver("A", "ghost", &["Done"])]);
        let report = PipelineValidator::new(&registry).validate(&cfg, false).await;
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["valid"], false);
        assert_eq!(json["errors"][0]["layer"], "resolver_binding");
        assert_eq!(json["errors"][0]["phase"], "A");
    }
}
