use async_trait::async_trait;

use super::{Resolver, ResolverContext, StageInput};

/// Target for stages whose refinement tags need a human tester.
pub const MANUAL_TESTING_TARGET: &str = "Manual Testing";

/// Target for stages that can skip manual testing.
pub const FINALIZE_TARGET: &str = "Finalize";

/// Routes a stage to manual testing when any of its refinement tags is in the
/// manual-testing set, otherwise straight to finalization. Never returns `None`.
#[derive(Debug, Clone)]
pub struct TestingRouterResolver {
    manual_categories: Vec<String>,
}

impl TestingRouterResolver {
    pub const NAME: &'static str = "testing-router";

    pub fn new(manual_categories: &[&str]) -> Self {
        Self {
            manual_categories: manual_categories.iter().map(|c| c.to_lowercase()).collect(),
        }
    }

    fn requires_manual_testing(&self, stage: &StageInput) -> bool {
        stage
            .refinement_type
            .iter()
            .any(|tag| self.manual_categories.contains(&tag.to_lowercase()))
    }
}

impl Default for TestingRouterResolver {
    fn default() -> Self {
        Self::new(&["frontend", "ux", "accessibility", "manual-testing"])
    }
}

#[async_trait]
impl Resolver for TestingRouterResolver {
    async fn resolve(
        &self,
        stage: &StageInput,
        _context: &ResolverContext,
    ) -> anyhow::Result<Option<String>> {
        let target = if self.requires_manual_testing(stage) {
            MANUAL_TESTING_TARGET
        } else {
            FINALIZE_TARGET
        };
        Ok(Some(target.to_string()))
    }
}
