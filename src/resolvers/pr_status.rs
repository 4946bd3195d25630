use async_trait::async_trait;

use crate::pipeline::DONE_TARGET;

use super::{Resolver, ResolverContext, StageInput};

/// Target taken when the PR has unresolved review comments.
pub const ADDRESSING_COMMENTS_TARGET: &str = "Addressing Comments";

/// Maps pull/merge request state to a transition.
///
/// | PR state                 | Target                |
/// |--------------------------|-----------------------|
/// | merged                   | `Done`                |
/// | unresolved comments      | `Addressing Comments` |
/// | anything else / no info  | no transition         |
#[derive(Debug, Clone, Copy, Default)]
pub struct PrStatusResolver;

impl PrStatusResolver {
    pub const NAME: &'static str = "pr-status";
}

#[async_trait]
impl Resolver for PrStatusResolver {
    async fn resolve(
        &self,
        stage: &StageInput,
        context: &ResolverContext,
    ) -> anyhow::Result<Option<String>> {
        let (Some(url), Some(host)) = (stage.pr_url.as_deref(), context.code_host.as_ref()) else {
            return Ok(None);
        };

        let status = host.get_pr_status(url).await;
        if status.merged {
            Ok(Some(DONE_TARGET.to_string()))
        } else if status.has_unresolved_comments {
            Ok(Some(ADDRESSING_COMMENTS_TARGET.to_string()))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_host::{PrStatus, SimulatedCodeHost};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn stage_with_pr() -> StageInput {
        StageInput {
            id: "STAGE-001-002-001".into(),
            status: "PR Created".into(),
            pr_url: Some("https://github.com/o/r/pull/7".into()),
            ..Default::default()
        }
    }

    fn context(merged: bool, comments: bool, state: &str) -> ResolverContext {
        let host = SimulatedCodeHost::new(PrStatus {
            merged,
            has_unresolved_comments: comments,
            state: state.into(),
        });
        ResolverContext::new(HashMap::new(), Some(Arc::new(host)))
    }

    #[tokio::test]
    async fn test_merged_pr_goes_done() {
        let target = PrStatusResolver
            .resolve(&stage_with_pr(), &context(true, true, "merged"))
            .await
            .unwrap();
        assert_eq!(target.as_deref(), Some("Done"));
    }

    #[tokio::test]
    async fn test_unresolved_comments_go_to_addressing() {
        let target = PrStatusResolver
            .resolve(&stage_with_pr(), &context(false, true, "open"))
            .await
            .unwrap();
        assert_eq!(target.as_deref(), Some("Addressing Comments"));
    }

    #[tokio::test]
    async fn test_open_pr_is_noop() {
        let target = PrStatusResolver
            .resolve(&stage_with_pr(), &context(false, false, "open"))
            .await
            .unwrap();
        assert_eq!(target, None);
    }

    #[tokio::test]
    async fn test_error_status_is_noop() {
        let host = SimulatedCodeHost::new(PrStatus::error());
        let ctx = ResolverContext::new(HashMap::new(), Some(Arc::new(host)));
        let target = PrStatusResolver.resolve(&stage_with_pr(), &ctx).await.unwrap();
        assert_eq!(target, None);
    }

    #[tokio::test]
    async fn test_missing_host_or_url_is_noop() {
        let no_host = ResolverContext::new(HashMap::new(), None);
        assert_eq!(
            PrStatusResolver.resolve(&stage_with_pr(), &no_host).await.unwrap(),
            None
        );
        let no_url = StageInput {
            pr_url: None,
            ..stage_with_pr()
        };
        assert_eq!(
            PrStatusResolver
                .resolve(&no_url, &context(true, false, "merged"))
                .await
                .unwrap(),
            None
        );
    }
}
