//! Resolver plugins for automation-backed pipeline states.
//!
//! A resolver is a pure decision point: given a minimal projection of a stage
//! and a [`ResolverContext`], it returns the name of the transition target to
//! take, or `None` for "not yet". Resolvers perform no side effects; the
//! orchestrator applies the returned target through the transition validator.
//!
//! Built-ins:
//! - `pr-status` ([`PrStatusResolver`]): merged goes to `Done`, unresolved
//!   comments go to `Addressing Comments`, otherwise no transition
//! - `testing-router` ([`TestingRouterResolver`]): routes on refinement tags
//!   and always returns a target

mod pr_status;
mod registry;
mod testing_router;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::code_host::CodeHost;

pub use pr_status::PrStatusResolver;
pub use registry::ResolverRegistry;
pub use testing_router::TestingRouterResolver;

/// Minimal stage projection handed to resolvers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageInput {
    pub id: String,
    #[serde(default)]
    pub ticket: Option<String>,
    #[serde(default)]
    pub epic: Option<String>,
    #[serde(default)]
    pub title: String,
    /// Current persisted status.
    pub status: String,
    #[serde(default)]
    pub worktree_branch: Option<String>,
    #[serde(default)]
    pub refinement_type: Vec<String>,
    #[serde(default)]
    pub pr_url: Option<String>,
}

/// Ambient inputs available to a resolver invocation.
#[derive(Clone)]
pub struct ResolverContext {
    /// Environment values visible to resolvers.
    pub env: HashMap<String, String>,
    /// Code-host accessor; `None` means "no information available".
    pub code_host: Option<Arc<dyn CodeHost>>,
    /// Cancelled when the caller gives up on the invocation.
    pub cancel: CancellationToken,
}

impl ResolverContext {
    pub fn new(env: HashMap<String, String>, code_host: Option<Arc<dyn CodeHost>>) -> Self {
        Self {
            env,
            code_host,
            cancel: CancellationToken::new(),
        }
    }

    /// Snapshot the current process environment.
    pub fn from_process_env(code_host: Option<Arc<dyn CodeHost>>) -> Self {
        Self::new(std::env::vars().collect(), code_host)
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl std::fmt::Debug for ResolverContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverContext")
            .field("env_keys", &self.env.len())
            .field("code_host", &self.code_host.as_ref().map(|h| h.platform()))
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// A transition decision function.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Return the target state name to move to, or `None` to stay put.
    async fn resolve(
        &self,
        stage: &StageInput,
        context: &ResolverContext,
    ) -> anyhow::Result<Option<String>>;
}

/// Adapter turning a synchronous closure into a [`Resolver`].
pub struct FnResolver<F>(F);

impl<F> FnResolver<F>
where
    F: Fn(&StageInput, &ResolverContext) -> anyhow::Result<Option<String>> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> Resolver for FnResolver<F>
where
    F: Fn(&StageInput, &ResolverContext) -> anyhow::Result<Option<String>> + Send + Sync,
{
    async fn resolve(
        &self,
        stage: &StageInput,
        context: &ResolverContext,
    ) -> anyhow::Result<Option<String>> {
        (self.0)(stage, context)
    }
}
