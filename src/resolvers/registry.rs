use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::ResolverError;

use super::{
    FnResolver, PrStatusResolver, Resolver, ResolverContext, StageInput, TestingRouterResolver,
};

/// Name-keyed table of resolvers.
///
/// Names are bound at most once; a second registration under the same name is
/// an error rather than a silent overwrite.
#[derive(Default)]
pub struct ResolverRegistry {
    resolvers: HashMap<String, Arc<dyn Resolver>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with `pr-status` and `testing-router`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .resolvers
            .insert(PrStatusResolver::NAME.to_string(), Arc::new(PrStatusResolver));
        registry.resolvers.insert(
            TestingRouterResolver::NAME.to_string(),
            Arc::new(TestingRouterResolver::default()),
        );
        registry
    }

    pub fn register(
        &mut self,
        name: &str,
        resolver: impl Resolver + 'static,
    ) -> Result<(), ResolverError> {
        if self.resolvers.contains_key(name) {
            return Err(ResolverError::AlreadyRegistered(name.to_string()));
        }
        tracing::debug!(resolver = name, "Registered resolver");
        self.resolvers.insert(name.to_string(), Arc::new(resolver));
        Ok(())
    }

    /// Register a synchronous closure.
    pub fn register_fn<F>(&mut self, name: &str, f: F) -> Result<(), ResolverError>
    where
        F: Fn(&StageInput, &ResolverContext) -> anyhow::Result<Option<String>>
            + Send
            + Sync
            + 'static,
    {
        self.register(name, FnResolver::new(f))
    }

    pub fn has(&self, name: &str) -> bool {
        self.resolvers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.resolvers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run a resolver. An unregistered name yields `Ok(None)`; surfacing the
    /// missing binding is the validator's job.
    pub async fn execute(
        &self,
        name: &str,
        stage: &StageInput,
        context: &ResolverContext,
    ) -> anyhow::Result<Option<String>> {
        match self.resolvers.get(name) {
            Some(resolver) => resolver.resolve(stage, context).await,
            None => Ok(None),
        }
    }

    /// Run a resolver bounded by `timeout` and the context's cancellation token.
    pub async fn execute_bounded(
        &self,
        name: &str,
        stage: &StageInput,
        context: &ResolverContext,
        timeout: Duration,
    ) -> Result<Option<String>, ResolverError> {
        let Some(resolver) = self.resolvers.get(name) else {
            return Ok(None);
        };

        tokio::select! {
            _ = context.cancel.cancelled() => Err(ResolverError::Cancelled(name.to_string())),
            outcome = tokio::time::timeout(timeout, resolver.resolve(stage, context)) => match outcome {
                Err(_) => Err(ResolverError::TimedOut {
                    name: name.to_string(),
                    timeout,
                }),
                Ok(Ok(target)) => Ok(target),
                Ok(Err(source)) => Err(ResolverError::Failed {
                    name: name.to_string(),
                    source,
                }),
            },
        }
    }
}

impl std::fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverRegistry")
            .field("resolvers", &self.names())
            .finish()
    }
}
