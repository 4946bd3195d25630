use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::code_host::create_code_host;
use crate::config::{Mode, PipelineConfig};
use crate::discovery::{Discovery, ReadyStage};
use crate::errors::{OrchestratorError, WorktreeError};
use crate::locker::Locker;
use crate::pipeline::{
    Automation, NOT_STARTED_STATUS, PipelineStateMachine, TransitionValidator,
};
use crate::resolvers::{ResolverContext, ResolverRegistry};
use crate::session::{
    ApprovalService, MessageQueue, SessionExecutor, SessionRegistry, SpawnRequest,
};
use crate::skills::SkillsLoader;
use crate::store::{StageRecord, StageStore};
use crate::worktree::{WorktreeInfo, WorktreeIsolation};

/// Counters for one scheduling pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Ready stages returned by discovery, after the needs-human filter.
    pub discovered: usize,
    pub spawned: usize,
    /// Resolver stages whose status was advanced.
    pub resolved: usize,
    /// Stages left alone this tick: contention, no transition yet, or nothing to do.
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum StageOutcome {
    Spawned,
    Resolved,
    Skipped,
    Failed,
}

/// A skill stage with a session running in this process.
#[derive(Debug, Clone)]
pub(super) struct ActiveStage {
    pub(super) worktree: WorktreeInfo,
    /// Status the stage had when its session was spawned.
    pub(super) status: String,
}

/// The scheduling loop and everything it composes.
pub struct Orchestrator {
    pub(super) repo_path: PathBuf,
    pub(super) mode: Mode,
    pub(super) config: PipelineConfig,
    pub(super) machine: PipelineStateMachine,
    pub(super) resolvers: ResolverRegistry,
    pub(super) resolver_context: ResolverContext,
    pub(super) discovery: Discovery,
    pub(super) locker: Locker,
    pub(super) worktrees: Arc<dyn WorktreeIsolation>,
    pub(super) store: Arc<dyn StageStore>,
    pub(super) skills: SkillsLoader,
    pub(super) executor: SessionExecutor,
    pub(super) approvals: Arc<ApprovalService>,
    pub(super) active: Mutex<HashMap<String, ActiveStage>>,
    pub(super) shutdown: CancellationToken,
}

impl Orchestrator {
    /// Compose an orchestrator for `repo_path` with the default locker,
    /// resolver registry, skills loader and session executor.
    pub fn new(
        config: PipelineConfig,
        repo_path: &Path,
        mode: Mode,
        discovery: Discovery,
        store: Arc<dyn StageStore>,
        worktrees: Arc<dyn WorktreeIsolation>,
    ) -> Result<Self, OrchestratorError> {
        let machine = PipelineStateMachine::from_config(&config)?;
        let shutdown = CancellationToken::new();

        let code_host = create_code_host(config.defaults.code_host, mode);
        let resolver_context =
            ResolverContext::from_process_env(code_host).with_cancel(shutdown.child_token());

        let approvals = Arc::new(ApprovalService::new());
        let executor = SessionExecutor::new(
            mode,
            &config.defaults.agent_cmd,
            config.defaults.confirmation,
            Arc::new(SessionRegistry::new()),
            Arc::new(MessageQueue::new()),
            approvals.clone(),
        );

        Ok(Self {
            repo_path: repo_path.to_path_buf(),
            mode,
            skills: SkillsLoader::for_repo(repo_path, &config.defaults.skills_dir),
            locker: Locker::for_repo(repo_path),
            resolvers: ResolverRegistry::with_builtins(),
            resolver_context,
            machine,
            config,
            discovery,
            worktrees,
            store,
            executor,
            approvals,
            active: Mutex::new(HashMap::new()),
            shutdown,
        })
    }

    pub fn with_resolvers(mut self, resolvers: ResolverRegistry) -> Self {
        self.resolvers = resolvers;
        self
    }

    /// Replace the environment resolvers see, keeping the code host.
    pub fn with_resolver_env(mut self, env: HashMap<String, String>) -> Self {
        self.resolver_context.env = env;
        self
    }

    /// Length of each simulated session turn.
    pub fn with_simulated_turn(mut self, turn: Duration) -> Self {
        self.executor = self.executor.with_simulated_turn(turn);
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn approvals(&self) -> Arc<ApprovalService> {
        self.approvals.clone()
    }

    pub fn sessions(&self) -> &SessionExecutor {
        &self.executor
    }

    pub fn locker(&self) -> &Locker {
        &self.locker
    }

    /// Token that stops [`Orchestrator::run`] when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub(super) fn active(&self) -> MutexGuard<'_, HashMap<String, ActiveStage>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stage ids with a session started by this orchestrator, sorted.
    pub fn active_stages(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// One scheduling pass: discover, then lock, allocate and spawn (skill
    /// states) or evaluate the resolver (resolver states) for each stage.
    ///
    /// Only a failed discovery query fails the tick; per-stage problems are
    /// counted and logged.
    pub async fn tick(&self) -> Result<TickReport, OrchestratorError> {
        let max = self.config.defaults.max_parallel;
        let found = self.discovery.discover(&self.repo_path, max).await?;

        let mut report = TickReport {
            discovered: found.ready_stages.len(),
            ..TickReport::default()
        };

        for stage in &found.ready_stages {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.schedule_stage(stage).await {
                StageOutcome::Spawned => report.spawned += 1,
                StageOutcome::Resolved => report.resolved += 1,
                StageOutcome::Skipped => report.skipped += 1,
                StageOutcome::Failed => report.errors += 1,
            }
        }

        tracing::info!(
            discovered = report.discovered,
            spawned = report.spawned,
            resolved = report.resolved,
            skipped = report.skipped,
            errors = report.errors,
            blocked = found.blocked_count,
            in_progress = found.in_progress_count,
            "Tick complete"
        );
        Ok(report)
    }

    async fn schedule_stage(&self, stage: &ReadyStage) -> StageOutcome {
        if self.active().contains_key(&stage.id) {
            tracing::debug!(stage_id = %stage.id, "Session already running");
            return StageOutcome::Skipped;
        }

        let record = match self.store.load(&stage.id).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(stage_id = %stage.id, error = %e, "Failed to load stage");
                return StageOutcome::Failed;
            }
        };

        let entering = record.status.is_empty() || record.status == NOT_STARTED_STATUS;
        let state = if entering {
            self.machine.entry_state().clone()
        } else {
            match self.machine.state_by_status(&record.status) {
                Some(state) => state.clone(),
                None => {
                    tracing::debug!(stage_id = %stage.id, status = %record.status, "Status maps to no pipeline state");
                    return StageOutcome::Skipped;
                }
            }
        };
        let status = state.status.clone();

        match &state.automation {
            Automation::Resolver(name) => {
                self.run_resolver(stage, &record, &status, name, entering)
                    .await
            }
            Automation::Skill(name) => self.spawn_skill(stage, &status, name, entering).await,
        }
    }

    /// Persist the entry status for a stage that has not started. Called with
    /// the stage lock held; releases it when the write fails.
    async fn enter_pipeline(&self, stage_id: &str, entry_status: &str) -> bool {
        if let Err(e) = self.store.set_status(stage_id, entry_status).await {
            tracing::warn!(stage_id, error = %e, "Failed to move stage into the entry phase");
            self.release_lock(stage_id);
            return false;
        }
        tracing::info!(stage_id, status = entry_status, "Stage entered the pipeline");
        true
    }

    async fn run_resolver(
        &self,
        stage: &ReadyStage,
        record: &StageRecord,
        status: &str,
        resolver: &str,
        entering: bool,
    ) -> StageOutcome {
        if let Err(e) = self.locker.acquire(&stage.id) {
            tracing::debug!(stage_id = %stage.id, error = %e, "Lock contention");
            return StageOutcome::Skipped;
        }
        if entering && !self.enter_pipeline(&stage.id, status).await {
            return StageOutcome::Failed;
        }

        let mut input = stage.to_input(status, record.pr_url.clone());
        if input.refinement_type.is_empty() {
            input.refinement_type = record.refinement_type.clone();
        }

        let outcome = match self
            .resolvers
            .execute_bounded(
                resolver,
                &input,
                &self.resolver_context,
                self.config.defaults.resolver_timeout(),
            )
            .await
        {
            Ok(Some(target)) => match self.apply_transition(&stage.id, status, &target).await {
                Ok(()) => StageOutcome::Resolved,
                Err(e) => {
                    tracing::warn!(stage_id = %stage.id, resolver, error = %e, "Resolver transition rejected");
                    StageOutcome::Failed
                }
            },
            Ok(None) => {
                tracing::debug!(stage_id = %stage.id, resolver, "No transition yet");
                StageOutcome::Skipped
            }
            Err(e) => {
                tracing::warn!(stage_id = %stage.id, resolver, error = %e, "Resolver failed");
                StageOutcome::Failed
            }
        };

        self.release_lock(&stage.id);
        outcome
    }

    async fn spawn_skill(
        &self,
        stage: &ReadyStage,
        status: &str,
        skill: &str,
        entering: bool,
    ) -> StageOutcome {
        if self.active().len() >= self.config.defaults.max_parallel {
            tracing::debug!(stage_id = %stage.id, "At max parallelism");
            return StageOutcome::Skipped;
        }

        if let Err(e) = self.locker.acquire(&stage.id) {
            tracing::debug!(stage_id = %stage.id, error = %e, "Lock contention");
            return StageOutcome::Skipped;
        }
        if entering && !self.enter_pipeline(&stage.id, status).await {
            return StageOutcome::Failed;
        }

        let worktree = match self.worktrees.create(&stage.branch(), &self.repo_path).await {
            Ok(worktree) => worktree,
            Err(e) => {
                self.release_lock(&stage.id);
                return match e {
                    WorktreeError::PoolExhausted { .. } => {
                        tracing::debug!(stage_id = %stage.id, "Worktree pool exhausted");
                        StageOutcome::Skipped
                    }
                    e => {
                        tracing::warn!(stage_id = %stage.id, error = %e, "Failed to create worktree");
                        StageOutcome::Failed
                    }
                };
            }
        };

        let prompt = self.session_prompt(&stage.id, skill).await;
        self.active().insert(
            stage.id.clone(),
            ActiveStage {
                worktree: worktree.clone(),
                status: status.to_string(),
            },
        );

        let request = SpawnRequest {
            stage_id: stage.id.clone(),
            worktree: worktree.clone(),
            prompt,
        };
        match self.executor.spawn(request).await {
            Ok(entry) => {
                tracing::info!(
                    stage_id = %stage.id,
                    session_id = %entry.session_id,
                    worktree_index = worktree.index,
                    skill,
                    "Spawned session"
                );
                StageOutcome::Spawned
            }
            Err(e) => {
                tracing::warn!(stage_id = %stage.id, error = %e, "Failed to spawn session");
                self.active().remove(&stage.id);
                self.reclaim_worktree(&stage.id, &worktree, true).await;
                self.release_lock(&stage.id);
                StageOutcome::Failed
            }
        }
    }

    async fn session_prompt(&self, stage_id: &str, skill: &str) -> String {
        match self.skills.load_skill(skill).await {
            Ok(Some(loaded)) => loaded.session_prompt(stage_id),
            Ok(None) => {
                tracing::warn!(stage_id, skill, "Skill file not found; using a bare prompt");
                fallback_prompt(stage_id, skill)
            }
            Err(e) => {
                tracing::warn!(stage_id, skill, error = %e, "Failed to read skill; using a bare prompt");
                fallback_prompt(stage_id, skill)
            }
        }
    }

    /// Validate `from_status -> target` and persist the resulting status.
    pub(super) async fn apply_transition(
        &self,
        stage_id: &str,
        from_status: &str,
        target: &str,
    ) -> anyhow::Result<()> {
        let validator = TransitionValidator::new(&self.machine);
        validator.validate(from_status, target)?;
        let Some(next) = validator.resolve_transition_target(from_status, target) else {
            anyhow::bail!("No status for transition '{}' from '{}'", target, from_status);
        };
        self.store.set_status(stage_id, &next).await?;
        tracing::info!(stage_id, from = from_status, to = %next, target, "Stage transitioned");
        Ok(())
    }

    pub(super) fn release_lock(&self, stage_id: &str) {
        if let Err(e) = self.locker.release(stage_id) {
            tracing::warn!(stage_id, error = %e, "Failed to release stage lock");
        }
    }

    /// Return a stage's worktree slot, tearing the workspace down when `remove`.
    pub(super) async fn reclaim_worktree(&self, stage_id: &str, worktree: &WorktreeInfo, remove: bool) {
        if remove && let Err(e) = self.worktrees.remove(&worktree.path).await {
            tracing::warn!(
                stage_id,
                worktree_index = worktree.index,
                error = %e,
                "Failed to remove worktree"
            );
        }
        if let Err(e) = self.worktrees.release_index(worktree.index) {
            tracing::debug!(stage_id, worktree_index = worktree.index, error = %e, "Worktree index already free");
        }
    }
}

fn fallback_prompt(stage_id: &str, skill: &str) -> String {
    format!(
        "Use the {} skill to work on stage {}. When finished, set requested_transition in the stage file.",
        skill, stage_id
    )
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("repo_path", &self.repo_path)
            .field("mode", &self.mode)
            .field("entry_phase", &self.config.entry_phase)
            .field("active", &self.active_stages())
            .finish_non_exhaustive()
    }
}
