use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;

use crate::errors::OrchestratorError;
use crate::pipeline::{COMPLETE_STATUS, DONE_TARGET};
use crate::session::{RegistryEvent, SessionEntry};

use super::engine::{ActiveStage, Orchestrator};

/// What [`Orchestrator::shutdown`] cleaned up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub sessions_terminated: usize,
    pub worktrees_released: usize,
    pub locks_released: usize,
}

impl Orchestrator {
    /// Drive ticks until the shutdown token fires. With `once`, run a single
    /// tick and return when the sessions it spawned have ended.
    ///
    /// Shutdown cleanup runs on every exit path.
    pub async fn run(&self, once: bool) -> Result<ShutdownReport, OrchestratorError> {
        if let Err(e) = self
            .worktrees
            .validate_isolation_strategy(&self.repo_path)
            .await
        {
            self.shutdown.cancel();
            return Err(e.into());
        }

        let mut events = self.executor.registry().subscribe();
        let mut interval = tokio::time::interval(self.config.defaults.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticked = false;

        tracing::info!(
            repo = %self.repo_path.display(),
            mode = ?self.mode,
            max_parallel = self.config.defaults.max_parallel,
            once,
            "Orchestrator started"
        );

        loop {
            if once && ticked && self.active().is_empty() {
                break;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick(), if !(once && ticked) => {
                    ticked = true;
                    if let Err(e) = self.tick().await {
                        // retried next tick
                        tracing::warn!(error = %e, "Tick failed");
                    }
                }
                event = events.recv() => match event {
                    Ok(RegistryEvent::Ended(entry)) => self.on_session_ended(entry).await,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Missed session events; reconciling");
                        self.reconcile().await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }

        Ok(self.shutdown().await)
    }

    /// Finish a skill stage whose session ended: apply the transition it
    /// requested, then give back its worktree and lock.
    pub async fn on_session_ended(&self, entry: SessionEntry) {
        let Some(active) = self.active().remove(&entry.stage_id) else {
            return;
        };
        let stage_id = entry.stage_id.as_str();

        if self.shutdown.is_cancelled() {
            // interrupted, not finished
            self.reclaim_worktree(stage_id, &active.worktree, false).await;
        } else {
            self.complete_stage(stage_id, &active).await;
            self.reclaim_worktree(stage_id, &active.worktree, true).await;
        }
        self.release_lock(stage_id);
    }

    async fn complete_stage(&self, stage_id: &str, active: &ActiveStage) {
        let record = match self.store.load(stage_id).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(stage_id, error = %e, "Failed to reload finished stage");
                return;
            }
        };

        if let Some(target) = record.requested_transition.as_deref() {
            if let Err(e) = self.apply_transition(stage_id, &active.status, target).await {
                tracing::warn!(stage_id, target, error = %e, "Requested transition rejected");
            }
            return;
        }

        if record.status == active.status {
            tracing::info!(stage_id, status = %record.status, "Session ended without requesting a transition");
            return;
        }

        // The session rewrote the status itself.
        if !self.is_declared_move(&active.status, &record.status) {
            tracing::warn!(
                stage_id,
                from = %active.status,
                to = %record.status,
                "Session moved the stage along an undeclared transition"
            );
        }
    }

    /// Whether a state declares a transition landing on `to_status`.
    fn is_declared_move(&self, from_status: &str, to_status: &str) -> bool {
        let Some(source) = self.machine.state_by_status(from_status) else {
            return false;
        };
        source.transitions_to.iter().any(|target| {
            if target == DONE_TARGET {
                to_status == COMPLETE_STATUS
            } else {
                self.machine
                    .state_by_name(target)
                    .is_some_and(|state| state.status == to_status)
            }
        })
    }

    /// Finish any stage whose session is gone but whose end event was missed.
    async fn reconcile(&self) {
        let orphaned: Vec<String> = self
            .active_stages()
            .into_iter()
            .filter(|id| self.executor.registry().get(id).is_none())
            .collect();
        for stage_id in orphaned {
            let worktree_path = self
                .active()
                .get(&stage_id)
                .map(|a| a.worktree.path.clone())
                .unwrap_or_default();
            let now = chrono::Utc::now();
            self.on_session_ended(SessionEntry {
                stage_id,
                session_id: String::new(),
                process_id: None,
                worktree_path,
                status: crate::session::SessionStatus::Ended,
                spawned_at: now,
                last_activity: now,
            })
            .await;
        }
    }

    /// Stop ticking, terminate sessions, release worktree indices, then
    /// release locks. Safe to call more than once.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.shutdown.cancel();

        let sessions_terminated = self.executor.terminate_all().await;

        let interrupted: Vec<(String, ActiveStage)> = self.active().drain().collect();
        for (stage_id, active) in &interrupted {
            self.reclaim_worktree(stage_id, &active.worktree, false).await;
        }

        let locks_released = self.locker.release_all();
        let report = ShutdownReport {
            sessions_terminated,
            worktrees_released: interrupted.len(),
            locks_released,
        };
        tracing::info!(
            sessions = report.sessions_terminated,
            worktrees = report.worktrees_released,
            locks = report.locks_released,
            "Orchestrator stopped"
        );
        report
    }
}
