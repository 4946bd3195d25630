//! Spawns and supervises agent sessions, one per scheduled skill stage.
//!
//! A session is the agent CLI running in stream-json mode inside the stage's
//! worktree. The executor feeds it the skill prompt, watches its stdout,
//! answers permission and question requests per the confirmation policy,
//! delivers queued follow-ups when a turn ends, and ends the registry entry
//! when the process exits.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{ConfirmationPolicy, Mode};
use crate::errors::SessionError;
use crate::worktree::WorktreeInfo;

use super::approval::{ApprovalDecision, ApprovalService};
use super::message_queue::MessageQueue;
use super::protocol::{self, SESSION_ARGS, SessionSignal};
use super::registry::{NewSession, SessionEntry, SessionRegistry};

/// How long an idle session waits for a follow-up before its input is closed.
const DEFAULT_IDLE_GRACE: Duration = Duration::from_secs(120);

/// Length of each simulated turn.
const DEFAULT_SIMULATED_TURN: Duration = Duration::from_millis(200);

/// How long `terminate_all` waits for each session to wind down.
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(10);

const POLICY_DENIED: &str = "Denied by the orchestrator's confirmation policy";
const NO_HUMAN: &str = "No human is available to answer; proceed with your best judgement";
const REQUEST_CANCELLED: &str = "The request was cancelled before a human decided";

type SharedStdin = Arc<Mutex<Option<ChildStdin>>>;

/// What to run for one stage.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub stage_id: String,
    pub worktree: WorktreeInfo,
    pub prompt: String,
}

/// Outcome of [`SessionExecutor::send_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Queued,
}

struct LiveSession {
    stdin: Option<SharedStdin>,
    idle: bool,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Shared {
    registry: Arc<SessionRegistry>,
    queue: Arc<MessageQueue>,
    approvals: Arc<ApprovalService>,
    confirmation: ConfirmationPolicy,
    live: Mutex<HashMap<String, LiveSession>>,
}

pub struct SessionExecutor {
    mode: Mode,
    agent_cmd: String,
    idle_grace: Duration,
    simulated_turn: Duration,
    shared: Arc<Shared>,
}

impl SessionExecutor {
    pub fn new(
        mode: Mode,
        agent_cmd: &str,
        confirmation: ConfirmationPolicy,
        registry: Arc<SessionRegistry>,
        queue: Arc<MessageQueue>,
        approvals: Arc<ApprovalService>,
    ) -> Self {
        Self {
            mode,
            agent_cmd: agent_cmd.to_string(),
            idle_grace: DEFAULT_IDLE_GRACE,
            simulated_turn: DEFAULT_SIMULATED_TURN,
            shared: Arc::new(Shared {
                registry,
                queue,
                approvals,
                confirmation,
                live: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn with_simulated_turn(mut self, turn: Duration) -> Self {
        self.simulated_turn = turn;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.shared.registry
    }

    /// Start a session for `request.stage_id` and register it.
    pub async fn spawn(&self, request: SpawnRequest) -> Result<SessionEntry, SessionError> {
        if self.shared.registry.get(&request.stage_id).is_some() {
            return Err(SessionError::AlreadyRunning(request.stage_id));
        }
        match self.mode {
            Mode::Normal => self.spawn_process(request).await,
            Mode::Simulated => self.spawn_simulated(request).await,
        }
    }

    async fn spawn_process(&self, request: SpawnRequest) -> Result<SessionEntry, SessionError> {
        let stage_id = request.stage_id;
        let mut child = Command::new(&self.agent_cmd)
            .args(SESSION_ARGS)
            .current_dir(&request.worktree.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SessionError::SpawnFailed {
                stage_id: stage_id.clone(),
                source,
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(SessionError::Other(anyhow::anyhow!(
                "agent process for {} has no stdio pipes",
                stage_id
            )));
        };
        let stdin: SharedStdin = Arc::new(Mutex::new(Some(stdin)));

        let entry = self.shared.registry.register(NewSession {
            stage_id: stage_id.clone(),
            session_id: Uuid::new_v4().to_string(),
            process_id: child.id(),
            worktree_path: request.worktree.path.clone(),
            spawned_at: Utc::now(),
        })?;

        if let Err(source) = write_line(&stdin, &protocol::user_message(&request.prompt)).await {
            self.shared.registry.end(&stage_id);
            return Err(SessionError::InputFailed { stage_id, source });
        }

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stage_id.clone(), stderr));
        }

        tracing::info!(
            stage_id = %stage_id,
            pid = ?entry.process_id,
            worktree = %request.worktree.path.display(),
            "Spawned agent session"
        );

        let cancel = CancellationToken::new();
        let mut live = self.shared.live.lock().await;
        let task = tokio::spawn(monitor(
            self.shared.clone(),
            stage_id.clone(),
            child,
            stdout,
            stdin.clone(),
            cancel.clone(),
            self.idle_grace,
        ));
        live.insert(
            stage_id,
            LiveSession {
                stdin: Some(stdin),
                idle: false,
                cancel,
                task,
            },
        );
        Ok(entry)
    }

    async fn spawn_simulated(&self, request: SpawnRequest) -> Result<SessionEntry, SessionError> {
        let stage_id = request.stage_id;
        let entry = self.shared.registry.register(NewSession {
            stage_id: stage_id.clone(),
            session_id: format!("simulated-{}", Uuid::new_v4()),
            process_id: None,
            worktree_path: request.worktree.path,
            spawned_at: Utc::now(),
        })?;
        tracing::info!(stage_id = %stage_id, "Spawned simulated session");

        let cancel = CancellationToken::new();
        let mut live = self.shared.live.lock().await;
        let task = tokio::spawn(simulate(
            self.shared.clone(),
            stage_id.clone(),
            self.simulated_turn,
            cancel.clone(),
        ));
        live.insert(
            stage_id,
            LiveSession {
                stdin: None,
                idle: false,
                cancel,
                task,
            },
        );
        Ok(entry)
    }

    /// Deliver a human's instruction: immediately when the session is idle,
    /// otherwise buffered until its current turn ends.
    pub async fn send_message(&self, stage_id: &str, message: &str) -> Result<Delivery, SessionError> {
        let stdin = {
            let mut live = self.shared.live.lock().await;
            let session = live
                .get_mut(stage_id)
                .ok_or_else(|| SessionError::NotFound(stage_id.to_string()))?;
            match (&session.stdin, session.idle) {
                (Some(stdin), true) => {
                    session.idle = false;
                    stdin.clone()
                }
                _ => {
                    self.shared.queue.queue(stage_id, message);
                    return Ok(Delivery::Queued);
                }
            }
        };

        write_line(&stdin, &protocol::user_message(message))
            .await
            .map_err(|source| SessionError::InputFailed {
                stage_id: stage_id.to_string(),
                source,
            })?;
        self.shared.registry.touch(stage_id);
        Ok(Delivery::Sent)
    }

    /// Stop every tracked session and wait for each to wind down.
    pub async fn terminate_all(&self) -> usize {
        let sessions: Vec<(String, LiveSession)> = self.shared.live.lock().await.drain().collect();
        for (_, session) in &sessions {
            session.cancel.cancel();
        }

        let count = sessions.len();
        let waits = sessions.into_iter().map(|(stage_id, session)| async move {
            if tokio::time::timeout(TERMINATE_TIMEOUT, session.task)
                .await
                .is_err()
            {
                tracing::warn!(stage_id = %stage_id, "Session did not stop in time");
            }
        });
        futures::future::join_all(waits).await;
        if count > 0 {
            tracing::info!(count, "Terminated sessions");
        }
        count
    }
}

impl std::fmt::Debug for SessionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionExecutor")
            .field("mode", &self.mode)
            .field("agent_cmd", &self.agent_cmd)
            .field("confirmation", &self.shared.confirmation)
            .finish_non_exhaustive()
    }
}

async fn write_line(stdin: &SharedStdin, line: &str) -> std::io::Result<()> {
    let mut guard = stdin.lock().await;
    let Some(pipe) = guard.as_mut() else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "session input is closed",
        ));
    };
    pipe.write_all(line.as_bytes()).await?;
    pipe.write_all(b"\n").await?;
    pipe.flush().await
}

async fn drain_stderr(stage_id: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(stage_id = %stage_id, "agent stderr: {}", line);
    }
}

async fn monitor(
    shared: Arc<Shared>,
    stage_id: String,
    mut child: Child,
    stdout: ChildStdout,
    stdin: SharedStdin,
    cancel: CancellationToken,
    idle_grace: Duration,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut idle_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(stage_id = %stage_id, "Terminating agent session");
                if let Err(e) = child.kill().await {
                    tracing::warn!(stage_id = %stage_id, error = %e, "Failed to kill agent process");
                }
                break;
            }
            _ = tokio::time::sleep_until(idle_deadline.unwrap_or_else(Instant::now)), if idle_deadline.is_some() => {
                idle_deadline = None;
                if shared.close_if_idle(&stage_id, &stdin).await {
                    tracing::info!(stage_id = %stage_id, "Session idle; closing its input");
                }
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if shared.handle_line(&stage_id, &line, &stdin).await {
                        idle_deadline = Some(Instant::now() + idle_grace);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(stage_id = %stage_id, error = %e, "Failed to read agent output");
                    break;
                }
            }
        }
    }

    match child.wait().await {
        Ok(status) => tracing::info!(stage_id = %stage_id, %status, "Agent process exited"),
        Err(e) => tracing::warn!(stage_id = %stage_id, error = %e, "Failed to reap agent process"),
    }
    shared.finish(&stage_id).await;
}

async fn simulate(shared: Arc<Shared>, stage_id: String, turn: Duration, cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(turn) => {
            shared.registry.activate(&stage_id, None);
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(turn) => {}
            }
        }
    }
    shared.finish(&stage_id).await;
}

impl Shared {
    /// React to one stdout line. Returns true when the session went idle.
    async fn handle_line(&self, stage_id: &str, line: &str, stdin: &SharedStdin) -> bool {
        let signal = match protocol::parse_line(line) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::debug!(stage_id, error = %e, "Ignoring unparseable agent output");
                return false;
            }
        };

        match signal {
            SessionSignal::Init { session_id } => {
                self.registry.activate(stage_id, Some(&session_id));
            }
            SessionSignal::Activity { summary } => {
                self.registry.touch(stage_id);
                if !summary.is_empty() {
                    tracing::debug!(stage_id, "{}", summary);
                }
            }
            SessionSignal::TurnComplete { is_error, result } => {
                self.registry.touch(stage_id);
                if is_error {
                    tracing::warn!(stage_id, result = ?result, "Agent turn ended with an error");
                }
                return self.on_turn_complete(stage_id, stdin).await;
            }
            SessionSignal::PermissionRequest {
                request_id,
                tool_name,
                input,
            } => self.on_permission(stage_id, request_id, &tool_name, input, stdin),
            SessionSignal::Question { request_id, input } => {
                self.on_question(stage_id, request_id, input, stdin)
            }
            SessionSignal::Ignored => {}
        }
        false
    }

    /// Deliver a queued message if there is one, otherwise mark idle.
    async fn on_turn_complete(&self, stage_id: &str, stdin: &SharedStdin) -> bool {
        let queued = {
            let mut live = self.live.lock().await;
            let Some(session) = live.get_mut(stage_id) else {
                return false;
            };
            let queued = self.queue.take(stage_id);
            session.idle = queued.is_none();
            queued
        };

        let Some(queued) = queued else {
            return true;
        };
        match write_line(stdin, &protocol::user_message(&queued.message)).await {
            Ok(()) => {
                tracing::info!(stage_id, queued_at = %queued.queued_at, "Delivered queued message");
                false
            }
            Err(e) => {
                tracing::warn!(stage_id, error = %e, "Failed to deliver queued message");
                true
            }
        }
    }

    async fn close_if_idle(&self, stage_id: &str, stdin: &SharedStdin) -> bool {
        let idle = self
            .live
            .lock()
            .await
            .get(stage_id)
            .is_some_and(|session| session.idle);
        if idle {
            stdin.lock().await.take();
        }
        idle
    }

    fn on_permission(
        &self,
        stage_id: &str,
        request_id: String,
        tool_name: &str,
        input: Value,
        stdin: &SharedStdin,
    ) {
        match self.confirmation {
            ConfirmationPolicy::AutoApprove => {
                tracing::debug!(stage_id, tool_name, "Auto-approving tool use");
                respond(stdin.clone(), protocol::allow_response(&request_id, &input));
            }
            ConfirmationPolicy::Deny => {
                respond(stdin.clone(), protocol::deny_response(&request_id, POLICY_DENIED));
            }
            ConfirmationPolicy::Prompt => {
                let (_, rx) = self
                    .approvals
                    .request_approval(stage_id, tool_name, input.clone());
                let stdin = stdin.clone();
                tokio::spawn(async move {
                    let line = match rx.await {
                        Ok(ApprovalDecision::Approve) | Ok(ApprovalDecision::Answer { .. }) => {
                            protocol::allow_response(&request_id, &input)
                        }
                        Ok(ApprovalDecision::Deny { reason }) => {
                            protocol::deny_response(&request_id, &reason)
                        }
                        Err(_) => protocol::deny_response(&request_id, REQUEST_CANCELLED),
                    };
                    send_response(&stdin, &line).await;
                });
            }
        }
    }

    fn on_question(&self, stage_id: &str, request_id: String, input: Value, stdin: &SharedStdin) {
        if self.confirmation != ConfirmationPolicy::Prompt {
            respond(stdin.clone(), protocol::deny_response(&request_id, NO_HUMAN));
            return;
        }

        let (_, rx) = self.approvals.request_question(stage_id, input.clone());
        let stdin = stdin.clone();
        tokio::spawn(async move {
            let line = match rx.await {
                Ok(ApprovalDecision::Answer { answers }) => {
                    let mut updated = input;
                    if let Some(object) = updated.as_object_mut() {
                        object.insert("answers".to_string(), serde_json::json!(answers));
                    }
                    protocol::allow_response(&request_id, &updated)
                }
                Ok(ApprovalDecision::Approve) => protocol::allow_response(&request_id, &input),
                Ok(ApprovalDecision::Deny { reason }) => protocol::deny_response(&request_id, &reason),
                Err(_) => protocol::deny_response(&request_id, REQUEST_CANCELLED),
            };
            send_response(&stdin, &line).await;
        });
    }

    /// Tear down per-session state once the agent is gone.
    async fn finish(&self, stage_id: &str) {
        self.live.lock().await.remove(stage_id);
        self.approvals.cancel_for_stage(stage_id);
        if self.queue.clear(stage_id) {
            tracing::warn!(stage_id, "Session ended with an undelivered message");
        }
        self.registry.end(stage_id);
    }
}

fn respond(stdin: SharedStdin, line: String) {
    tokio::spawn(async move { send_response(&stdin, &line).await });
}

async fn send_response(stdin: &SharedStdin, line: &str) {
    if let Err(e) = write_line(stdin, line).await {
        tracing::debug!(error = %e, "Could not answer agent control request");
    }
}
