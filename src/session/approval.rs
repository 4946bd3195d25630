//! Blocking requests from sessions that need a human: tool permissions and
//! questions. Each request is resolved exactly once, then forgotten.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

use crate::errors::SessionError;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestKind {
    Permission { tool_name: String, input: Value },
    Question { input: Value },
}

/// A request awaiting a human decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingRequest {
    pub id: String,
    pub stage_id: String,
    #[serde(flatten)]
    pub kind: RequestKind,
    pub requested_at: DateTime<Utc>,
}

impl PendingRequest {
    pub fn is_question(&self) -> bool {
        matches!(self.kind, RequestKind::Question { .. })
    }

    /// One-line description for prompts and logs.
    pub fn summary(&self) -> String {
        match &self.kind {
            RequestKind::Permission { tool_name, input } => format!(
                "{} wants to use {}: {}",
                self.stage_id,
                tool_name,
                crate::session::protocol::describe_tool_use(tool_name, input)
            ),
            RequestKind::Question { .. } => format!("{} has a question", self.stage_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Deny { reason: String },
    Answer { answers: BTreeMap<String, String> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalEvent {
    Requested(PendingRequest),
    Resolved {
        id: String,
        stage_id: String,
        decision: ApprovalDecision,
    },
    Cancelled {
        id: String,
        stage_id: String,
    },
}

struct Waiting {
    request: PendingRequest,
    reply: oneshot::Sender<ApprovalDecision>,
}

/// Pending permission and question requests across all sessions.
pub struct ApprovalService {
    pending: Mutex<HashMap<String, Waiting>>,
    events: broadcast::Sender<ApprovalEvent>,
}

impl Default for ApprovalService {
    fn default() -> Self {
        Self::new()
    }
}

impl ApprovalService {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            pending: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ApprovalEvent> {
        self.events.subscribe()
    }

    fn pending_map(&self) -> MutexGuard<'_, HashMap<String, Waiting>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open(
        &self,
        stage_id: &str,
        kind: RequestKind,
    ) -> (PendingRequest, oneshot::Receiver<ApprovalDecision>) {
        let request = PendingRequest {
            id: Uuid::new_v4().to_string(),
            stage_id: stage_id.to_string(),
            kind,
            requested_at: Utc::now(),
        };
        let (reply, rx) = oneshot::channel();
        self.pending_map().insert(
            request.id.clone(),
            Waiting {
                request: request.clone(),
                reply,
            },
        );
        tracing::info!(stage_id, request_id = %request.id, "{}", request.summary());
        let _ = self.events.send(ApprovalEvent::Requested(request.clone()));
        (request, rx)
    }

    /// Ask a human whether `stage_id`'s session may run `tool_name`. The
    /// receiver errors if the request is cancelled.
    pub fn request_approval(
        &self,
        stage_id: &str,
        tool_name: &str,
        input: Value,
    ) -> (PendingRequest, oneshot::Receiver<ApprovalDecision>) {
        self.open(
            stage_id,
            RequestKind::Permission {
                tool_name: tool_name.to_string(),
                input,
            },
        )
    }

    pub fn request_question(
        &self,
        stage_id: &str,
        input: Value,
    ) -> (PendingRequest, oneshot::Receiver<ApprovalDecision>) {
        self.open(stage_id, RequestKind::Question { input })
    }

    fn resolve(&self, id: &str, decision: ApprovalDecision) -> Result<(), SessionError> {
        let waiting = self
            .pending_map()
            .remove(id)
            .ok_or_else(|| SessionError::UnknownRequest(id.to_string()))?;
        let stage_id = waiting.request.stage_id;
        tracing::info!(stage_id = %stage_id, request_id = id, ?decision, "Request resolved");
        if waiting.reply.send(decision.clone()).is_err() {
            tracing::debug!(request_id = id, "Session stopped waiting before the decision");
        }
        let _ = self.events.send(ApprovalEvent::Resolved {
            id: id.to_string(),
            stage_id,
            decision,
        });
        Ok(())
    }

    pub fn approve(&self, id: &str) -> Result<(), SessionError> {
        self.resolve(id, ApprovalDecision::Approve)
    }

    pub fn deny(&self, id: &str, reason: &str) -> Result<(), SessionError> {
        self.resolve(
            id,
            ApprovalDecision::Deny {
                reason: reason.to_string(),
            },
        )
    }

    pub fn answer(&self, id: &str, answers: BTreeMap<String, String>) -> Result<(), SessionError> {
        self.resolve(id, ApprovalDecision::Answer { answers })
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending_map().contains_key(id)
    }

    /// Outstanding requests, oldest first.
    pub fn pending(&self) -> Vec<PendingRequest> {
        let mut pending: Vec<_> = self
            .pending_map()
            .values()
            .map(|w| w.request.clone())
            .collect();
        pending.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        pending
    }

    /// Drop every request from `stage_id`. Returns how many were dropped.
    pub fn cancel_for_stage(&self, stage_id: &str) -> usize {
        let cancelled: Vec<PendingRequest> = {
            let mut map = self.pending_map();
            let ids: Vec<String> = map
                .values()
                .filter(|w| w.request.stage_id == stage_id)
                .map(|w| w.request.id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| map.remove(id))
                .map(|w| w.request)
                .collect()
        };
        for request in &cancelled {
            let _ = self.events.send(ApprovalEvent::Cancelled {
                id: request.id.clone(),
                stage_id: request.stage_id.clone(),
            });
        }
        if !cancelled.is_empty() {
            tracing::debug!(stage_id, count = cancelled.len(), "Cancelled pending requests");
        }
        cancelled.len()
    }
}

impl std::fmt::Debug for ApprovalService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalService")
            .field("pending", &self.pending_map().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_approve_delivers_decision_once() {
        let service = ApprovalService::new();
        let (request, rx) = service.request_approval("S1", "Bash", json!({"command": "ls"}));
        assert_eq!(service.pending().len(), 1);
        assert!(service.is_pending(&request.id));

        service.approve(&request.id).unwrap();
        assert_eq!(rx.await.unwrap(), ApprovalDecision::Approve);
        assert!(service.pending().is_empty());
        assert!(!service.is_pending(&request.id));

        // already resolved
        assert!(matches!(
            service.deny(&request.id, "late"),
            Err(SessionError::UnknownRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_deny_carries_reason() {
        let service = ApprovalService::new();
        let (request, rx) = service.request_approval("S1", "Write", json!({}));
        service.deny(&request.id, "not in this repo").unwrap();
        assert_eq!(
            rx.await.unwrap(),
            ApprovalDecision::Deny {
                reason: "not in this repo".into()
            }
        );
    }

    #[tokio::test]
    async fn test_answer_question() {
        let service = ApprovalService::new();
        let (request, rx) = service.request_question("S2", json!({"questions": []}));
        assert!(request.is_question());

        let answers = BTreeMap::from([("Which DB?".to_string(), "Postgres".to_string())]);
        service.answer(&request.id, answers.clone()).unwrap();
        assert_eq!(rx.await.unwrap(), ApprovalDecision::Answer { answers });
    }

    #[tokio::test]
    async fn test_cancel_for_stage_drops_only_that_stage() {
        let service = ApprovalService::new();
        let (_, rx1) = service.request_approval("S1", "Bash", json!({}));
        let (_, _rx2) = service.request_question("S1", json!({}));
        let (other, _rx3) = service.request_approval("S2", "Bash", json!({}));

        assert_eq!(service.cancel_for_stage("S1"), 2);
        assert!(rx1.await.is_err());
        let pending = service.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, other.id);
    }

    #[tokio::test]
    async fn test_observers_see_requests_and_resolutions() {
        let service = ApprovalService::new();
        let mut events = service.subscribe();
        let (request, _rx) = service.request_approval("S1", "Bash", json!({"command": "ls"}));
        service.approve(&request.id).unwrap();

        match events.recv().await.unwrap() {
            ApprovalEvent::Requested(r) => assert_eq!(r.id, request.id),
            other => panic!("Expected Requested, got {:?}", other),
        }
        assert!(matches!(
            events.recv().await.unwrap(),
            ApprovalEvent::Resolved { decision: ApprovalDecision::Approve, .. }
        ));
    }

    #[test]
    fn test_pending_request_serializes_flat() {
        let service = ApprovalService::new();
        let (request, _rx) = service.request_approval("S1", "Bash", json!({"command": "ls"}));
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["kind"], "permission");
        assert_eq!(value["tool_name"], "Bash");
        assert_eq!(value["stage_id"], "S1");
        assert!(request.summary().contains("Running: ls"));
    }
}
