use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

use crate::errors::SessionError;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Active,
    Ended,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Starting => write!(f, "starting"),
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Ended => write!(f, "ended"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionEntry {
    pub stage_id: String,
    pub session_id: String,
    pub process_id: Option<u32>,
    pub worktree_path: PathBuf,
    pub status: SessionStatus,
    pub spawned_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// A session about to be registered; status and activity are seeded.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub stage_id: String,
    pub session_id: String,
    pub process_id: Option<u32>,
    pub worktree_path: PathBuf,
    pub spawned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered(SessionEntry),
    StatusChanged(SessionEntry),
    /// Final snapshot; the entry is already gone from the registry.
    Ended(SessionEntry),
}

impl RegistryEvent {
    pub fn entry(&self) -> &SessionEntry {
        match self {
            RegistryEvent::Registered(e)
            | RegistryEvent::StatusChanged(e)
            | RegistryEvent::Ended(e) => e,
        }
    }
}

/// Live sessions keyed by stage id, with change notifications.
#[derive(Debug)]
pub struct SessionRegistry {
    entries: Mutex<HashMap<String, SessionEntry>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self, event: RegistryEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn register(&self, session: NewSession) -> Result<SessionEntry, SessionError> {
        let entry = {
            let mut entries = self.entries();
            if entries.contains_key(&session.stage_id) {
                return Err(SessionError::AlreadyRunning(session.stage_id));
            }
            let entry = SessionEntry {
                stage_id: session.stage_id.clone(),
                session_id: session.session_id,
                process_id: session.process_id,
                worktree_path: session.worktree_path,
                status: SessionStatus::Starting,
                spawned_at: session.spawned_at,
                last_activity: session.spawned_at,
            };
            entries.insert(session.stage_id, entry.clone());
            entry
        };
        tracing::debug!(stage_id = %entry.stage_id, session_id = %entry.session_id, "Session registered");
        self.notify(RegistryEvent::Registered(entry.clone()));
        Ok(entry)
    }

    /// Mark the session active, rebinding its id when the agent revealed one.
    pub fn activate(&self, stage_id: &str, session_id: Option<&str>) -> Option<SessionEntry> {
        let entry = {
            let mut entries = self.entries();
            let entry = entries.get_mut(stage_id)?;
            entry.status = SessionStatus::Active;
            entry.last_activity = Utc::now();
            if let Some(id) = session_id {
                entry.session_id = id.to_string();
            }
            entry.clone()
        };
        tracing::info!(stage_id, session_id = %entry.session_id, "Session active");
        self.notify(RegistryEvent::StatusChanged(entry.clone()));
        Some(entry)
    }

    /// Record activity without changing status. Silent.
    pub fn touch(&self, stage_id: &str) {
        if let Some(entry) = self.entries().get_mut(stage_id) {
            entry.last_activity = Utc::now();
        }
    }

    /// Remove the entry and publish its final `ended` snapshot.
    pub fn end(&self, stage_id: &str) -> Option<SessionEntry> {
        let mut entry = self.entries().remove(stage_id)?;
        entry.status = SessionStatus::Ended;
        entry.last_activity = Utc::now();
        tracing::info!(stage_id, session_id = %entry.session_id, "Session ended");
        self.notify(RegistryEvent::Ended(entry.clone()));
        Some(entry)
    }

    pub fn get(&self, stage_id: &str) -> Option<SessionEntry> {
        self.entries().get(stage_id).cloned()
    }

    pub fn size(&self) -> usize {
        self.entries().len()
    }

    /// Snapshot of all live entries, ordered by stage id.
    pub fn all(&self) -> Vec<SessionEntry> {
        let mut all: Vec<_> = self.entries().values().cloned().collect();
        all.sort_by(|a, b| a.stage_id.cmp(&b.stage_id));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_session(stage_id: &str) -> NewSession {
        NewSession {
            stage_id: stage_id.to_string(),
            session_id: "provisional".to_string(),
            process_id: Some(4242),
            worktree_path: PathBuf::from("/repo/.worktrees/worktree-1"),
            spawned_at: Utc::now(),
        }
    }

    #[test]
    fn test_register_seeds_starting_status() {
        let registry = SessionRegistry::new();
        let entry = registry.register(new_session("S1")).unwrap();
        assert_eq!(entry.status, SessionStatus::Starting);
        assert_eq!(entry.last_activity, entry.spawned_at);
        assert_eq!(registry.size(), 1);
    }

    #[test]
    fn test_register_then_activate() {
        let registry = SessionRegistry::new();
        registry.register(new_session("S1")).unwrap();
        let entry = registry.activate("S1", Some("sess-real")).unwrap();
        assert_eq!(entry.status, SessionStatus::Active);
        assert_eq!(entry.stage_id, "S1");
        assert_eq!(entry.session_id, "sess-real");
        assert_eq!(registry.get("S1").unwrap().status, SessionStatus::Active);
    }

    #[test]
    fn test_end_removes_entry() {
        let registry = SessionRegistry::new();
        registry.register(new_session("S1")).unwrap();
        registry.register(new_session("S2")).unwrap();
        assert_eq!(registry.size(), 2);

        let ended = registry.end("S1").unwrap();
        assert_eq!(ended.status, SessionStatus::Ended);
        assert!(registry.get("S1").is_none());
        assert_eq!(registry.size(), 1);
        assert!(registry.end("S1").is_none());
    }

    #[test]
    fn test_one_live_entry_per_stage() {
        let registry = SessionRegistry::new();
        registry.register(new_session("S1")).unwrap();
        assert!(matches!(
            registry.register(new_session("S1")),
            Err(SessionError::AlreadyRunning(_))
        ));
    }

    #[test]
    fn test_activate_unknown_stage_is_none() {
        let registry = SessionRegistry::new();
        assert!(registry.activate("ghost", None).is_none());
    }

    #[tokio::test]
    async fn test_observers_see_lifecycle() {
        let registry = SessionRegistry::new();
        let mut rx = registry.subscribe();

        registry.register(new_session("S1")).unwrap();
        registry.activate("S1", None);
        registry.end("S1");

        assert!(matches!(rx.recv().await.unwrap(), RegistryEvent::Registered(_)));
        match rx.recv().await.unwrap() {
            RegistryEvent::StatusChanged(e) => assert_eq!(e.status, SessionStatus::Active),
            other => panic!("Expected StatusChanged, got {:?}", other),
        }
        match rx.recv().await.unwrap() {
            RegistryEvent::Ended(e) => {
                assert_eq!(e.status, SessionStatus::Ended);
                assert_eq!(e.session_id, "provisional");
            }
            other => panic!("Expected Ended, got {:?}", other),
        }
    }
}
