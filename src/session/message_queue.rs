use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// A follow-up instruction waiting for its session to go idle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub message: String,
    pub queued_at: DateTime<Utc>,
}

/// At most one pending message per stage; a newer message replaces an
/// unconsumed older one.
#[derive(Debug, Default)]
pub struct MessageQueue {
    messages: Mutex<HashMap<String, QueuedMessage>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn messages(&self) -> MutexGuard<'_, HashMap<String, QueuedMessage>> {
        self.messages.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn queue(&self, stage_id: &str, message: &str) {
        let replaced = self
            .messages()
            .insert(
                stage_id.to_string(),
                QueuedMessage {
                    message: message.to_string(),
                    queued_at: Utc::now(),
                },
            )
            .is_some();
        tracing::debug!(stage_id, replaced, "Queued message for busy session");
    }

    /// Remove and return the pending message.
    pub fn take(&self, stage_id: &str) -> Option<QueuedMessage> {
        self.messages().remove(stage_id)
    }

    pub fn peek(&self, stage_id: &str) -> Option<QueuedMessage> {
        self.messages().get(stage_id).cloned()
    }

    pub fn has(&self, stage_id: &str) -> bool {
        self.messages().contains_key(stage_id)
    }

    /// Drop the pending message, if any. Returns whether one was dropped.
    pub fn clear(&self, stage_id: &str) -> bool {
        self.messages().remove(stage_id).is_some()
    }
}
