//! Agent sessions: spawning, tracking, follow-up messages and human approvals.

pub mod approval;
pub mod console;
pub mod executor;
pub mod message_queue;
pub mod protocol;
pub mod registry;

pub use approval::{ApprovalDecision, ApprovalEvent, ApprovalService, PendingRequest, RequestKind};
pub use console::ConsoleResponder;
pub use executor::{Delivery, SessionExecutor, SpawnRequest};
pub use message_queue::{MessageQueue, QueuedMessage};
pub use registry::{NewSession, RegistryEvent, SessionEntry, SessionRegistry, SessionStatus};
