//! The tick loop: discover ready stages, then lock, allocate a worktree and
//! spawn a session for skill states, or evaluate the resolver for resolver
//! states. Session completion applies the requested transition and gives
//! the worktree and lock back. Shutdown terminates sessions, frees worktree
//! indices and only then releases locks.

mod engine;
mod lifecycle;

pub use engine::{Orchestrator, TickReport};
pub use lifecycle::ShutdownReport;
