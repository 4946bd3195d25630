//! Pipeline model: named states, their automation, and the transitions between them.
//!
//! A pipeline is authored by state *name* (`transitions_to: [Build]`) while work
//! items persist a state's *status* string. [`PipelineStateMachine`] indexes both,
//! and [`TransitionValidator`] is the only place the two vocabularies meet.
//!
//! Every state may declare the [`DONE_TARGET`] sentinel as a target; it is not a
//! state of its own and always resolves to [`COMPLETE_STATUS`].

mod state;
mod state_machine;
mod transition;

pub use state::{Automation, PipelineState};
pub use state_machine::PipelineStateMachine;
pub use transition::{TransitionError, TransitionValidator};

/// Implicit terminal transition target every state may declare.
pub const DONE_TARGET: &str = "Done";

/// Status persisted for a stage that transitioned to [`DONE_TARGET`].
pub const COMPLETE_STATUS: &str = "Complete";

/// Status of a stage that has not entered the pipeline yet.
pub const NOT_STARTED_STATUS: &str = "Not Started";

/// Status values owned by the workflow itself; phases may not claim them.
pub const RESERVED_STATUSES: &[&str] = &[NOT_STARTED_STATUS, COMPLETE_STATUS];

/// Returns true when `status` is reserved for the workflow.
pub fn is_reserved_status(status: &str) -> bool {
    RESERVED_STATUSES.contains(&status)
}
