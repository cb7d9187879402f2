//! A thin, event-sourced workflow execution engine.
//!
//! This is not a client to a remote orchestration service — there is no
//! external durable-workflow platform in this stack. It is the in-process
//! substitute the design notes call for: every `workflow_runs` row is
//! claimed exclusively (`FOR UPDATE SKIP LOCKED`, in
//! `iamac_db::workflow_claim_batch`), every step a workflow body takes is
//! appended to `workflow_events`, and a crashed worker's successor replays
//! that log deterministically instead of re-running side effects.

mod ctx;
mod runner;

pub use ctx::{ActivityCtx, RetryPolicy, WorkflowCtx};
pub use runner::{Runner, WorkflowFn, DEFAULT_CLAIM_LEASE};

use serde::{Deserialize, Serialize};

/// The two event-type prefixes `WorkflowCtx` recognizes on replay; anything
/// else (e.g. `"started"`) is informational only and skipped during replay.
pub(crate) mod event_types {
    pub const ACTIVITY_COMPLETED_PREFIX: &str = "activity.completed:";
    pub const ACTIVITY_FAILED_PREFIX: &str = "activity.failed:";
    pub const TIMER_FIRED: &str = "timer.fired";
    pub const SIGNAL_RECEIVED_PREFIX: &str = "signal.received:";
    pub const STATE_TRANSITION: &str = "state.transition";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub old_state: String,
    pub new_state: String,
}
