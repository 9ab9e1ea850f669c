//! Error types for process lifecycle tracking
//!
//! Every variant of [`TrackerError`] is a fatal inconsistency: the observed
//! event stream contradicts the lifecycle model and the derived state can no
//! longer be trusted. Recoverable conditions (expected races, survivable
//! oddities) never surface as errors; they are logged through `tracing`.

use crate::fsm::ProcState;
use crate::guest::{Asid, TaskId};
use crate::handle::ProcessHandle;
use thiserror::Error;

/// Fatal inconsistencies detected while tracking processes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("Invalid transition: {event} at state {state} for {handle}")]
    InvalidTransition {
        state: ProcState,
        event: String,
        handle: ProcessHandle,
    },

    #[error("Asid collision: {asid:#x} already maps to task {existing:#x}, cannot bind task {requested:#x}")]
    AsidCollision {
        asid: Asid,
        existing: TaskId,
        requested: TaskId,
    },

    #[error("No mapping for asid {0:#x}")]
    AsidMappingMissing(Asid),

    #[error("Asid {asid:#x} already maps to task {task_id:#x}")]
    AsidRebindSame { asid: Asid, task_id: TaskId },

    #[error("Invalid vfork link for task {task_id:#x}: {detail}")]
    InvalidVforkLink { task_id: TaskId, detail: String },

    #[error("Unknown asid {asid:#x} scheduled after {context}")]
    UnexpectedAsid { asid: Asid, context: String },

    #[error("Task {0:#x} is not in the process table")]
    UnknownTask(TaskId),

    #[error("Duplicate task {0:#x} in the process table")]
    DuplicateTask(TaskId),

    #[error("Duplicate end notification for {0}")]
    DuplicateEnd(ProcessHandle),

    #[error("End recorded without a start for {0}")]
    EndWithoutStart(ProcessHandle),

    #[error("Identity of {current} changed unexpectedly (was {previous})")]
    IdentityDrift {
        previous: ProcessHandle,
        current: ProcessHandle,
    },

    #[error("Context mismatch on switch {old_asid:#x} -> {new_asid:#x}: current entry is {handle} at state {state}")]
    ContextMismatch {
        old_asid: Asid,
        new_asid: Asid,
        handle: ProcessHandle,
        state: ProcState,
    },

    #[error("Expected task {expected:#x} to run next, observed {observed:#x}")]
    GuessMismatch { expected: TaskId, observed: TaskId },

    #[error("Introspection failed: {0}")]
    Introspection(String),

    #[error("Tracker already initialized")]
    AlreadyInitialized,

    #[error("Tracker is unusable after a previous fatal error")]
    Poisoned,
}

/// Result type for tracker operations
pub type Result<T> = std::result::Result<T, TrackerError>;

/// Errors produced while replaying a recorded trace
#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("Malformed trace record at line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Guest model error at line {line}: {detail}")]
    Guest { line: usize, detail: String },

    #[error("Fatal inconsistency at line {line}: {source}")]
    Tracker {
        line: usize,
        #[source]
        source: TrackerError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
