//! Per-process lifecycle state
//!
//! [`ProcessEntry`] carries the FSM state of one kernel task together with
//! the bookkeeping needed to issue start/end notifications exactly once.
//! The transition rules themselves live in [`crate::tracker`], which is the
//! only place that has the table, the asid index and the guest at hand.

use crate::guest::{TaskId, KERNEL_ASID};
use crate::handle::ProcessHandle;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle FSM states
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcState {
    /// Discovered, not yet confirmed running
    Init,
    /// Executing normally
    Run,
    /// Inside `clone`, child not yet visible
    Cln,
    /// Inside `execve`
    Exe,
    /// Vfork parent, sharing its asid with the child
    Vfp,
    /// Vfork child, borrowing the parent's asid
    Vfc,
    /// Hit by a fatal signal, not yet descheduled
    Kill,
    /// Terminated
    End,
    /// Kernel context without a user process
    Kern,
}

impl ProcState {
    pub const ALL: [ProcState; 9] = [
        ProcState::Init,
        ProcState::Run,
        ProcState::Cln,
        ProcState::Exe,
        ProcState::Vfp,
        ProcState::Vfc,
        ProcState::Kill,
        ProcState::End,
        ProcState::Kern,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProcState::Init => "INIT",
            ProcState::Run => "RUN",
            ProcState::Cln => "CLN",
            ProcState::Exe => "EXE",
            ProcState::Vfp => "VFP",
            ProcState::Vfc => "VFC",
            ProcState::Kill => "KILL",
            ProcState::End => "END",
            ProcState::Kern => "KERN",
        }
    }

    /// States of entries that may still issue syscalls or be signalled
    pub fn is_live(self) -> bool {
        !matches!(self, ProcState::End | ProcState::Kern)
    }
}

impl fmt::Display for ProcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-owning back-reference between the two halves of a vfork
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VforkLink {
    /// Set on the child; names the parent
    Parent(TaskId),
    /// Set on the parent; names the child
    Child(TaskId),
}

/// Derived state for one kernel task
#[derive(Debug, Clone)]
pub struct ProcessEntry {
    handle: ProcessHandle,
    prev_handle: Option<ProcessHandle>,
    state: ProcState,
    prev_state: ProcState,
    vfork: Option<VforkLink>,
    started: bool,
    ended: bool,
}

impl ProcessEntry {
    /// Fresh entry: `INIT` for user contexts, `KERN` for kernel ones
    pub fn new(handle: ProcessHandle) -> Self {
        let state = Self::initial_state(&handle);
        Self {
            handle,
            prev_handle: None,
            state,
            prev_state: state,
            vfork: None,
            started: false,
            ended: false,
        }
    }

    fn initial_state(handle: &ProcessHandle) -> ProcState {
        if handle.asid == KERNEL_ASID {
            ProcState::Kern
        } else {
            ProcState::Init
        }
    }

    /// Rebind the entry to a new identity of the same task.
    ///
    /// Clears the vfork link and notification flags. Callers must have
    /// dissolved any vfork pairing and issued the end notification first.
    pub fn reset(&mut self, handle: ProcessHandle) {
        debug_assert_eq!(handle.task_id, self.handle.task_id);
        self.prev_handle = Some(self.handle);
        self.handle = handle;
        self.state = Self::initial_state(&handle);
        self.vfork = None;
        self.started = false;
        self.ended = false;
    }

    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    pub fn prev_handle(&self) -> Option<&ProcessHandle> {
        self.prev_handle.as_ref()
    }

    pub fn task_id(&self) -> TaskId {
        self.handle.task_id
    }

    pub fn state(&self) -> ProcState {
        self.state
    }

    pub fn set_state(&mut self, state: ProcState) {
        self.state = state;
    }

    /// Snapshot the state so that [`Self::transition`] can report changes
    pub fn save_state(&mut self) {
        self.prev_state = self.state;
    }

    /// `Some((from, to))` when the state moved since the last save
    pub fn transition(&self) -> Option<(ProcState, ProcState)> {
        (self.prev_state != self.state).then_some((self.prev_state, self.state))
    }

    pub fn vfork(&self) -> Option<VforkLink> {
        self.vfork
    }

    pub fn vfork_parent(&self) -> Option<TaskId> {
        match self.vfork {
            Some(VforkLink::Parent(t)) => Some(t),
            _ => None,
        }
    }

    pub fn vfork_child(&self) -> Option<TaskId> {
        match self.vfork {
            Some(VforkLink::Child(t)) => Some(t),
            _ => None,
        }
    }

    pub fn set_vfork(&mut self, link: Option<VforkLink>) {
        self.vfork = link;
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn ended(&self) -> bool {
        self.ended
    }

    pub(crate) fn mark_started(&mut self) {
        self.started = true;
    }

    pub(crate) fn mark_ended(&mut self) {
        self.ended = true;
    }
}
