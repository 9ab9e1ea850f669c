//! Recorded trace replay
//!
//! A trace is a JSON-lines file. Each record either changes the guest model
//! (the process list and the current task) or delivers an event to the
//! tracker. Blank lines and lines starting with `#` are skipped.
//!
//! ```text
//! {"event":"spawn","task_id":16,"asid":4096,"pid":100,"ppid":1}
//! {"event":"boot"}
//! {"event":"schedule","task_id":16}
//! {"event":"sys_enter","nr":57}
//! {"event":"context_switch","old_asid":4096,"new_asid":8192,"next_task":32}
//! ```
//!
//! A `context_switch` record is handled before the guest model switches to
//! `next_task`, matching the ordering of the asid-change hook.

use crate::error::{ReplayError, TrackerError};
use crate::guest::{Asid, GuestModel, TaskId};
use crate::handle::ProcessHandle;
use crate::stats::SessionSummary;
use crate::tracker::{LifecycleEvent, ProcessTracker};
use serde::{Deserialize, Serialize};
use std::io::BufRead;

/// One line of a recorded trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceRecord {
    /// A task appears in the guest process list
    Spawn {
        task_id: TaskId,
        asid: Asid,
        pid: i32,
        ppid: i32,
    },
    /// Fields of a listed task change
    Update {
        task_id: TaskId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        asid: Option<Asid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ppid: Option<i32>,
    },
    /// A task leaves the process list
    Reap { task_id: TaskId },
    /// The task owning the current context changes without an asid switch
    Schedule { task_id: TaskId },
    /// Populate the tracker from the process list
    Boot,
    SysEnter { nr: i64 },
    SysReturn { nr: i64, retval: i64 },
    KillReturn { pid: i32, sig: i32, retval: i64 },
    ContextSwitch {
        old_asid: Asid,
        new_asid: Asid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_task: Option<TaskId>,
    },
}

impl TraceRecord {
    /// Parse a single trace line; `None` for blank and comment lines
    pub fn parse(line: &str) -> Option<serde_json::Result<Self>> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return None;
        }
        Some(serde_json::from_str(trimmed))
    }
}

/// Drives a [`ProcessTracker`] from trace records
#[derive(Debug)]
pub struct Replayer {
    guest: GuestModel,
    tracker: ProcessTracker,
    records: usize,
}

impl Replayer {
    pub fn new(tracker: ProcessTracker) -> Self {
        Self {
            guest: GuestModel::new(),
            tracker,
            records: 0,
        }
    }

    pub fn guest(&self) -> &GuestModel {
        &self.guest
    }

    pub fn tracker(&self) -> &ProcessTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut ProcessTracker {
        &mut self.tracker
    }

    /// Records applied so far
    pub fn records(&self) -> usize {
        self.records
    }

    /// Apply one record; `line` is used for error reporting
    pub fn apply(&mut self, line: usize, record: &TraceRecord) -> Result<(), ReplayError> {
        self.records += 1;
        let guest_err = |detail: String| ReplayError::Guest { line, detail };
        let tracker_err = |source: TrackerError| ReplayError::Tracker { line, source };

        match *record {
            TraceRecord::Spawn {
                task_id,
                asid,
                pid,
                ppid,
            } => self
                .guest
                .spawn(ProcessHandle::new(task_id, asid, pid, ppid))
                .map_err(guest_err),
            TraceRecord::Update {
                task_id,
                asid,
                pid,
                ppid,
            } => self.guest.update(task_id, asid, pid, ppid).map_err(guest_err),
            TraceRecord::Reap { task_id } => {
                self.guest.reap(task_id).map(|_| ()).map_err(guest_err)
            }
            TraceRecord::Schedule { task_id } => self.guest.schedule(task_id).map_err(guest_err),
            TraceRecord::Boot => self
                .tracker
                .initialize(&self.guest)
                .map(|_| ())
                .map_err(tracker_err),
            TraceRecord::SysEnter { nr } => self
                .tracker
                .on_syscall_enter(&self.guest, nr)
                .map_err(tracker_err),
            TraceRecord::SysReturn { nr, retval } => self
                .tracker
                .on_syscall_return(&self.guest, nr, retval)
                .map_err(tracker_err),
            TraceRecord::KillReturn { pid, sig, retval } => self
                .tracker
                .on_kill_return(&self.guest, pid, sig, retval)
                .map_err(tracker_err),
            TraceRecord::ContextSwitch {
                old_asid,
                new_asid,
                next_task,
            } => {
                self.tracker
                    .on_context_switch(&self.guest, old_asid, new_asid)
                    .map_err(tracker_err)?;
                match next_task {
                    Some(task_id) => self.guest.schedule(task_id).map_err(guest_err),
                    None => Ok(()),
                }
            }
        }
    }

    /// Replay a whole trace, handing every notification to `sink` as soon
    /// as it is issued. Teardown notifications are delivered too.
    pub fn run<R, F>(mut self, reader: R, mut sink: F) -> Result<SessionSummary, ReplayError>
    where
        R: BufRead,
        F: FnMut(&LifecycleEvent),
    {
        for (idx, line) in reader.lines().enumerate() {
            let line_no = idx + 1;
            let line = line?;
            let Some(parsed) = TraceRecord::parse(&line) else {
                continue;
            };
            let record = parsed.map_err(|source| ReplayError::Parse {
                line: line_no,
                source,
            })?;
            self.apply(line_no, &record)?;
            for event in self.tracker.take_events() {
                sink(&event);
            }
        }

        tracing::debug!("replayed {} records", self.records);
        let summary = self.tracker.teardown();
        for event in self.tracker.take_events() {
            sink(&event);
        }
        Ok(summary)
    }
}
