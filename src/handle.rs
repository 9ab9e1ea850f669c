//! Stable process handle passed to lifecycle consumers

use crate::guest::{Asid, TaskId, KERNEL_ASID};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a process instance as reported by start/end notifications
///
/// `task_id` is stable for the lifetime of the kernel task structure.
/// `asid` changes on `execve` and is shared during a `vfork`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub struct ProcessHandle {
    pub task_id: TaskId,
    pub asid: Asid,
    pub pid: i32,
    pub ppid: i32,
}

impl ProcessHandle {
    pub fn new(task_id: TaskId, asid: Asid, pid: i32, ppid: i32) -> Self {
        Self {
            task_id,
            asid,
            pid,
            ppid,
        }
    }

    /// True for contexts that run pure kernel code
    pub fn is_kernel(&self) -> bool {
        self.asid == KERNEL_ASID
    }
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task={:#x} asid={:#x} pid={} ppid={}",
            self.task_id, self.asid, self.pid, self.ppid
        )
    }
}
