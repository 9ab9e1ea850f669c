//! Guest introspection collaborator
//!
//! The tracker never reads guest memory itself. It asks a
//! [`GuestIntrospection`] implementation which task owns the current
//! execution context and what the guest's process list looks like.
//! [`GuestModel`] is an in-memory implementation driven by recorded traces
//! (see [`crate::replay`]) and by tests.

use crate::handle::ProcessHandle;
use std::collections::BTreeMap;

/// Opaque identifier of a kernel task structure
pub type TaskId = u64;

/// Address-space identifier
pub type Asid = u64;

/// Asid of contexts that are not bound to a user process
pub const KERNEL_ASID: Asid = 0;

/// Introspection services offered by the execution environment
///
/// Implementations report processes at thread-group granularity: a thread
/// resolves to its group leader's task.
pub trait GuestIntrospection {
    /// Process owning the currently scheduled context
    fn current_process(&self) -> Option<ProcessHandle>;

    /// Snapshot of the guest process list
    fn processes(&self) -> Vec<ProcessHandle>;

    /// Live view of a single task
    fn process(&self, task_id: TaskId) -> Option<ProcessHandle> {
        self.processes().into_iter().find(|p| p.task_id == task_id)
    }

    /// First user process using `asid`
    fn process_by_asid(&self, asid: Asid) -> Option<ProcessHandle> {
        if asid == KERNEL_ASID {
            return None;
        }
        self.processes().into_iter().find(|p| p.asid == asid)
    }

    /// User processes whose parent is `ppid`
    fn children_of(&self, ppid: i32) -> Vec<ProcessHandle> {
        self.processes()
            .into_iter()
            .filter(|p| !p.is_kernel() && p.ppid == ppid)
            .collect()
    }
}

/// In-memory guest process list with a current-task cursor
#[derive(Debug, Default, Clone)]
pub struct GuestModel {
    tasks: BTreeMap<TaskId, ProcessHandle>,
    current: Option<TaskId>,
}

impl GuestModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task to the process list. Fails if the task already exists.
    pub fn spawn(&mut self, handle: ProcessHandle) -> Result<(), String> {
        if self.tasks.contains_key(&handle.task_id) {
            return Err(format!("task {:#x} already exists", handle.task_id));
        }
        self.tasks.insert(handle.task_id, handle);
        Ok(())
    }

    /// Change fields of an existing task
    pub fn update(
        &mut self,
        task_id: TaskId,
        asid: Option<Asid>,
        pid: Option<i32>,
        ppid: Option<i32>,
    ) -> Result<(), String> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| format!("task {:#x} does not exist", task_id))?;
        if let Some(asid) = asid {
            task.asid = asid;
        }
        if let Some(pid) = pid {
            task.pid = pid;
        }
        if let Some(ppid) = ppid {
            task.ppid = ppid;
        }
        Ok(())
    }

    /// Remove a task from the process list
    pub fn reap(&mut self, task_id: TaskId) -> Result<ProcessHandle, String> {
        if self.current == Some(task_id) {
            self.current = None;
        }
        self.tasks
            .remove(&task_id)
            .ok_or_else(|| format!("task {:#x} does not exist", task_id))
    }

    /// Make `task_id` the task owning the current context
    pub fn schedule(&mut self, task_id: TaskId) -> Result<(), String> {
        if !self.tasks.contains_key(&task_id) {
            return Err(format!("cannot schedule unknown task {:#x}", task_id));
        }
        self.current = Some(task_id);
        Ok(())
    }

    pub fn current_task(&self) -> Option<TaskId> {
        self.current
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl GuestIntrospection for GuestModel {
    fn current_process(&self) -> Option<ProcessHandle> {
        self.current.and_then(|t| self.tasks.get(&t).copied())
    }

    fn processes(&self) -> Vec<ProcessHandle> {
        self.tasks.values().copied().collect()
    }

    fn process(&self, task_id: TaskId) -> Option<ProcessHandle> {
        self.tasks.get(&task_id).copied()
    }
}
