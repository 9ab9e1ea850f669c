//! Process table: durable per-task state

use crate::error::{Result, TrackerError};
use crate::fsm::{ProcState, ProcessEntry};
use crate::guest::TaskId;
use std::collections::BTreeMap;

/// All entries observed during a session, keyed by task
///
/// Entries are never removed while the session is live; a recycled task
/// structure resets its existing entry instead.
#[derive(Debug, Default)]
pub struct ProcessTable {
    entries: BTreeMap<TaskId, ProcessEntry>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new entry. The task must not be present yet.
    pub fn insert(&mut self, entry: ProcessEntry) -> Result<()> {
        let task_id = entry.task_id();
        if self.entries.contains_key(&task_id) {
            return Err(TrackerError::DuplicateTask(task_id));
        }
        self.entries.insert(task_id, entry);
        Ok(())
    }

    pub fn get(&self, task_id: TaskId) -> Option<&ProcessEntry> {
        self.entries.get(&task_id)
    }

    pub fn get_mut(&mut self, task_id: TaskId) -> Option<&mut ProcessEntry> {
        self.entries.get_mut(&task_id)
    }

    /// Like [`Self::get`], for callers that require the entry to exist
    pub fn expect(&self, task_id: TaskId) -> Result<&ProcessEntry> {
        self.get(task_id).ok_or(TrackerError::UnknownTask(task_id))
    }

    /// Like [`Self::get_mut`], for callers that require the entry to exist
    pub fn expect_mut(&mut self, task_id: TaskId) -> Result<&mut ProcessEntry> {
        self.get_mut(task_id).ok_or(TrackerError::UnknownTask(task_id))
    }

    /// Live entry with the given pid. Ended entries are skipped since
    /// pids are recycled by the guest.
    pub fn by_pid(&self, pid: i32) -> Option<TaskId> {
        self.entries
            .values()
            .find(|e| e.handle().pid == pid && e.state().is_live())
            .map(|e| e.task_id())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessEntry> {
        self.entries.values()
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of entries per FSM state
    pub fn state_counts(&self) -> BTreeMap<ProcState, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.entries.values() {
            *counts.entry(entry.state()).or_insert(0) += 1;
        }
        counts
    }
}
