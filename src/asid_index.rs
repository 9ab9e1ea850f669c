//! Asid index: which task currently holds each address space
//!
//! The mapping is rebound at every identity-changing transition. During a
//! vfork the parent and child share one asid; the index then points at the
//! child and records the asid as shared until the pair dissolves.

use crate::error::{Result, TrackerError};
use crate::guest::{Asid, TaskId};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default)]
pub struct AsidIndex {
    map: BTreeMap<Asid, TaskId>,
    shared: BTreeSet<Asid>,
}

impl AsidIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, asid: Asid) -> Option<TaskId> {
        self.map.get(&asid).copied()
    }

    /// Add a mapping; the asid must be unmapped
    pub fn bind(&mut self, asid: Asid, task_id: TaskId) -> Result<()> {
        if let Some(&existing) = self.map.get(&asid) {
            tracing::error!(
                "asid {:#x} already maps to {:#x}, cannot bind {:#x}",
                asid,
                existing,
                task_id
            );
            return Err(TrackerError::AsidCollision {
                asid,
                existing,
                requested: task_id,
            });
        }
        tracing::debug!("bound asid {:#x} -> {:#x}", asid, task_id);
        self.map.insert(asid, task_id);
        Ok(())
    }

    /// Point an existing mapping at another task
    pub fn rebind(&mut self, asid: Asid, task_id: TaskId) -> Result<()> {
        match self.map.get_mut(&asid) {
            None => Err(TrackerError::AsidMappingMissing(asid)),
            Some(current) if *current == task_id => {
                Err(TrackerError::AsidRebindSame { asid, task_id })
            }
            Some(current) => {
                tracing::debug!("rebound asid {:#x}: {:#x} -> {:#x}", asid, current, task_id);
                *current = task_id;
                Ok(())
            }
        }
    }

    /// Drop a mapping, returning the task it pointed to
    pub fn remove(&mut self, asid: Asid) -> Option<TaskId> {
        self.shared.remove(&asid);
        self.map.remove(&asid)
    }

    pub fn mark_shared(&mut self, asid: Asid) {
        self.shared.insert(asid);
    }

    pub fn unmark_shared(&mut self, asid: Asid) {
        self.shared.remove(&asid);
    }

    pub fn is_shared(&self, asid: Asid) -> bool {
        self.shared.contains(&asid)
    }

    pub fn shared_count(&self) -> usize {
        self.shared.len()
    }

    /// No task is the holder of more than one asid
    pub fn is_injective(&self) -> bool {
        let holders: BTreeSet<TaskId> = self.map.values().copied().collect();
        holders.len() == self.map.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Asid, TaskId)> + '_ {
        self.map.iter().map(|(&a, &t)| (a, t))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.shared.clear();
    }
}
