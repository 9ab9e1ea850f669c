// Shared harness for lifecycle integration tests
//
// Drives a ProcessTracker against a GuestModel, collects every
// notification, and checks the structural invariants after each event.

#![allow(dead_code)]

use lifetrace::config::TrackerConfig;
use lifetrace::error::TrackerError;
use lifetrace::guest::{Asid, GuestModel, TaskId};
use lifetrace::handle::ProcessHandle;
use lifetrace::stats::SessionSummary;
use lifetrace::syscalls::SyscallAbi;
use lifetrace::tracker::{LifecycleEvent, LifecycleKind, ProcessTracker};

pub struct Harness {
    pub guest: GuestModel,
    pub tracker: ProcessTracker,
    pub events: Vec<LifecycleEvent>,
    abi: SyscallAbi,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(TrackerConfig::default())
    }

    pub fn with_config(config: TrackerConfig) -> Self {
        let abi = config.abi;
        Self {
            guest: GuestModel::new(),
            tracker: ProcessTracker::new(config),
            events: Vec::new(),
            abi,
        }
    }

    pub fn nr(&self, name: &str) -> i64 {
        self.abi
            .number(name)
            .unwrap_or_else(|| panic!("no syscall named {}", name))
    }

    pub fn spawn(&mut self, task_id: TaskId, asid: Asid, pid: i32, ppid: i32) {
        self.guest
            .spawn(ProcessHandle::new(task_id, asid, pid, ppid))
            .unwrap();
    }

    pub fn boot(&mut self) -> usize {
        let n = self.tracker.initialize(&self.guest).unwrap();
        self.settle();
        n
    }

    pub fn schedule(&mut self, task_id: TaskId) {
        self.guest.schedule(task_id).unwrap();
    }

    pub fn set_asid(&mut self, task_id: TaskId, asid: Asid) {
        self.guest.update(task_id, Some(asid), None, None).unwrap();
    }

    pub fn try_enter(&mut self, name: &str) -> Result<(), TrackerError> {
        let nr = self.nr(name);
        let result = self.tracker.on_syscall_enter(&self.guest, nr);
        self.settle();
        result
    }

    pub fn enter(&mut self, name: &str) {
        self.try_enter(name)
            .unwrap_or_else(|e| panic!("enter {} failed: {}", name, e));
    }

    pub fn try_ret(&mut self, name: &str, retval: i64) -> Result<(), TrackerError> {
        let nr = self.nr(name);
        let result = self.tracker.on_syscall_return(&self.guest, nr, retval);
        self.settle();
        result
    }

    pub fn ret(&mut self, name: &str, retval: i64) {
        self.try_ret(name, retval)
            .unwrap_or_else(|e| panic!("return {} failed: {}", name, e));
    }

    pub fn kill(&mut self, pid: i32, sig: i32, retval: i64) {
        self.tracker
            .on_kill_return(&self.guest, pid, sig, retval)
            .unwrap();
        self.settle();
    }

    pub fn try_switch(
        &mut self,
        old: Asid,
        new: Asid,
        next: Option<TaskId>,
    ) -> Result<(), TrackerError> {
        let result = self.tracker.on_context_switch(&self.guest, old, new);
        self.settle();
        if let Some(task_id) = next {
            self.schedule(task_id);
        }
        result
    }

    /// Context switch, then make `next` the current task
    pub fn switch(&mut self, old: Asid, new: Asid, next: Option<TaskId>) {
        self.try_switch(old, new, next)
            .unwrap_or_else(|e| panic!("switch {:#x} -> {:#x} failed: {}", old, new, e));
    }

    fn settle(&mut self) {
        self.events.extend(self.tracker.take_events());
        if !self.tracker.is_poisoned() {
            self.tracker.check_invariants().unwrap();
        }
    }

    pub fn teardown(&mut self) -> SessionSummary {
        let summary = self.tracker.teardown();
        self.events.extend(self.tracker.take_events());
        summary
    }

    pub fn drain(&mut self) -> Vec<LifecycleEvent> {
        std::mem::take(&mut self.events)
    }

    /// Notifications so far as (kind, pid, asid)
    pub fn trail(&self) -> Vec<(LifecycleKind, i32, Asid)> {
        self.events
            .iter()
            .map(|e| (e.kind, e.handle.pid, e.handle.asid))
            .collect()
    }

    pub fn count(&self, kind: LifecycleKind, pid: i32) -> usize {
        self.events
            .iter()
            .filter(|e| e.kind == kind && e.handle.pid == pid)
            .count()
    }
}
