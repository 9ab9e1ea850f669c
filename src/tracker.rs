//! Process lifecycle tracking from syscall and address-space switch events
//!
//! [`ProcessTracker`] owns the process table and the asid index and is fed
//! events by the execution environment:
//!
//! - [`ProcessTracker::on_syscall_enter`]
//! - [`ProcessTracker::on_syscall_return`]
//! - [`ProcessTracker::on_kill_return`]
//! - [`ProcessTracker::on_context_switch`], called *before* the switch is
//!   visible to introspection of the current context
//!
//! Handlers run to completion. A returned error is a fatal inconsistency;
//! the tracker refuses further events afterwards. Expected races are logged
//! at debug level and survivable oddities as warnings.
//!
//! The event stream is delivered in a total order that does not necessarily
//! match the guest scheduler's: a child created by `clone` can run before
//! the call returns to its parent, the return of `vfork` is observed in the
//! child's context, and `execve` swaps the address space of a task that
//! keeps its task structure. Nothing here assumes more ordering than
//! "enter before return of the same call".

use crate::asid_index::AsidIndex;
use crate::config::{TrackerConfig, VforkMode};
use crate::consistency::{self, ConsistencyChecker};
use crate::error::{Result, TrackerError};
use crate::fsm::{ProcState, ProcessEntry, VforkLink};
use crate::guest::{Asid, GuestIntrospection, TaskId, KERNEL_ASID};
use crate::handle::ProcessHandle;
use crate::stats::{SessionSummary, TrackerStats};
use crate::syscalls::Syscall;
use crate::table::ProcessTable;
use serde::{Deserialize, Serialize};

pub const SIGINT: i32 = 2;
pub const SIGKILL: i32 = 9;

/// Kind of lifecycle notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleKind {
    Start,
    End,
}

/// Notification delivered to downstream consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub kind: LifecycleKind,
    pub handle: ProcessHandle,
}

/// Entry owning the current context, as resolved by introspection
#[derive(Debug, Clone, Copy)]
struct Current {
    live: ProcessHandle,
    existed: bool,
}

impl Current {
    fn task_id(&self) -> TaskId {
        self.live.task_id
    }
}

/// Lifecycle tracker for one analysis session
#[derive(Debug)]
pub struct ProcessTracker {
    config: TrackerConfig,
    table: ProcessTable,
    asids: AsidIndex,
    checker: ConsistencyChecker,
    events: Vec<LifecycleEvent>,
    stats: TrackerStats,
    initialized: bool,
    poisoned: bool,
}

impl ProcessTracker {
    pub fn new(config: TrackerConfig) -> Self {
        let checker = ConsistencyChecker::new(config.consistency);
        Self {
            config,
            table: ProcessTable::new(),
            asids: AsidIndex::new(),
            checker,
            events: Vec::new(),
            stats: TrackerStats::default(),
            initialized: false,
            poisoned: false,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn table(&self) -> &ProcessTable {
        &self.table
    }

    pub fn asids(&self) -> &AsidIndex {
        &self.asids
    }

    pub fn entry(&self, task_id: TaskId) -> Option<&ProcessEntry> {
        self.table.get(task_id)
    }

    /// Live entry for `pid`, if any
    pub fn entry_by_pid(&self, pid: i32) -> Option<&ProcessEntry> {
        self.table.by_pid(pid).and_then(|t| self.table.get(t))
    }

    /// Entry currently holding `asid`
    pub fn entry_by_asid(&self, asid: Asid) -> Option<&ProcessEntry> {
        self.asids.get(asid).and_then(|t| self.table.get(t))
    }

    pub fn stats(&self) -> TrackerStats {
        let mut stats = self.stats.clone();
        stats.guess_matches = self.checker.matches();
        stats.guess_mismatches = self.checker.mismatches();
        stats
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Notifications issued since the last call
    pub fn take_events(&mut self) -> Vec<LifecycleEvent> {
        std::mem::take(&mut self.events)
    }

    /// Verify the structural invariants of the table and the index
    pub fn check_invariants(&self) -> Result<()> {
        consistency::verify_invariants(&self.table, &self.asids)
    }

    /// Populate the table from the guest process list at session start
    pub fn initialize(&mut self, guest: &dyn GuestIntrospection) -> Result<usize> {
        self.guarded(|t| t.populate(guest))
    }

    pub fn on_syscall_enter(&mut self, guest: &dyn GuestIntrospection, nr: i64) -> Result<()> {
        self.stats.syscall_enters += 1;
        self.guarded(|t| t.syscall_enter(guest, nr))
    }

    pub fn on_syscall_return(
        &mut self,
        guest: &dyn GuestIntrospection,
        nr: i64,
        retval: i64,
    ) -> Result<()> {
        self.stats.syscall_returns += 1;
        self.guarded(|t| t.syscall_return(guest, nr, retval))
    }

    pub fn on_kill_return(
        &mut self,
        guest: &dyn GuestIntrospection,
        pid: i32,
        sig: i32,
        retval: i64,
    ) -> Result<()> {
        self.stats.kill_returns += 1;
        self.guarded(|t| t.kill_return(guest, pid, sig, retval))
    }

    pub fn on_context_switch(
        &mut self,
        guest: &dyn GuestIntrospection,
        old_asid: Asid,
        new_asid: Asid,
    ) -> Result<()> {
        self.stats.context_switches += 1;
        self.guarded(|t| t.context_switch(guest, old_asid, new_asid))
    }

    /// End the session: issue end notifications for every instance that
    /// started and has not ended, then clear all derived state.
    pub fn teardown(&mut self) -> SessionSummary {
        let state_counts = self.table.state_counts();
        for (state, count) in &state_counts {
            tracing::info!("{:>4}: {}", state, count);
        }

        let mut flushed = 0;
        for task_id in self.table.task_ids() {
            let Some(entry) = self.table.get_mut(task_id) else {
                continue;
            };
            if entry.started() && !entry.ended() {
                entry.mark_ended();
                let handle = *entry.handle();
                tracing::debug!("END (teardown) {}", handle);
                self.stats.ends += 1;
                self.events.push(LifecycleEvent {
                    kind: LifecycleKind::End,
                    handle,
                });
                flushed += 1;
            }
        }

        let summary = SessionSummary {
            state_counts,
            flushed,
            stats: self.stats(),
        };
        tracing::info!(
            "teardown complete: {} entries, {} flushed",
            self.table.len(),
            flushed
        );

        self.table.clear();
        self.asids.clear();
        self.checker.reset();
        self.initialized = false;
        summary
    }

    fn guarded<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.poisoned {
            return Err(TrackerError::Poisoned);
        }
        let result = f(self);
        if let Err(e) = &result {
            tracing::error!("fatal: {}", e);
            self.poisoned = true;
        }
        result
    }

    // ------------------------------------------------------------------
    // Table and index helpers
    // ------------------------------------------------------------------

    fn state_of(&self, task_id: TaskId) -> Result<ProcState> {
        Ok(self.table.expect(task_id)?.state())
    }

    fn handle_of(&self, task_id: TaskId) -> Result<ProcessHandle> {
        Ok(*self.table.expect(task_id)?.handle())
    }

    fn set_state(&mut self, task_id: TaskId, state: ProcState) -> Result<()> {
        self.table.expect_mut(task_id)?.set_state(state);
        Ok(())
    }

    fn invalid(&self, task_id: TaskId, event: String) -> TrackerError {
        match self.table.get(task_id) {
            Some(entry) => TrackerError::InvalidTransition {
                state: entry.state(),
                event,
                handle: *entry.handle(),
            },
            None => TrackerError::UnknownTask(task_id),
        }
    }

    fn warn(&mut self, message: std::fmt::Arguments<'_>) {
        self.stats.warnings += 1;
        tracing::warn!("{}", message);
    }

    fn log_transition(&self, task_id: TaskId, tag: &str, what: &str) {
        if let Some(entry) = self.table.get(task_id) {
            if let Some((from, to)) = entry.transition() {
                tracing::debug!("{} {:<12} {} {} -> {}", tag, what, entry.handle(), from, to);
            }
        }
    }

    /// Insert a fresh entry and bind its asid
    fn add_entry(&mut self, handle: ProcessHandle) -> Result<TaskId> {
        self.table.insert(ProcessEntry::new(handle))?;
        if !handle.is_kernel() {
            self.asids.bind(handle.asid, handle.task_id)?;
        }
        self.stats.processes_discovered += 1;
        tracing::debug!("created {}", handle);
        Ok(handle.task_id)
    }

    /// Reset a recycled entry to a new identity and bind its asid
    fn recycle_entry(&mut self, handle: ProcessHandle) -> Result<TaskId> {
        self.table.expect_mut(handle.task_id)?.reset(handle);
        if !handle.is_kernel() {
            self.asids.bind(handle.asid, handle.task_id)?;
        }
        tracing::debug!("recycled {}", handle);
        Ok(handle.task_id)
    }

    /// Identity of `task_id` bound to `asid`, with pid/ppid from the guest
    fn materialize(
        &self,
        guest: &dyn GuestIntrospection,
        task_id: TaskId,
        asid: Asid,
    ) -> Result<ProcessHandle> {
        let stored = self.handle_of(task_id)?;
        let (pid, ppid) = guest
            .process(task_id)
            .map(|p| (p.pid, p.ppid))
            .unwrap_or((stored.pid, stored.ppid));
        Ok(ProcessHandle::new(task_id, asid, pid, ppid))
    }

    /// Drop the asid mapping of an ending process. A mapping held by
    /// another task (a former vfork partner) is left alone.
    fn release_asid(&mut self, task_id: TaskId, asid: Asid) -> Result<()> {
        if asid == KERNEL_ASID {
            return Ok(());
        }
        match self.asids.get(asid) {
            Some(holder) if holder == task_id => {
                self.asids.remove(asid);
                Ok(())
            }
            Some(holder) => {
                tracing::debug!(
                    "asid {:#x} of {:#x} is held by {:#x}, leaving mapping",
                    asid,
                    task_id,
                    holder
                );
                Ok(())
            }
            None => Err(TrackerError::AsidMappingMissing(asid)),
        }
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    fn run_start(&mut self, task_id: TaskId) -> Result<()> {
        let entry = self.table.expect_mut(task_id)?;
        if entry.started() {
            let handle = *entry.handle();
            self.warn(format_args!("on_process_start already issued for {}", handle));
            return Ok(());
        }
        entry.mark_started();
        let handle = *entry.handle();
        tracing::debug!("START {}", handle);
        self.stats.starts += 1;
        self.events.push(LifecycleEvent {
            kind: LifecycleKind::Start,
            handle,
        });
        Ok(())
    }

    fn run_end(&mut self, task_id: TaskId) -> Result<()> {
        let entry = self.table.expect_mut(task_id)?;
        let handle = *entry.handle();
        if !entry.started() {
            // Some processes are never scheduled after the session starts;
            // their first observable event is their death.
            self.warn(format_args!(
                "on_process_start not issued yet, skipping on_process_end for {}",
                handle
            ));
            return Ok(());
        }
        if entry.ended() {
            return Err(TrackerError::DuplicateEnd(handle));
        }
        entry.mark_ended();
        tracing::debug!("END {}", handle);
        self.stats.ends += 1;
        self.events.push(LifecycleEvent {
            kind: LifecycleKind::End,
            handle,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lookups and lazy discovery
    // ------------------------------------------------------------------

    /// Resolve the entry owning the current context, creating it if needed
    fn lookup_current(&mut self, guest: &dyn GuestIntrospection) -> Result<Current> {
        let live = guest.current_process().ok_or_else(|| {
            TrackerError::Introspection("no process owns the current context".to_string())
        })?;

        if let Some(entry) = self.table.get(live.task_id) {
            let stored = *entry.handle();
            if stored.asid != live.asid {
                tracing::trace!("live and stored asid differ: live {}, stored {}", live, stored);
            }
            return Ok(Current {
                live,
                existed: true,
            });
        }

        // Cold path: kernel workers and vfork children. A vfork child
        // borrows its parent's asid, so the mapping is left to the caller.
        self.table.insert(ProcessEntry::new(live))?;
        self.stats.processes_discovered += 1;
        if !live.is_kernel() {
            match self.asids.get(live.asid) {
                None => self.asids.bind(live.asid, live.task_id)?,
                Some(holder) => tracing::debug!(
                    "new task {:#x} shares asid {:#x} with {:#x}",
                    live.task_id,
                    live.asid,
                    holder
                ),
            }
        }
        tracing::debug!("created (current) {}", live);
        Ok(Current {
            live,
            existed: false,
        })
    }

    /// Find or create the child of `ppid` that a `clone` just produced
    fn add_new_by_ppid(
        &mut self,
        guest: &dyn GuestIntrospection,
        ppid: i32,
    ) -> Result<Option<TaskId>> {
        let candidates = guest.children_of(ppid);
        tracing::trace!("scanning {} children of pid {}", candidates.len(), ppid);

        for candidate in candidates {
            if let Some(holder) = self.asids.get(candidate.asid) {
                if holder != candidate.task_id {
                    // CLONE_VM child; it becomes visible once it execs
                    continue;
                }
            }
            match self.table.get(candidate.task_id).map(|e| e.state()) {
                None => return self.add_entry(candidate).map(Some),
                Some(ProcState::End) | Some(ProcState::Kern) => {
                    return self.recycle_entry(candidate).map(Some)
                }
                Some(_) => continue,
            }
        }
        tracing::debug!("no new process with ppid {}", ppid);
        Ok(None)
    }

    /// Find or create the process using an asid that has no mapping
    fn add_new_by_asid(
        &mut self,
        guest: &dyn GuestIntrospection,
        asid: Asid,
    ) -> Result<Option<TaskId>> {
        let Some(candidate) = guest.process_by_asid(asid) else {
            tracing::debug!("no process with asid {:#x}", asid);
            return Ok(None);
        };

        let existing = self
            .table
            .get(candidate.task_id)
            .map(|e| (e.state(), e.handle().asid));
        match existing {
            None => self.add_entry(candidate).map(Some),
            Some((ProcState::End, stored)) if stored == candidate.asid => {
                tracing::debug!("{:#x} is still exiting", candidate.task_id);
                Ok(Some(candidate.task_id))
            }
            Some((ProcState::End, _)) | Some((ProcState::Kern, _)) => {
                self.recycle_entry(candidate).map(Some)
            }
            Some((state, _)) => Err(TrackerError::UnexpectedAsid {
                asid,
                context: format!("live entry {} at state {}", candidate, state),
            }),
        }
    }

    /// Next task for `asid`: the mapped one, or one found by discovery
    fn next_by_asid(
        &mut self,
        guest: &dyn GuestIntrospection,
        asid: Asid,
    ) -> Result<Option<TaskId>> {
        if asid == KERNEL_ASID {
            return Ok(None);
        }
        if let Some(task_id) = self.asids.get(asid) {
            return Ok(Some(task_id));
        }
        self.discover_unknown_asid(guest, asid)
    }

    fn discover_unknown_asid(
        &mut self,
        guest: &dyn GuestIntrospection,
        asid: Asid,
    ) -> Result<Option<TaskId>> {
        tracing::debug!("unknown asid {:#x} appeared", asid);
        let Some(found) = self.add_new_by_asid(guest, asid)? else {
            tracing::debug!("switching to kernel context {:#x}", asid);
            return Ok(None);
        };

        let handle = self.handle_of(found)?;
        if self.state_of(found)? == ProcState::End {
            // Exiting processes can be preempted before their asid is cleared.
            tracing::debug!("interrupted exit of {}", handle);
            return Ok(None);
        }

        match self.table.by_pid(handle.ppid) {
            Some(parent) if self.state_of(parent)? == ProcState::Cln => {
                tracing::debug!("child {} runs before clone returns", handle);
                let entry = self.table.expect_mut(parent)?;
                entry.save_state();
                entry.set_state(ProcState::Run);
                self.log_transition(parent, "CS", "clone-child");
                self.run_start(found)?;
                Ok(Some(found))
            }
            _ => Err(TrackerError::UnexpectedAsid {
                asid,
                context: format!("discovery of {}", handle),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Vfork pairing
    // ------------------------------------------------------------------

    fn linked_child(&self, parent: TaskId) -> Result<TaskId> {
        let child = self.table.expect(parent)?.vfork_child().ok_or_else(|| {
            TrackerError::InvalidVforkLink {
                task_id: parent,
                detail: "vfork parent without a child".to_string(),
            }
        })?;
        self.check_pair(parent, child)?;
        Ok(child)
    }

    fn linked_parent(&self, child: TaskId) -> Result<TaskId> {
        let parent = self.table.expect(child)?.vfork_parent().ok_or_else(|| {
            TrackerError::InvalidVforkLink {
                task_id: child,
                detail: "vfork child without a parent".to_string(),
            }
        })?;
        self.check_pair(parent, child)?;
        Ok(parent)
    }

    fn check_pair(&self, parent: TaskId, child: TaskId) -> Result<()> {
        let p = self.table.expect(parent)?;
        let c = self.table.expect(child)?;
        if p.vfork() != Some(VforkLink::Child(child)) || c.vfork() != Some(VforkLink::Parent(parent)) {
            return Err(TrackerError::InvalidVforkLink {
                task_id: parent,
                detail: format!("{:#x} and {:#x} are not mutually linked", parent, child),
            });
        }
        if p.handle().asid != c.handle().asid {
            return Err(TrackerError::InvalidVforkLink {
                task_id: parent,
                detail: format!(
                    "pair does not share an asid ({:#x} vs {:#x})",
                    p.handle().asid,
                    c.handle().asid
                ),
            });
        }
        Ok(())
    }

    /// Clear both halves of a vfork pairing
    fn unlink_pair(&mut self, parent: TaskId, child: TaskId) -> Result<()> {
        self.check_pair(parent, child)?;
        let shared = self.handle_of(parent)?.asid;
        self.table.expect_mut(parent)?.set_vfork(None);
        self.table.expect_mut(child)?.set_vfork(None);
        self.asids.unmark_shared(shared);
        tracing::debug!("vfork pair {:#x}/{:#x} dissolved", parent, child);
        Ok(())
    }

    /// Parent resumes after its vfork child exec'd or died
    fn restore_vfork_parent(&mut self, parent: TaskId, shared: Asid) -> Result<()> {
        let entry = self.table.expect_mut(parent)?;
        if entry.state() == ProcState::Vfp {
            entry.save_state();
            entry.set_state(ProcState::Run);
            self.log_transition(parent, "VF", "parent-fix");
        }
        if self.asids.get(shared) != Some(parent) {
            self.asids.rebind(shared, parent)?;
        }
        Ok(())
    }

    /// Terminate an entry: release its asid, dissolve any vfork pairing
    /// and issue the end notification.
    fn end_process(&mut self, task_id: TaskId) -> Result<()> {
        let handle = self.handle_of(task_id)?;
        let link = self.table.expect(task_id)?.vfork();

        match link {
            Some(VforkLink::Child(child)) => {
                // The shared address space lives on in the child.
                self.unlink_pair(task_id, child)?;
                if self.state_of(child)? == ProcState::Vfc {
                    tracing::debug!("vfork child {:#x} outlived its parent", child);
                    self.set_state(child, ProcState::Init)?;
                }
            }
            Some(VforkLink::Parent(parent)) => {
                self.unlink_pair(parent, task_id)?;
                self.restore_vfork_parent(parent, handle.asid)?;
            }
            None => self.release_asid(task_id, handle.asid)?,
        }

        self.set_state(task_id, ProcState::End)?;

        let started = self.table.expect(task_id)?.started();
        if matches!(link, Some(VforkLink::Parent(_))) && !started {
            tracing::debug!("transient vfork child {} ended before exec", handle);
            return Ok(());
        }
        self.run_end(task_id)
    }

    // ------------------------------------------------------------------
    // Event handlers
    // ------------------------------------------------------------------

    fn populate(&mut self, guest: &dyn GuestIntrospection) -> Result<usize> {
        if self.initialized {
            return Err(TrackerError::AlreadyInitialized);
        }
        let mut added = 0;
        for handle in guest.processes() {
            self.table.insert(ProcessEntry::new(handle))?;
            if !handle.is_kernel() {
                if let Some(holder) = self.asids.get(handle.asid) {
                    self.warn(format_args!(
                        "asid {:#x} of {} already held by {:#x} at startup",
                        handle.asid, handle, holder
                    ));
                } else {
                    self.asids.bind(handle.asid, handle.task_id)?;
                }
            }
            added += 1;
        }
        self.stats.processes_discovered += added as u64;
        self.initialized = true;
        tracing::info!("initialized with {} processes", added);
        Ok(added)
    }

    fn syscall_enter(&mut self, guest: &dyn GuestIntrospection, nr: i64) -> Result<()> {
        let call = self.config.abi.classify(nr);
        let name = self.config.abi.display_name(nr);
        let current = self.lookup_current(guest)?;
        let task_id = current.task_id();

        let (stored, vfork_child, started) = {
            let entry = self.table.expect(task_id)?;
            (entry.state(), entry.vfork_child(), entry.started())
        };
        self.checker.check(task_id, stored, vfork_child)?;
        self.table.expect_mut(task_id)?.save_state();

        // Leave the transient states that any syscall concludes.
        let state = match stored {
            ProcState::Init => ProcState::Run,
            ProcState::Kill => {
                tracing::debug!("{:#x} survived kill", task_id);
                let entry = self.table.expect(task_id)?;
                if entry.vfork_parent().is_some() {
                    ProcState::Vfc
                } else if entry.vfork_child().is_some() {
                    ProcState::Vfp
                } else {
                    ProcState::Run
                }
            }
            other => other,
        };
        self.set_state(task_id, state)?;
        if state == ProcState::Run && !started {
            self.run_start(task_id)?;
        }

        match state {
            ProcState::Run => {
                if call.is_clone_like() {
                    self.set_state(task_id, ProcState::Cln)?;
                } else if call == Syscall::Execve {
                    self.set_state(task_id, ProcState::Exe)?;
                } else if call.is_exit() {
                    self.end_process(task_id)?;
                }
            }
            ProcState::Vfp => self.enter_vfork_parent(task_id, call, &name)?,
            ProcState::Vfc => self.enter_vfork_child(task_id, call, &name)?,
            ProcState::Exe => match call {
                Syscall::Execve => {
                    if let Some(parent) = self.table.expect(task_id)?.vfork_parent() {
                        let parent_state = self.state_of(parent)?;
                        if !matches!(parent_state, ProcState::Vfp | ProcState::Kill) {
                            return Err(TrackerError::InvalidVforkLink {
                                task_id,
                                detail: format!("execve retry with parent at state {}", parent_state),
                            });
                        }
                    }
                    tracing::debug!("execve retry by {:#x}", task_id);
                }
                c if c.is_exit() => self.end_process(task_id)?,
                _ => return Err(self.invalid(task_id, format!("enter {}", name))),
            },
            ProcState::Init
            | ProcState::Cln
            | ProcState::Kill
            | ProcState::End
            | ProcState::Kern => return Err(self.invalid(task_id, format!("enter {}", name))),
        }

        self.log_transition(task_id, "SYSE", &name);
        Ok(())
    }

    fn enter_vfork_parent(&mut self, parent: TaskId, call: Syscall, name: &str) -> Result<()> {
        let child = self.linked_child(parent)?;
        if call.is_wait() {
            // Blocked until the child execs or exits.
            return Ok(());
        }

        let child_state = self.state_of(child)?;
        if !matches!(child_state, ProcState::Run | ProcState::Exe | ProcState::Kill) {
            return Err(self.invalid(
                parent,
                format!("enter {} while vfork child is at {}", name, child_state),
            ));
        }

        if call.is_exit() {
            return self.end_process(parent);
        }

        let shared = self.handle_of(parent)?.asid;
        self.unlink_pair(parent, child)?;
        self.set_state(parent, ProcState::Run)?;
        self.asids.rebind(shared, parent)
    }

    fn enter_vfork_child(&mut self, child: TaskId, call: Syscall, name: &str) -> Result<()> {
        self.linked_parent(child)?;
        match call {
            Syscall::Dup2 | Syscall::Close => Ok(()),
            Syscall::Execve => self.set_state(child, ProcState::Exe),
            c if c.is_exit() => self.end_process(child),
            _ => {
                let handle = self.handle_of(child)?;
                self.warn(format_args!(
                    "unexpected syscall {} for vfork child {}",
                    name, handle
                ));
                Ok(())
            }
        }
    }

    fn syscall_return(
        &mut self,
        guest: &dyn GuestIntrospection,
        nr: i64,
        retval: i64,
    ) -> Result<()> {
        let call = self.config.abi.classify(nr);
        let name = self.config.abi.display_name(nr);
        let current = self.lookup_current(guest)?;
        let task_id = current.task_id();
        let state = self.state_of(task_id)?;
        self.table.expect_mut(task_id)?.save_state();

        match (state, call) {
            (ProcState::Cln, _) => self.clone_return(guest, task_id, call, retval)?,
            // The child may already exist in INIT when it was preempted in
            // the kernel before its return was delivered.
            (ProcState::Init, Syscall::Vfork) => {
                if !self.has_vfork_parent(current) {
                    return Err(self.invalid(task_id, format!("return {}", name)));
                }
                self.vfork_return(current)?
            }
            (ProcState::End, Syscall::Vfork) if current.existed => self.vfork_return(current)?,
            (ProcState::Init, _) if current.existed => {
                tracing::debug!("{} returned before its first observed enter", name);
            }
            (ProcState::Init, _) | (ProcState::End, _) => {
                return Err(self.invalid(task_id, format!("return {}", name)));
            }
            (ProcState::Exe, Syscall::Execve) if retval < 0 => {
                let resumed = if self.table.expect(task_id)?.vfork_parent().is_some() {
                    ProcState::Vfc
                } else {
                    ProcState::Run
                };
                tracing::debug!("execve failed with {} for {:#x}", retval, task_id);
                self.set_state(task_id, resumed)?;
            }
            _ => {}
        }

        self.log_transition(task_id, "SYSR", &name);
        Ok(())
    }

    fn clone_return(
        &mut self,
        guest: &dyn GuestIntrospection,
        parent: TaskId,
        call: Syscall,
        retval: i64,
    ) -> Result<()> {
        if retval < 0 && call.is_clone_like() {
            tracing::debug!("clone failed with {}", retval);
            return self.set_state(parent, ProcState::Run);
        }

        let pid = self.handle_of(parent)?.pid;
        if let Some(child) = self.add_new_by_ppid(guest, pid)? {
            tracing::debug!("clone child {:#x} discovered at return", child);
            return self.set_state(parent, ProcState::Run);
        }

        match i32::try_from(retval) {
            Ok(child_pid) if child_pid > 0 => {
                if self.table.by_pid(child_pid).is_some() {
                    tracing::debug!("clone child pid {} already known", child_pid);
                    return self.set_state(parent, ProcState::Run);
                }
                if !guest.processes().iter().any(|p| p.pid == child_pid) {
                    tracing::debug!("clone created thread {}, no new process", child_pid);
                    return self.set_state(parent, ProcState::Run);
                }
            }
            Ok(_) => {}
            Err(_) => tracing::debug!("clone returned out-of-range pid {}", retval),
        }

        tracing::debug!("clone child of pid {} not discoverable yet", pid);
        Ok(())
    }

    /// Whether the live asid of `current` is held by another task in RUN
    fn has_vfork_parent(&self, current: Current) -> bool {
        match self.asids.get(current.live.asid) {
            Some(holder) if holder != current.task_id() => {
                matches!(self.state_of(holder), Ok(ProcState::Run))
            }
            _ => false,
        }
    }

    /// The return of `vfork` is observed in the child's context. Parent
    /// and child share the parent's asid until the child execs or exits.
    fn vfork_return(&mut self, current: Current) -> Result<()> {
        let child = current.task_id();
        if current.existed {
            // recycled task structure
            self.table.expect_mut(child)?.reset(current.live);
        }

        let shared = current.live.asid;
        let parent = self
            .asids
            .get(shared)
            .ok_or(TrackerError::AsidMappingMissing(shared))?;
        if parent == child {
            return Err(TrackerError::InvalidVforkLink {
                task_id: child,
                detail: "vfork child already holds the shared asid".to_string(),
            });
        }

        let parent_entry = self.table.expect(parent)?;
        if parent_entry.handle().asid != shared {
            return Err(TrackerError::InvalidVforkLink {
                task_id: parent,
                detail: format!(
                    "parent asid {:#x} differs from shared asid {:#x}",
                    parent_entry.handle().asid,
                    shared
                ),
            });
        }
        if parent_entry.vfork().is_some() {
            return Err(TrackerError::InvalidVforkLink {
                task_id: parent,
                detail: "parent is already part of a vfork pair".to_string(),
            });
        }
        if parent_entry.state() != ProcState::Run {
            return Err(self.invalid(parent, "return vfork (parent)".to_string()));
        }

        self.asids.rebind(shared, child)?;
        self.asids.mark_shared(shared);

        let child_entry = self.table.expect_mut(child)?;
        child_entry.set_state(ProcState::Vfc);
        child_entry.set_vfork(Some(VforkLink::Parent(parent)));

        let parent_entry = self.table.expect_mut(parent)?;
        parent_entry.save_state();
        parent_entry.set_state(ProcState::Vfp);
        parent_entry.set_vfork(Some(VforkLink::Child(child)));
        self.log_transition(parent, "SYSR", "vfork");

        if self.config.vfork_mode == VforkMode::Transient {
            self.run_start(child)?;
        }
        Ok(())
    }

    fn kill_return(
        &mut self,
        guest: &dyn GuestIntrospection,
        pid: i32,
        sig: i32,
        retval: i64,
    ) -> Result<()> {
        if retval != 0 || !(sig == SIGKILL || sig == SIGINT) {
            return Ok(());
        }
        if pid <= 0 {
            self.warn(format_args!(
                "kill -{} {}: process group targets are not tracked",
                sig, pid
            ));
            return Ok(());
        }

        let current = self.lookup_current(guest)?;
        if !current.existed {
            self.warn(format_args!("kill from previously unknown process {}", current.live));
        }

        let Some(target) = self.table.by_pid(pid) else {
            self.warn(format_args!("kill -{} {}: no live process with that pid", sig, pid));
            return Ok(());
        };

        let entry = self.table.expect_mut(target)?;
        entry.save_state();
        entry.set_state(ProcState::Kill);
        self.log_transition(target, "KILL", &format!("-{} {}", sig, pid));
        Ok(())
    }

    fn context_switch(
        &mut self,
        guest: &dyn GuestIntrospection,
        old_asid: Asid,
        new_asid: Asid,
    ) -> Result<()> {
        let current = self.lookup_current(guest)?;
        let task_id = current.task_id();
        let (handle, state) = {
            let entry = self.table.expect(task_id)?;
            (*entry.handle(), entry.state())
        };
        tracing::trace!(
            "CS {:#x} -> {:#x} from {} at {}",
            old_asid,
            new_asid,
            handle,
            state
        );

        let consistent = handle.asid == old_asid
            || handle.is_kernel()
            || state == ProcState::End
            || (state == ProcState::Init && !current.existed);
        if !consistent {
            return Err(TrackerError::ContextMismatch {
                old_asid,
                new_asid,
                handle,
                state,
            });
        }

        self.table.expect_mut(task_id)?.save_state();

        let ran_unseen = (state == ProcState::Init && current.existed) || state == ProcState::Run;
        if ran_unseen && handle.asid == old_asid && !self.table.expect(task_id)?.started() {
            self.warn(format_args!("late start for {}, first syscall was missed", handle));
            self.run_start(task_id)?;
            self.set_state(task_id, ProcState::Run)?;
        }

        let next = match state {
            ProcState::Cln => self.switch_from_clone(guest, task_id, old_asid, new_asid)?,
            ProcState::Exe => self.switch_from_exec(guest, current, old_asid, new_asid)?,
            ProcState::End => self.switch_from_ended(current, handle, old_asid, new_asid)?,
            ProcState::Kill => {
                self.end_process(task_id)?;
                match self.asids.get(new_asid) {
                    Some(next) => Some(next),
                    None => {
                        tracing::debug!("unknown code {:#x} after kill", new_asid);
                        None
                    }
                }
            }
            ProcState::Kern if !current.live.is_kernel() && current.live.asid == new_asid => {
                tracing::debug!("kernel worker to process {}", current.live);
                self.recycle_entry(current.live)?;
                Some(task_id)
            }
            ProcState::Kern
            | ProcState::Init
            | ProcState::Run
            | ProcState::Vfp
            | ProcState::Vfc => self.next_by_asid(guest, new_asid)?,
        };
        self.log_transition(task_id, "CS", "switch");

        match next {
            Some(next) => tracing::trace!("coming up next: {:#x}", next),
            None => tracing::trace!("coming up next: ?"),
        }
        self.checker.expect_next(next);
        Ok(())
    }

    fn switch_from_clone(
        &mut self,
        guest: &dyn GuestIntrospection,
        parent: TaskId,
        old_asid: Asid,
        new_asid: Asid,
    ) -> Result<Option<TaskId>> {
        if new_asid == old_asid {
            return Ok(Some(parent));
        }

        let pid = self.handle_of(parent)?.pid;
        if let Some(child) = self.add_new_by_ppid(guest, pid)? {
            self.set_state(parent, ProcState::Run)?;
            self.run_start(child)?;
            if self.handle_of(child)?.asid == new_asid {
                return Ok(Some(child));
            }
        }
        self.next_by_asid(guest, new_asid)
    }

    fn switch_from_exec(
        &mut self,
        guest: &dyn GuestIntrospection,
        current: Current,
        old_asid: Asid,
        new_asid: Asid,
    ) -> Result<Option<TaskId>> {
        let task_id = current.task_id();
        if current.live.asid != new_asid {
            // exec still in progress; someone else is scheduled
            return match self.next_by_asid(guest, new_asid)? {
                Some(next) => {
                    let other = self.handle_of(next)?;
                    let this = self.handle_of(task_id)?;
                    if self.state_of(next)? == ProcState::End || other.pid == this.pid {
                        return Err(TrackerError::UnexpectedAsid {
                            asid: new_asid,
                            context: format!("execve of {}", this),
                        });
                    }
                    Ok(Some(next))
                }
                None => Ok(None),
            };
        }

        if let Some(parent) = self.table.expect(task_id)?.vfork_parent() {
            self.finish_vfork_exec(guest, task_id, parent, old_asid, new_asid)?;
        } else {
            self.finish_plain_exec(guest, task_id, new_asid)?;
        }
        Ok(Some(task_id))
    }

    /// Child of a vfork+execve sequence now owns an address space
    fn finish_vfork_exec(
        &mut self,
        guest: &dyn GuestIntrospection,
        child: TaskId,
        parent: TaskId,
        shared: Asid,
        new_asid: Asid,
    ) -> Result<()> {
        self.unlink_pair(parent, child)?;
        self.restore_vfork_parent(parent, shared)?;

        if self.config.vfork_mode == VforkMode::Transient {
            self.run_end(child)?;
        }

        let fresh = self.materialize(guest, child, new_asid)?;
        let parent_pid = self.handle_of(parent)?.pid;
        if fresh.ppid != parent_pid {
            return Err(TrackerError::InvalidVforkLink {
                task_id: child,
                detail: format!("child ppid {} is not parent pid {}", fresh.ppid, parent_pid),
            });
        }

        self.table.expect_mut(child)?.reset(fresh);
        self.asids.bind(new_asid, child)?;
        self.run_start(child)
    }

    /// Plain execve: same task, new identity
    fn finish_plain_exec(
        &mut self,
        guest: &dyn GuestIntrospection,
        task_id: TaskId,
        new_asid: Asid,
    ) -> Result<()> {
        let old = self.handle_of(task_id)?;
        self.release_asid(task_id, old.asid)?;
        if self.table.expect(task_id)?.started() {
            self.run_end(task_id)?;
        } else {
            tracing::debug!("{} exec'd before its start was observed", old);
        }

        let fresh = self.materialize(guest, task_id, new_asid)?;
        if fresh.pid != old.pid {
            return Err(TrackerError::IdentityDrift {
                previous: old,
                current: fresh,
            });
        }
        if fresh.ppid != old.ppid {
            self.warn(format_args!("{} was reparented during execve", fresh));
        }

        self.table.expect_mut(task_id)?.reset(fresh);
        self.asids.bind(new_asid, task_id)?;
        self.run_start(task_id)
    }

    fn switch_from_ended(
        &mut self,
        current: Current,
        stored: ProcessHandle,
        old_asid: Asid,
        new_asid: Asid,
    ) -> Result<Option<TaskId>> {
        let live = current.live;
        if live.is_kernel() || live.asid == old_asid {
            // The kernel often takes a turn after an exiting process.
            if let Some(next) = self.asids.get(new_asid) {
                return Ok(Some(next));
            }
            tracing::debug!("exiting process {} to unknown {:#x}", stored, new_asid);
            return Ok(None);
        }

        if live.asid == new_asid {
            // A kernel helper task turning into a user process. The start
            // notification waits for its first syscall.
            tracing::debug!("kernel worker to process {}", live);
            self.recycle_entry(live)?;
            return Ok(Some(live.task_id));
        }

        Err(TrackerError::UnexpectedAsid {
            asid: live.asid,
            context: format!("terminating process {}", stored),
        })
    }
}
