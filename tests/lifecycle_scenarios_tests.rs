//! Integration tests for process lifecycle reconstruction
//!
//! Each test drives the tracker through a guest scenario and checks the
//! notifications issued and the resulting table/index state.

mod utils;

use lifetrace::config::{ConsistencyMode, TrackerConfig, VforkMode};
use lifetrace::error::TrackerError;
use lifetrace::fsm::ProcState;
use lifetrace::syscalls::SyscallAbi;
use lifetrace::tracker::LifecycleKind::{End, Start};
use lifetrace::tracker::{SIGINT, SIGKILL};
use utils::Harness;

const P: u64 = 0x10;
const Q: u64 = 0x20;
const C: u64 = 0x30;
const K: u64 = 0x5;

/// P (pid 100) running and started; Q (pid 200) known but idle
fn parent_running(config: TrackerConfig) -> Harness {
    let mut h = Harness::with_config(config);
    h.spawn(P, 0x1000, 100, 1);
    h.spawn(Q, 0x2000, 200, 1);
    assert_eq!(h.boot(), 2);
    h.schedule(P);
    h.enter("write");
    assert_eq!(h.trail(), vec![(Start, 100, 0x1000)]);
    h.drain();
    h
}

fn state(h: &Harness, task_id: u64) -> ProcState {
    h.tracker.entry(task_id).unwrap().state()
}

// ----------------------------------------------------------------------
// clone
// ----------------------------------------------------------------------

#[test]
fn test_clone_child_runs_before_parent_return() {
    let mut h = parent_running(TrackerConfig::default());
    h.enter("clone");
    assert_eq!(state(&h, P), ProcState::Cln);

    h.spawn(C, 0x3000, 101, 100);
    h.switch(0x1000, 0x3000, Some(C));
    assert_eq!(h.trail(), vec![(Start, 101, 0x3000)]);
    assert_eq!(state(&h, P), ProcState::Run);

    h.enter("write");
    h.switch(0x3000, 0x1000, Some(P));
    h.ret("clone", 101);

    assert_eq!(h.tracker.table().len(), 3);
    assert_eq!(h.count(Start, 101), 1);
    assert_eq!(state(&h, P), ProcState::Run);
    assert_eq!(state(&h, C), ProcState::Run);
    assert_eq!(h.tracker.asids().get(0x3000), Some(C));
}

#[test]
fn test_clone_child_discovered_from_kernel_context() {
    let mut h = Harness::new();
    h.spawn(K, 0, 50, 2);
    h.spawn(P, 0x1000, 100, 1);
    h.boot();
    assert_eq!(state(&h, K), ProcState::Kern);

    h.schedule(P);
    h.enter("write");
    h.enter("clone");
    h.switch(0x1000, 0, Some(K));
    assert_eq!(state(&h, P), ProcState::Cln);

    // the child appears while a kernel worker runs
    h.spawn(C, 0x3000, 101, 100);
    h.switch(0, 0x3000, Some(C));
    assert_eq!(state(&h, P), ProcState::Run);
    assert_eq!(h.count(Start, 101), 1);

    h.enter("write");
    h.switch(0x3000, 0x1000, Some(P));
    h.ret("clone", 101);
    assert_eq!(h.count(Start, 101), 1);
    assert_eq!(h.tracker.table().len(), 3);
}

#[test]
fn test_clone_return_then_child_first_syscall() {
    let mut h = parent_running(TrackerConfig::default());
    h.enter("fork");
    h.spawn(C, 0x3000, 101, 100);
    h.ret("fork", 101);
    assert_eq!(state(&h, C), ProcState::Init);
    assert!(h.trail().is_empty());

    h.switch(0x1000, 0x3000, Some(C));
    h.enter("brk");
    assert_eq!(h.trail(), vec![(Start, 101, 0x3000)]);
    assert_eq!(state(&h, C), ProcState::Run);
}

#[test]
fn test_thread_creation_does_not_create_entry() {
    let mut h = parent_running(TrackerConfig::default());
    h.enter("clone");
    h.ret("clone", 4242);
    assert_eq!(state(&h, P), ProcState::Run);
    assert_eq!(h.tracker.table().len(), 2);
    h.enter("write");
}

#[test]
fn test_clone_return_out_of_range_pid_is_not_a_child() {
    let mut h = parent_running(TrackerConfig::default());
    h.enter("clone");
    // the low 32 bits alias Q's pid
    h.ret("clone", (1i64 << 32) + 200);
    assert_eq!(state(&h, P), ProcState::Cln);
    assert_eq!(h.tracker.entry_by_pid(200).unwrap().task_id(), Q);
    assert_eq!(h.tracker.table().len(), 2);
}

// ----------------------------------------------------------------------
// vfork
// ----------------------------------------------------------------------

/// P vforks child C sharing asid 0x1000; returns with C current
fn vforked(config: TrackerConfig) -> Harness {
    let mut h = parent_running(config);
    h.enter("vfork");
    h.spawn(C, 0x1000, 101, 100);
    h.schedule(C);
    h.ret("vfork", 0);
    assert_eq!(state(&h, P), ProcState::Vfp);
    assert_eq!(state(&h, C), ProcState::Vfc);
    assert_eq!(h.tracker.asids().get(0x1000), Some(C));
    assert!(h.tracker.asids().is_shared(0x1000));
    h
}

fn vfork_exec(h: &mut Harness) {
    h.enter("dup2");
    h.enter("close");
    h.enter("execve");
    assert_eq!(state(h, C), ProcState::Exe);
    h.set_asid(C, 0x3000);
    h.switch(0x1000, 0x3000, Some(C));
}

#[test]
fn test_vfork_then_execve() {
    let mut h = vforked(TrackerConfig::default());
    vfork_exec(&mut h);

    assert_eq!(h.trail(), vec![(Start, 101, 0x3000)]);
    assert_eq!(state(&h, P), ProcState::Run);
    assert_eq!(h.tracker.asids().get(0x1000), Some(P));
    assert_eq!(h.tracker.asids().get(0x3000), Some(C));
    assert_eq!(h.tracker.asids().shared_count(), 0);

    let child = h.tracker.entry(C).unwrap();
    assert_eq!(child.handle().asid, 0x3000);
    assert_eq!(child.handle().pid, 101);
    assert_eq!(child.handle().ppid, 100);
    assert_eq!(child.prev_handle().unwrap().asid, 0x1000);
    assert_eq!(child.vfork(), None);
    assert_eq!(h.tracker.entry(P).unwrap().vfork(), None);

    h.enter("write");
    h.switch(0x3000, 0x1000, Some(P));
    h.enter("wait4");
    assert_eq!(h.count(Start, 101), 1);
    assert_eq!(h.count(Start, 100), 0);
    assert_eq!(h.count(End, 100), 0);
}

#[test]
fn test_vfork_guesses_hold_under_strict_checking() {
    let config = TrackerConfig {
        consistency: ConsistencyMode::Strict,
        ..TrackerConfig::default()
    };
    let mut h = vforked(config);
    vfork_exec(&mut h);
    h.enter("write");
    h.switch(0x3000, 0x1000, Some(P));
    h.enter("wait4");
    assert_eq!(h.tracker.stats().guess_mismatches, 0);
}

#[test]
fn test_vfork_transient_mode_reports_two_pairs() {
    let config = TrackerConfig {
        vfork_mode: VforkMode::Transient,
        ..TrackerConfig::default()
    };
    let mut h = vforked(config);
    assert_eq!(h.trail(), vec![(Start, 101, 0x1000)]);

    vfork_exec(&mut h);
    h.teardown();
    assert_eq!(
        h.trail(),
        vec![
            (Start, 101, 0x1000),
            (End, 101, 0x1000),
            (Start, 101, 0x3000),
            (End, 100, 0x1000),
            (End, 101, 0x3000),
        ]
    );
}

#[test]
fn test_vfork_child_exits_before_exec() {
    let mut h = vforked(TrackerConfig::default());
    h.enter("exit_group");

    assert!(h.trail().is_empty());
    assert_eq!(state(&h, C), ProcState::End);
    assert_eq!(state(&h, P), ProcState::Run);
    assert_eq!(h.tracker.asids().get(0x1000), Some(P));
    assert!(!h.tracker.asids().is_shared(0x1000));

    h.guest.reap(C).unwrap();
    h.schedule(P);
    h.enter("wait4");
    assert_eq!(state(&h, P), ProcState::Run);
}

#[test]
fn test_vfork_child_failed_exec_stays_paired() {
    let mut h = vforked(TrackerConfig::default());
    h.enter("execve");
    h.ret("execve", -2);
    assert_eq!(state(&h, C), ProcState::Vfc);
    assert_eq!(h.tracker.entry(C).unwrap().vfork_parent(), Some(P));

    h.enter("exit");
    assert_eq!(state(&h, P), ProcState::Run);
    assert!(h.trail().is_empty());
}

#[test]
fn test_vfork_child_unexpected_syscall_is_warning() {
    let mut h = vforked(TrackerConfig::default());
    h.enter("brk");
    assert_eq!(state(&h, C), ProcState::Vfc);
    assert_eq!(h.tracker.stats().warnings, 1);
}

#[test]
fn test_vfork_parent_running_before_child_exec_is_fatal() {
    let mut h = vforked(TrackerConfig::default());
    h.schedule(P);
    let err = h.try_enter("write").unwrap_err();
    assert!(matches!(
        err,
        TrackerError::InvalidTransition {
            state: ProcState::Vfp,
            ..
        }
    ));
    assert_eq!(h.try_enter("write"), Err(TrackerError::Poisoned));
}

#[test]
fn test_vfork_parent_wait_is_no_transition() {
    let mut h = vforked(TrackerConfig::default());
    h.schedule(P);
    h.enter("wait4");
    assert_eq!(state(&h, P), ProcState::Vfp);
}

#[test]
fn test_vfork_return_after_child_preempted_in_kernel() {
    let mut h = parent_running(TrackerConfig::default());
    h.enter("vfork");
    h.spawn(C, 0x1000, 101, 100);
    h.schedule(C);

    // C is switched out before its vfork return is delivered
    h.switch(0x1000, 0x2000, Some(Q));
    assert_eq!(state(&h, C), ProcState::Init);
    h.switch(0x2000, 0x1000, Some(C));
    h.ret("vfork", 0);

    assert_eq!(state(&h, P), ProcState::Vfp);
    assert_eq!(state(&h, C), ProcState::Vfc);
    assert_eq!(h.tracker.entry_by_asid(0x1000).unwrap().task_id(), C);
    assert!(h.tracker.asids().is_shared(0x1000));

    vfork_exec(&mut h);
    assert_eq!(state(&h, P), ProcState::Run);
    assert_eq!(h.count(Start, 101), 1);
    assert_eq!(h.count(End, 101), 0);
    assert_eq!(h.tracker.entry(C).unwrap().handle().asid, 0x3000);
}

#[test]
fn test_vfork_return_without_sharing_parent_is_fatal() {
    let mut h = parent_running(TrackerConfig::default());
    h.enter("vfork");
    h.spawn(C, 0x7000, 101, 100);
    h.schedule(C);
    let err = h.try_ret("vfork", 0).unwrap_err();
    assert!(matches!(
        err,
        TrackerError::InvalidTransition {
            state: ProcState::Init,
            ..
        }
    ));
    assert!(h.tracker.is_poisoned());
}

#[test]
fn test_vfork_child_reuses_ended_task_structure() {
    let mut h = parent_running(TrackerConfig::default());
    assert_eq!(h.tracker.config().vfork_mode, VforkMode::Collapsed);
    h.enter("exit_group");
    h.switch(0x1000, 0x2000, Some(Q));
    h.guest.reap(P).unwrap();
    h.enter("write");
    h.drain();

    // Q vforks and the child gets P's old task structure
    h.enter("vfork");
    h.spawn(P, 0x2000, 201, 200);
    h.schedule(P);
    h.ret("vfork", 0);

    assert_eq!(state(&h, Q), ProcState::Vfp);
    assert_eq!(state(&h, P), ProcState::Vfc);
    assert_eq!(h.tracker.entry(P).unwrap().handle().pid, 201);
    assert_eq!(h.tracker.entry(P).unwrap().vfork_parent(), Some(Q));
    assert_eq!(h.tracker.entry_by_asid(0x2000).unwrap().task_id(), P);
    assert!(h.trail().is_empty());

    h.enter("execve");
    h.set_asid(P, 0x4000);
    h.switch(0x2000, 0x4000, Some(P));
    h.enter("write");

    assert_eq!(h.trail(), vec![(Start, 201, 0x4000)]);
    assert_eq!(state(&h, Q), ProcState::Run);
    assert_eq!(h.tracker.entry_by_asid(0x2000).unwrap().task_id(), Q);
    assert_eq!(h.tracker.entry_by_pid(201).unwrap().task_id(), P);
}

// ----------------------------------------------------------------------
// kill
// ----------------------------------------------------------------------

#[test]
fn test_kill_end_deferred_to_schedule_out() {
    let mut h = parent_running(TrackerConfig::default());
    h.schedule(Q);
    h.enter("read");
    h.schedule(P);
    h.enter("kill");
    h.drain();

    h.kill(200, SIGKILL, 0);
    assert_eq!(state(&h, Q), ProcState::Kill);
    assert_eq!(h.tracker.asids().get(0x2000), Some(Q));
    assert!(h.trail().is_empty());

    h.switch(0x1000, 0x2000, Some(Q));
    assert!(h.trail().is_empty());
    assert_eq!(h.tracker.asids().get(0x2000), Some(Q));

    h.switch(0x2000, 0x1000, Some(P));
    assert_eq!(h.trail(), vec![(End, 200, 0x2000)]);
    assert_eq!(h.tracker.asids().get(0x2000), None);

    h.enter("write");
    h.teardown();
    assert_eq!(h.count(End, 200), 1);
    assert_eq!(h.count(End, 100), 1);
}

#[test]
fn test_kill_survived_with_sigint() {
    let mut h = parent_running(TrackerConfig::default());
    h.enter("kill");
    h.kill(200, SIGINT, 0);
    assert_eq!(state(&h, Q), ProcState::Kill);

    // Q handles the signal and keeps running; its start is issued now
    h.schedule(Q);
    h.enter("write");
    assert_eq!(state(&h, Q), ProcState::Run);
    assert_eq!(h.trail(), vec![(Start, 200, 0x2000)]);
}

#[test]
fn test_kill_ignored_cases() {
    let mut h = parent_running(TrackerConfig::default());
    h.kill(200, 15, 0);
    h.kill(200, SIGKILL, -3);
    assert_eq!(state(&h, Q), ProcState::Init);

    h.kill(0, SIGKILL, 0);
    h.kill(-200, SIGKILL, 0);
    h.kill(777, SIGKILL, 0);
    assert_eq!(h.tracker.stats().warnings, 3);
}

// ----------------------------------------------------------------------
// execve and exit
// ----------------------------------------------------------------------

#[test]
fn test_plain_execve_reuses_entry() {
    let mut h = parent_running(TrackerConfig::default());
    h.enter("execve");
    h.set_asid(P, 0x5000);
    h.switch(0x1000, 0x5000, Some(P));

    assert_eq!(h.trail(), vec![(End, 100, 0x1000), (Start, 100, 0x5000)]);
    let entry = h.tracker.entry(P).unwrap();
    assert_eq!(entry.handle().task_id, P);
    assert_eq!(entry.handle().pid, 100);
    assert_eq!(entry.handle().ppid, 1);
    assert_eq!(h.tracker.asids().get(0x1000), None);
    assert_eq!(h.tracker.asids().get(0x5000), Some(P));
    assert_eq!(h.tracker.table().len(), 2);

    h.enter("brk");
    assert_eq!(h.trail().len(), 2);
}

#[test]
fn test_failed_execve_then_retry() {
    let mut h = parent_running(TrackerConfig::default());
    h.enter("execve");
    h.ret("execve", -13);
    assert_eq!(state(&h, P), ProcState::Run);
    h.enter("execve");
    h.enter("execve");
    assert_eq!(state(&h, P), ProcState::Exe);
}

#[test]
fn test_execve_into_held_asid_is_collision() {
    let mut h = parent_running(TrackerConfig::default());
    h.enter("execve");
    h.set_asid(P, 0x2000);
    let err = h.try_switch(0x1000, 0x2000, None).unwrap_err();
    assert_eq!(
        err,
        TrackerError::AsidCollision {
            asid: 0x2000,
            existing: Q,
            requested: P
        }
    );
    assert!(h.tracker.is_poisoned());
}

#[test]
fn test_exit_group_ends_before_schedule_out() {
    let mut h = parent_running(TrackerConfig::default());
    h.enter("exit_group");
    assert_eq!(h.trail(), vec![(End, 100, 0x1000)]);
    assert_eq!(h.tracker.asids().get(0x1000), None);

    h.switch(0x1000, 0x2000, Some(Q));
    h.guest.reap(P).unwrap();
    h.enter("write");
    assert_eq!(h.count(End, 100), 1);
    assert_eq!(h.count(Start, 200), 1);
}

#[test]
fn test_recycled_task_structure() {
    let mut h = parent_running(TrackerConfig::default());
    h.enter("exit_group");
    h.switch(0x1000, 0x2000, Some(Q));
    h.guest.reap(P).unwrap();

    // Q forks and the new child reuses P's task structure
    h.enter("clone");
    h.spawn(P, 0x6000, 300, 200);
    h.ret("clone", 300);
    assert_eq!(state(&h, P), ProcState::Init);
    assert_eq!(h.tracker.entry(P).unwrap().handle().pid, 300);

    h.switch(0x2000, 0x6000, Some(P));
    h.enter("write");
    assert_eq!(h.count(Start, 300), 1);
    assert_eq!(h.count(End, 100), 1);
    assert_eq!(h.tracker.table().len(), 2);
}

// ----------------------------------------------------------------------
// context switches
// ----------------------------------------------------------------------

#[test]
fn test_switch_to_unknown_asid_without_process_is_tolerated() {
    let mut h = parent_running(TrackerConfig::default());
    h.switch(0x1000, 0x9000, None);
    h.switch(0x1000, 0x2000, Some(Q));
    h.enter("write");
    assert_eq!(h.count(Start, 200), 1);
}

#[test]
fn test_late_start_when_first_syscall_missed() {
    let mut h = parent_running(TrackerConfig::default());
    h.switch(0x1000, 0x2000, Some(Q));
    // Q runs without issuing a syscall and is switched out
    h.switch(0x2000, 0x1000, Some(P));
    assert_eq!(h.trail(), vec![(Start, 200, 0x2000)]);
    assert_eq!(h.tracker.stats().warnings, 1);

    h.switch(0x1000, 0x2000, Some(Q));
    h.enter("write");
    assert_eq!(h.count(Start, 200), 1);
}

#[test]
fn test_kernel_worker_becomes_process() {
    let mut h = Harness::new();
    h.spawn(K, 0, 50, 2);
    h.spawn(P, 0x1000, 100, 1);
    h.boot();
    h.schedule(P);
    h.enter("write");
    h.switch(0x1000, 0, Some(K));

    h.set_asid(K, 0x7000);
    h.switch(0x1000, 0x7000, Some(K));
    assert_eq!(state(&h, K), ProcState::Init);
    assert_eq!(h.tracker.asids().get(0x7000), Some(K));

    h.enter("write");
    assert_eq!(h.count(Start, 50), 1);
}

#[test]
fn test_switch_from_wrong_context_is_fatal() {
    let mut h = parent_running(TrackerConfig::default());
    let err = h.try_switch(0x2000, 0x1000, None).unwrap_err();
    assert!(matches!(err, TrackerError::ContextMismatch { .. }));
}

// ----------------------------------------------------------------------
// session
// ----------------------------------------------------------------------

#[test]
fn test_boot_with_shared_asid_warns() {
    let mut h = Harness::new();
    h.spawn(P, 0x1000, 100, 1);
    h.spawn(C, 0x1000, 101, 100);
    assert_eq!(h.boot(), 2);
    assert_eq!(h.tracker.asids().get(0x1000), Some(P));
    assert_eq!(h.tracker.stats().warnings, 1);
}

#[test]
fn test_teardown_flushes_once() {
    let mut h = parent_running(TrackerConfig::default());
    h.schedule(Q);
    h.enter("write");
    h.enter("exit_group");
    let summary = h.teardown();

    assert_eq!(summary.flushed, 1);
    assert_eq!(summary.stats.starts, 2);
    assert_eq!(summary.stats.ends, 2);
    assert_eq!(h.count(End, 100), 1);
    assert_eq!(h.count(End, 200), 1);
    assert!(h.tracker.table().is_empty());

    // a second teardown has nothing left to flush
    let again = h.teardown();
    assert_eq!(again.flushed, 0);
}

#[test]
fn test_i386_abi_numbers() {
    let config = TrackerConfig {
        abi: SyscallAbi::I386,
        ..TrackerConfig::default()
    };
    let mut h = parent_running(config);
    assert_eq!(h.nr("clone"), 120);
    h.enter("clone");
    assert_eq!(state(&h, P), ProcState::Cln);
    h.spawn(C, 0x3000, 101, 100);
    h.ret("clone", 101);
    assert_eq!(state(&h, C), ProcState::Init);
}
