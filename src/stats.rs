//! Session statistics for -c mode
//!
//! Counts the events fed to the tracker and the notifications it issued,
//! and the distribution of FSM states when the session ended.

use crate::fsm::ProcState;
use serde::Serialize;
use std::collections::BTreeMap;

/// Event and notification counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub syscall_enters: u64,
    pub syscall_returns: u64,
    pub kill_returns: u64,
    pub context_switches: u64,
    pub processes_discovered: u64,
    pub starts: u64,
    pub ends: u64,
    /// Survivable oddities that were logged as warnings
    pub warnings: u64,
    pub guess_matches: u64,
    pub guess_mismatches: u64,
}

/// State of the tracker at teardown
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    /// Entries per FSM state, before synthetic end notifications
    pub state_counts: BTreeMap<ProcState, usize>,
    /// Entries that received a synthetic end notification
    pub flushed: usize,
    pub stats: TrackerStats,
}

impl SessionSummary {
    /// Print the summary to stderr
    pub fn print_summary(&self) {
        let s = &self.stats;
        eprintln!("   events  kind");
        eprintln!("--------- ----------------");
        eprintln!("{:>9} syscall enter", s.syscall_enters);
        eprintln!("{:>9} syscall return", s.syscall_returns);
        eprintln!("{:>9} kill return", s.kill_returns);
        eprintln!("{:>9} context switch", s.context_switches);
        eprintln!("--------- ----------------");
        eprintln!(
            "processes: {} discovered, {} started, {} ended ({} at teardown)",
            s.processes_discovered, s.starts, s.ends, self.flushed
        );
        eprintln!(
            "guesses: {} ok, {} failed; warnings: {}",
            s.guess_matches, s.guess_mismatches, s.warnings
        );
        if !self.state_counts.is_empty() {
            eprintln!("states at end of trace:");
            for (state, count) in &self.state_counts {
                eprintln!("  {:>4}: {}", state, count);
            }
        }
    }
}
