//! Next-process guess verification
//!
//! At every context switch the tracker records which task it believes will
//! run next. The following syscall enter reveals the task that actually
//! runs. Agreement is evidence that the lifecycle model tracks the guest;
//! disagreement means the model drifted silently.
//!
//! Vfork pairs share an asid, so a switch between parent and child is
//! invisible to the asid-based guess. Both directions are accepted.
//!
//! [`verify_invariants`] checks the structural invariants tying the process
//! table to the asid index.

use crate::asid_index::AsidIndex;
use crate::config::ConsistencyMode;
use crate::error::{Result, TrackerError};
use crate::fsm::{ProcState, VforkLink};
use crate::guest::TaskId;
use crate::table::ProcessTable;
use std::collections::BTreeMap;

/// Who is expected to issue the next syscall
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    /// No context switch observed yet
    Unset,
    /// Switched into a context with no known process
    Kernel,
    Task(TaskId),
}

/// Result of comparing the guess against the observed task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuessOutcome {
    Match,
    /// Observed a vfork child while its parent was expected
    VforkChild,
    /// Observed a vfork parent while its child was expected
    VforkParent,
    NoExpectation,
    Mismatch,
    Skipped,
}

#[derive(Debug)]
pub struct ConsistencyChecker {
    mode: ConsistencyMode,
    expected: Expectation,
    matches: u64,
    mismatches: u64,
}

impl ConsistencyChecker {
    pub fn new(mode: ConsistencyMode) -> Self {
        Self {
            mode,
            expected: Expectation::Unset,
            matches: 0,
            mismatches: 0,
        }
    }

    pub fn expected(&self) -> Expectation {
        self.expected
    }

    /// Record the guess produced by a context switch
    pub fn expect_next(&mut self, next: Option<TaskId>) {
        self.expected = match next {
            Some(task_id) => Expectation::Task(task_id),
            None => Expectation::Kernel,
        };
    }

    /// Compare the guess with the task issuing a syscall.
    ///
    /// `vfork_child` is the observed entry's child when it is a vfork parent.
    pub fn check(
        &mut self,
        observed: TaskId,
        state: ProcState,
        vfork_child: Option<TaskId>,
    ) -> Result<GuessOutcome> {
        if self.mode == ConsistencyMode::Off {
            return Ok(GuessOutcome::Skipped);
        }

        let expected = self.expected;
        let outcome = match expected {
            Expectation::Unset => GuessOutcome::NoExpectation,
            Expectation::Task(t) if t == observed => GuessOutcome::Match,
            _ if state == ProcState::Vfc => GuessOutcome::VforkChild,
            Expectation::Task(t) if state == ProcState::Vfp && vfork_child == Some(t) => {
                GuessOutcome::VforkParent
            }
            _ => GuessOutcome::Mismatch,
        };
        self.expected = Expectation::Task(observed);

        if outcome != GuessOutcome::Mismatch {
            self.matches += 1;
            tracing::trace!("guess ok ({:?}): {:#x}", outcome, observed);
            return Ok(outcome);
        }

        self.mismatches += 1;
        match (self.mode, expected) {
            (ConsistencyMode::Strict, Expectation::Task(t)) => Err(TrackerError::GuessMismatch {
                expected: t,
                observed,
            }),
            (ConsistencyMode::Strict, _) => Err(TrackerError::GuessMismatch {
                expected: 0,
                observed,
            }),
            _ => {
                tracing::warn!(
                    "guess failed: expected {:?}, observed {:#x} at state {}",
                    expected,
                    observed,
                    state
                );
                Ok(outcome)
            }
        }
    }

    pub fn matches(&self) -> u64 {
        self.matches
    }

    pub fn mismatches(&self) -> u64 {
        self.mismatches
    }

    pub fn reset(&mut self) {
        self.expected = Expectation::Unset;
    }
}

/// Check that the table and the index agree:
///
/// - every mapping names an existing, non-terminated entry using that asid
/// - no task holds two asids
/// - vfork links are mutual, share one asid, and sit in compatible states
/// - no entry has ended without having started
pub fn verify_invariants(table: &ProcessTable, asids: &AsidIndex) -> Result<()> {
    let mut holders: BTreeMap<TaskId, u64> = BTreeMap::new();
    for (asid, task_id) in asids.iter() {
        if let Some(&first) = holders.get(&task_id) {
            return Err(TrackerError::AsidCollision {
                asid,
                existing: task_id,
                requested: first,
            });
        }
        holders.insert(task_id, asid);

        let entry = table.expect(task_id)?;
        if entry.handle().asid != asid || entry.state() == ProcState::End {
            return Err(TrackerError::UnexpectedAsid {
                asid,
                context: format!("mapped to {} at state {}", entry.handle(), entry.state()),
            });
        }
    }

    for entry in table.iter() {
        let task_id = entry.task_id();
        if entry.ended() && !entry.started() {
            return Err(TrackerError::EndWithoutStart(*entry.handle()));
        }
        let Some(link) = entry.vfork() else {
            continue;
        };
        let (partner, expected_back, states): (TaskId, VforkLink, &[ProcState]) = match link {
            VforkLink::Child(child) => (
                child,
                VforkLink::Parent(task_id),
                &[ProcState::Vfp, ProcState::Kill],
            ),
            VforkLink::Parent(parent) => (
                parent,
                VforkLink::Child(task_id),
                &[ProcState::Vfc, ProcState::Exe, ProcState::Kill],
            ),
        };
        let other = table.expect(partner)?;
        let detail = if other.vfork() != Some(expected_back) {
            Some(format!("link to {:#x} is not mutual", partner))
        } else if other.handle().asid != entry.handle().asid {
            Some(format!("partner {:#x} uses another asid", partner))
        } else if !asids.is_shared(entry.handle().asid) {
            Some(format!("asid {:#x} not marked shared", entry.handle().asid))
        } else if !states.contains(&entry.state()) {
            Some(format!("linked entry at state {}", entry.state()))
        } else {
            None
        };
        if let Some(detail) = detail {
            return Err(TrackerError::InvalidVforkLink { task_id, detail });
        }
    }
    Ok(())
}
