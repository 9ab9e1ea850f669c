//! Lifetrace - process lifecycle tracking for whole-system guest analysis
//!
//! Reconstructs the lifetime of every guest process from a stream of
//! syscall enter/return events, kill returns and address-space switches,
//! and issues exactly one start and one end notification per process
//! instance. See [`tracker::ProcessTracker`] for the event handlers and
//! [`replay`] for the recorded trace format.

pub mod asid_index;
pub mod cli;
pub mod config;
pub mod consistency;
pub mod error;
pub mod fsm;
pub mod guest;
pub mod handle;
pub mod output;
pub mod replay;
pub mod stats;
pub mod syscalls;
pub mod table;
pub mod tracker;
