//! CLI argument parsing for lifetrace

use crate::config::{ConsistencyMode, TrackerConfig, VforkMode};
use crate::syscalls::SyscallAbi;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Output format for lifecycle notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON lines for machine parsing
    Json,
    /// CSV format for spreadsheet analysis
    Csv,
}

#[derive(Parser, Debug)]
#[command(name = "lifetrace")]
#[command(version)]
#[command(about = "Reconstruct guest process lifecycles from recorded syscall and address-space traces", long_about = None)]
pub struct Cli {
    /// Recorded trace in JSON-lines format ("-" reads stdin)
    #[arg(value_name = "TRACE")]
    pub trace: PathBuf,

    /// Tracker configuration file (TOML)
    #[arg(long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Guest syscall ABI (overrides the config file)
    #[arg(long = "abi", value_enum)]
    pub abi: Option<SyscallAbi>,

    /// Notifications for the pre-exec child of a vfork (overrides the config file)
    #[arg(long = "vfork", value_enum, value_name = "MODE")]
    pub vfork_mode: Option<VforkMode>,

    /// Next-process guess verification (overrides the config file)
    #[arg(long = "consistency", value_enum, value_name = "MODE")]
    pub consistency: Option<ConsistencyMode>,

    /// Output format (text, json or csv)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Print a session summary to stderr after the trace ends
    #[arg(short = 'c', long = "summary")]
    pub summary: bool,

    /// Enable debug tracing output to stderr
    #[arg(long = "debug")]
    pub debug: bool,
}

impl Cli {
    /// Apply command-line overrides on top of `base`
    pub fn apply_overrides(&self, base: TrackerConfig) -> TrackerConfig {
        TrackerConfig {
            abi: self.abi.unwrap_or(base.abi),
            vfork_mode: self.vfork_mode.unwrap_or(base.vfork_mode),
            consistency: self.consistency.unwrap_or(base.consistency),
        }
    }

    /// True when the trace is read from stdin
    pub fn reads_stdin(&self) -> bool {
        self.trace.as_os_str() == "-"
    }
}
