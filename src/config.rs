//! Tracker configuration
//!
//! Values come from defaults, an optional TOML file, and CLI flags, in
//! increasing order of precedence.

use crate::syscalls::SyscallAbi;
use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Notifications issued for the transient child of a vfork
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum VforkMode {
    /// One lifecycle pair per vfork+execve: only the post-exec child is
    /// reported, so every reported instance owns its asid exclusively.
    #[default]
    Collapsed,
    /// Also report the pre-exec child sharing the parent's asid.
    Transient,
}

/// How the next-process guess is verified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ConsistencyMode {
    /// Skip the check entirely
    Off,
    /// Log mismatches as warnings
    #[default]
    Warn,
    /// Treat mismatches as fatal
    Strict,
}

/// Configuration of a [`crate::tracker::ProcessTracker`]
///
/// # Example
/// ```
/// use lifetrace::config::{TrackerConfig, VforkMode};
///
/// let config = TrackerConfig::default();
/// assert_eq!(config.vfork_mode, VforkMode::Collapsed);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrackerConfig {
    /// Guest syscall ABI
    pub abi: SyscallAbi,

    /// Vfork notification policy
    pub vfork_mode: VforkMode,

    /// Next-process guess verification
    pub consistency: ConsistencyMode,
}

impl TrackerConfig {
    /// Parse a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("Invalid tracker configuration")
    }

    /// Load a TOML configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml(&text)
    }
}
