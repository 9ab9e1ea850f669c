//! Syscall catalog for the guest ABIs we model
//!
//! Only the calls that drive the process lifecycle are classified; every
//! other number maps to [`Syscall::Other`]. Names cover the lifecycle calls
//! plus a few common ones so that log output stays readable.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle-relevant syscall classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Syscall {
    Clone,
    Fork,
    Vfork,
    Execve,
    Exit,
    ExitGroup,
    Wait4,
    Waitpid,
    Kill,
    Dup2,
    Close,
    Brk,
    Other(i64),
}

impl Syscall {
    /// Calls that create a new process with its own address space
    pub fn is_clone_like(self) -> bool {
        matches!(self, Syscall::Clone | Syscall::Fork)
    }

    pub fn is_exit(self) -> bool {
        matches!(self, Syscall::Exit | Syscall::ExitGroup)
    }

    pub fn is_wait(self) -> bool {
        matches!(self, Syscall::Wait4 | Syscall::Waitpid)
    }
}

/// Guest syscall ABI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SyscallAbi {
    /// Linux x86-64
    #[default]
    #[serde(rename = "x86-64")]
    #[value(name = "x86-64")]
    X86_64,
    /// Linux i386 (int 0x80)
    I386,
    /// Linux ARM EABI
    Arm,
}

/// (number, name, class) rows for one ABI
type Table = &'static [(i64, &'static str, Syscall)];

const X86_64_TABLE: Table = &[
    (0, "read", Syscall::Other(0)),
    (1, "write", Syscall::Other(1)),
    (2, "open", Syscall::Other(2)),
    (3, "close", Syscall::Close),
    (12, "brk", Syscall::Brk),
    (33, "dup2", Syscall::Dup2),
    (56, "clone", Syscall::Clone),
    (57, "fork", Syscall::Fork),
    (58, "vfork", Syscall::Vfork),
    (59, "execve", Syscall::Execve),
    (60, "exit", Syscall::Exit),
    (61, "wait4", Syscall::Wait4),
    (62, "kill", Syscall::Kill),
    (231, "exit_group", Syscall::ExitGroup),
    (257, "openat", Syscall::Other(257)),
    (322, "execveat", Syscall::Execve),
    (435, "clone3", Syscall::Clone),
];

const I386_TABLE: Table = &[
    (1, "exit", Syscall::Exit),
    (2, "fork", Syscall::Fork),
    (3, "read", Syscall::Other(3)),
    (4, "write", Syscall::Other(4)),
    (5, "open", Syscall::Other(5)),
    (6, "close", Syscall::Close),
    (7, "waitpid", Syscall::Waitpid),
    (11, "execve", Syscall::Execve),
    (37, "kill", Syscall::Kill),
    (45, "brk", Syscall::Brk),
    (63, "dup2", Syscall::Dup2),
    (114, "wait4", Syscall::Wait4),
    (120, "clone", Syscall::Clone),
    (190, "vfork", Syscall::Vfork),
    (252, "exit_group", Syscall::ExitGroup),
    (358, "execveat", Syscall::Execve),
    (435, "clone3", Syscall::Clone),
];

const ARM_TABLE: Table = &[
    (1, "exit", Syscall::Exit),
    (2, "fork", Syscall::Fork),
    (3, "read", Syscall::Other(3)),
    (4, "write", Syscall::Other(4)),
    (5, "open", Syscall::Other(5)),
    (6, "close", Syscall::Close),
    (11, "execve", Syscall::Execve),
    (37, "kill", Syscall::Kill),
    (45, "brk", Syscall::Brk),
    (63, "dup2", Syscall::Dup2),
    (114, "wait4", Syscall::Wait4),
    (120, "clone", Syscall::Clone),
    (190, "vfork", Syscall::Vfork),
    (248, "exit_group", Syscall::ExitGroup),
    (387, "execveat", Syscall::Execve),
    (435, "clone3", Syscall::Clone),
];

impl SyscallAbi {
    fn table(self) -> Table {
        match self {
            SyscallAbi::X86_64 => X86_64_TABLE,
            SyscallAbi::I386 => I386_TABLE,
            SyscallAbi::Arm => ARM_TABLE,
        }
    }

    /// Classify a raw syscall number
    pub fn classify(self, nr: i64) -> Syscall {
        self.table()
            .iter()
            .find(|(n, _, _)| *n == nr)
            .map(|(_, _, class)| *class)
            .unwrap_or(Syscall::Other(nr))
    }

    /// Resolve a raw syscall number to its name, if catalogued
    pub fn name(self, nr: i64) -> Option<&'static str> {
        self.table()
            .iter()
            .find(|(n, _, _)| *n == nr)
            .map(|(_, name, _)| *name)
    }

    /// Name for log output, `syscall_NNN` when unknown
    pub fn display_name(self, nr: i64) -> String {
        match self.name(nr) {
            Some(name) => name.to_string(),
            None => format!("syscall_{}", nr),
        }
    }

    /// Reverse lookup, used by trace writers and tests
    pub fn number(self, name: &str) -> Option<i64> {
        self.table()
            .iter()
            .find(|(_, n, _)| *n == name)
            .map(|(nr, _, _)| *nr)
    }
}

impl fmt::Display for SyscallAbi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyscallAbi::X86_64 => "x86-64",
            SyscallAbi::I386 => "i386",
            SyscallAbi::Arm => "arm",
        };
        f.write_str(s)
    }
}
