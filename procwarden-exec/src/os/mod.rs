//! OS-facing process interface.
//!
//! Everything the executor, terminator and table know about processes they
//! did not spawn themselves goes through [`ProcessOs`]. One implementation
//! per target: `/proc` on Linux, `ps(1)` elsewhere.

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::pid::Pid;
use crate::process_group::{self, Delivery};
use crate::signal::Signal;

#[cfg(target_os = "linux")]
mod linux;
mod ps;

#[cfg(target_os = "linux")]
pub use linux::ProcFs;
pub use ps::PsOs;

/// One entry of the OS process list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessInfo {
    pub pid: Pid,
    /// Arguments joined with a single space, as reported by the OS.
    pub command_line: String,
}

impl ProcessInfo {
    pub fn new(pid: Pid, command_line: impl Into<String>) -> Self {
        Self {
            pid,
            command_line: command_line.into(),
        }
    }
}

pub trait ProcessOs: Send + Sync + fmt::Debug {
    /// Every visible process except the caller itself. Read fresh on each call.
    fn enumerate_processes(&self) -> io::Result<Vec<ProcessInfo>>;

    fn send_signal(&self, pid: Pid, signal: Signal) -> io::Result<Delivery> {
        process_group::signal_process(pid, signal)
    }

    /// Signal every member of process group `pgid`.
    fn send_group_signal(&self, pgid: Pid, signal: Signal) -> io::Result<Delivery> {
        process_group::signal_group(pgid, signal)
    }

    /// Process group of `pid` unless it is gone or shares our group.
    fn group_of(&self, pid: Pid) -> Option<Pid> {
        process_group::foreign_group(pid)
    }

    /// True while `pid` exists and is not a zombie.
    fn is_alive(&self, pid: Pid) -> bool;

    /// True while any member of group `pgid` is running.
    fn is_group_alive(&self, pgid: Pid) -> bool {
        process_group::group_exists(pgid)
    }
}

/// The implementation for the current target.
pub fn default_os() -> Arc<dyn ProcessOs> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(ProcFs::new())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(PsOs)
    }
}
