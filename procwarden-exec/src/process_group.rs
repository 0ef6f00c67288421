//! Session and process-group plumbing for spawned children.
//!
//! - `detach_from_tty` runs in `pre_exec` and makes every child the leader of
//!   a fresh session, so it never shares our controlling terminal and its
//!   whole tree can be signalled as one group.
//! - `set_parent_death_signal` (Linux only) asks the kernel to deliver
//!   `SIGTERM` to attached children when this service dies.
//! - `signal_process` / `signal_group` deliver a [`Signal`] and fold `ESRCH`
//!   into [`Delivery::NoSuchProcess`]. Groups are addressed by id, so a group
//!   stays reachable after its leader is gone.

use std::io;

use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd;

use crate::pid::Pid;
use crate::signal::Signal;

/// Result of a successful `kill(2)`/`killpg(2)` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The target did not exist (`ESRCH`).
    NoSuchProcess,
}

/// Ensure the child receives SIGTERM when the original parent dies.
///
/// Must only run inside a `pre_exec` hook. `parent_pid` is captured before
/// the fork so a parent that exits between fork and exec is still noticed.
#[cfg(target_os = "linux")]
pub fn set_parent_death_signal(parent_pid: libc::pid_t) -> io::Result<()> {
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) } == -1 {
        return Err(io::Error::last_os_error());
    }

    if unsafe { libc::getppid() } != parent_pid {
        unsafe {
            libc::raise(libc::SIGTERM);
        }
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_parent_death_signal(_parent_pid: libc::pid_t) -> io::Result<()> {
    Ok(())
}

/// Start a new session; falls back to a new process group when the caller
/// already leads a session.
pub fn detach_from_tty() -> io::Result<()> {
    let result = unsafe { libc::setsid() };
    if result == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) {
            return set_process_group();
        }
        return Err(err);
    }
    Ok(())
}

pub fn set_process_group() -> io::Result<()> {
    let result = unsafe { libc::setpgid(0, 0) };
    if result == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Send `sig` to a single process.
pub fn signal_process(pid: Pid, sig: Signal) -> io::Result<Delivery> {
    if !pid.is_valid() {
        return Ok(Delivery::NoSuchProcess);
    }
    fold(signal::kill(pid.into(), sig.as_nix()))
}

/// Process group of `pid`, or `None` when `pid` is gone or shares our own
/// group.
pub fn foreign_group(pid: Pid) -> Option<Pid> {
    if !pid.is_valid() {
        return None;
    }
    let pgid = unistd::getpgid(Some(pid.into())).ok()?;
    (pgid != unistd::getpgrp()).then(|| Pid::new(pgid.as_raw()))
}

/// Send `sig` to every member of process group `pgid`.
///
/// Refuses our own group so a stray id never takes the service down with it.
pub fn signal_group(pgid: Pid, sig: Signal) -> io::Result<Delivery> {
    if !pgid.is_valid() {
        return Ok(Delivery::NoSuchProcess);
    }
    let pgid: unistd::Pid = pgid.into();
    if pgid == unistd::getpgrp() {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "refusing to signal our own process group",
        ));
    }
    fold(signal::killpg(pgid, sig.as_nix()))
}

/// True while any member of group `pgid` exists, zombies included.
pub fn group_exists(pgid: Pid) -> bool {
    if !pgid.is_valid() {
        return false;
    }
    match signal::killpg(pgid.into(), None) {
        Ok(()) => true,
        Err(errno) => errno == Errno::EPERM,
    }
}

/// Existence probe via signal 0. `EPERM` means the process exists but
/// belongs to someone else.
pub fn probe(pid: Pid) -> bool {
    if !pid.is_valid() {
        return false;
    }
    match signal::kill(pid.into(), None) {
        Ok(()) => true,
        Err(errno) => errno == Errno::EPERM,
    }
}

fn fold(result: nix::Result<()>) -> io::Result<Delivery> {
    match result {
        Ok(()) => Ok(Delivery::Delivered),
        Err(Errno::ESRCH) => Ok(Delivery::NoSuchProcess),
        Err(errno) => Err(errno.into()),
    }
}
