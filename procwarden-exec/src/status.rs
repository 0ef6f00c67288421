//! Immutable outcome of one command execution.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::pid::Pid;
use crate::process::StopOutcome;
use crate::spec::CommandSpec;

/// The command never ran: the OS refused the spawn (missing executable,
/// permission denied, resource exhaustion).
pub const EXIT_SPAWN_FAILED: i32 = -1;

/// The command was refused before any OS call (invalid spec, or an exclusive
/// command whose previous instance is still alive).
pub const EXIT_REJECTED: i32 = -2;

/// Offset added to a signal number when a process was killed by it.
pub const SIGNAL_EXIT_BASE: i32 = 128;

/// Snapshot returned to the caller once a command finished (or was left
/// running). Built once, never mutated.
#[derive(Debug, Clone)]
pub struct CommandStatus {
    spec: CommandSpec,
    pid: Pid,
    exit_code: Option<i32>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    stdout_truncated: bool,
    stderr_truncated: bool,
    timed_out: bool,
    termination: Option<StopOutcome>,
    started_at: DateTime<Utc>,
    elapsed: Duration,
}

/// Collected pieces handed to [`CommandStatus::completed`].
#[derive(Debug, Default)]
pub(crate) struct Completion {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub timed_out: bool,
    pub termination: Option<StopOutcome>,
}

impl CommandStatus {
    pub(crate) fn completed(
        spec: CommandSpec,
        pid: Pid,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        completion: Completion,
    ) -> Self {
        Self {
            spec,
            pid,
            exit_code: completion.exit_code,
            stdout: completion.stdout,
            stderr: completion.stderr,
            stdout_truncated: completion.stdout_truncated,
            stderr_truncated: completion.stderr_truncated,
            timed_out: completion.timed_out,
            termination: completion.termination,
            started_at,
            elapsed,
        }
    }

    /// A process that is still running when the status is handed out
    /// (detached or abandoned waits).
    pub(crate) fn running(spec: CommandSpec, pid: Pid, started_at: DateTime<Utc>) -> Self {
        Self::completed(
            spec,
            pid,
            started_at,
            Duration::ZERO,
            Completion::default(),
        )
    }

    pub(crate) fn spawn_failed(spec: CommandSpec, message: impl Into<String>) -> Self {
        Self::sentinel(spec, EXIT_SPAWN_FAILED, message.into())
    }

    pub(crate) fn rejected(spec: CommandSpec, message: impl Into<String>) -> Self {
        Self::sentinel(spec, EXIT_REJECTED, message.into())
    }

    fn sentinel(spec: CommandSpec, code: i32, message: String) -> Self {
        let mut stderr = message.into_bytes();
        stderr.push(b'\n');
        Self::completed(
            spec,
            Pid::NOT_FOUND,
            Utc::now(),
            Duration::ZERO,
            Completion {
                exit_code: Some(code),
                stderr,
                ..Completion::default()
            },
        )
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Pid of the spawned process, or [`Pid::NOT_FOUND`] when nothing ran.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Exit code; `None` while the process has not exited (detached,
    /// abandoned, or it survived termination).
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn stdout(&self) -> &[u8] {
        &self.stdout
    }

    pub fn stderr(&self) -> &[u8] {
        &self.stderr
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// True when stdout exceeded the capture ceiling and was cut.
    pub fn stdout_truncated(&self) -> bool {
        self.stdout_truncated
    }

    pub fn stderr_truncated(&self) -> bool {
        self.stderr_truncated
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// How the timeout-triggered or shutdown-triggered termination ended.
    pub fn termination(&self) -> Option<StopOutcome> {
        self.termination
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }

    /// True when the command never reached the OS or the OS refused it.
    pub fn never_ran(&self) -> bool {
        matches!(self.exit_code, Some(EXIT_SPAWN_FAILED | EXIT_REJECTED))
    }

    pub fn has_exited(&self) -> bool {
        self.exit_code.is_some()
    }
}

/// Translate a wait status into the exit-code convention used by
/// [`CommandStatus`]: the real code, or `128 + signal` when killed.
pub(crate) fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|signal| SIGNAL_EXIT_BASE + signal))
        .unwrap_or(EXIT_SPAWN_FAILED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn sentinel_statuses_carry_a_message() {
        let status = CommandStatus::spawn_failed(
            CommandSpec::new(["/nonexistent"]),
            "No such file or directory",
        );
        assert_eq!(status.exit_code(), Some(EXIT_SPAWN_FAILED));
        assert!(status.never_ran());
        assert!(!status.is_success());
        assert_eq!(status.pid(), Pid::NOT_FOUND);
        assert!(status.stderr_lossy().contains("No such file"));
    }

    #[test]
    fn signalled_exit_maps_above_128() {
        let killed = std::process::ExitStatus::from_raw(libc::SIGKILL);
        assert_eq!(exit_code_of(killed), 128 + libc::SIGKILL);

        let normal = std::process::ExitStatus::from_raw(3 << 8);
        assert_eq!(exit_code_of(normal), 3);
    }

    #[test]
    fn running_status_has_no_exit_code() {
        let status = CommandStatus::running(CommandSpec::new(["sleep", "9"]), Pid::new(10), Utc::now());
        assert!(!status.has_exited());
        assert!(!status.never_ran());
    }
}
