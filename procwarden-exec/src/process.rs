//! Shared view of one managed OS process and its lifecycle state machine.
//!
//! The executor's supervision task owns the OS child itself; every other
//! party (the process table, the terminator, callers) sees the process
//! through an `Arc<ProcessHandle>`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::pid::Pid;
use crate::spec::Signature;
use crate::stream::SharedCapture;

/// Lifecycle of a managed process.
///
/// ```text
/// Spawned -> Running -> ExitedNormally
///                    -> StopRequested -> SignaledTerm -> Exited | ExitedTimeout
///                                                     -> SignaledKill -> Exited | ExitedTimeout | StopFailed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    Spawned,
    Running,
    ExitedNormally,
    ExitedTimeout,
    StopRequested,
    SignaledTerm,
    SignaledKill,
    Exited,
    StopFailed,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::ExitedNormally | Self::ExitedTimeout | Self::Exited | Self::StopFailed
        )
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use ProcessState::{
            Exited, ExitedNormally, ExitedTimeout, Running, SignaledKill, SignaledTerm, Spawned,
            StopFailed, StopRequested,
        };
        match (self, next) {
            (Spawned, Running | ExitedNormally | StopRequested) => true,
            (Running, ExitedNormally | ExitedTimeout | StopRequested) => true,
            (StopRequested, SignaledTerm | SignaledKill | Exited | ExitedTimeout) => true,
            (SignaledTerm, SignaledKill | Exited | ExitedTimeout) => true,
            (SignaledKill, Exited | ExitedTimeout | StopFailed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Spawned => "spawned",
            Self::Running => "running",
            Self::ExitedNormally => "exited",
            Self::ExitedTimeout => "exited (timeout)",
            Self::StopRequested => "stop requested",
            Self::SignaledTerm => "signaled (graceful)",
            Self::SignaledKill => "signaled (kill)",
            Self::Exited => "exited (stopped)",
            Self::StopFailed => "stop failed",
        };
        f.write_str(label)
    }
}

/// How an escalated stop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopOutcome {
    /// Nothing was running when the stop started.
    AlreadyExited,
    /// Exited within the window after the graceful signal.
    ExitedAfterTerm,
    /// Needed KILL.
    ExitedAfterKill,
    /// Still alive after KILL; termination could not be confirmed.
    Failed,
}

impl StopOutcome {
    /// False only when the process may still be running.
    pub fn confirmed(self) -> bool {
        !matches!(self, Self::Failed)
    }
}

/// Shared, read-mostly view of a spawned process.
pub struct ProcessHandle {
    pid: Pid,
    signature: Signature,
    detached: bool,
    started_at: DateTime<Utc>,
    started: Instant,
    state: Mutex<ProcessState>,
    exited: AtomicBool,
    timed_out: AtomicBool,
    exit_tx: watch::Sender<Option<i32>>,
    stdout: SharedCapture,
    stderr: SharedCapture,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("signature", &self.signature)
            .field("state", &self.state())
            .field("exit_code", &self.exit_code())
            .finish()
    }
}

impl ProcessHandle {
    pub fn new(
        pid: Pid,
        signature: Signature,
        detached: bool,
        stdout: SharedCapture,
        stderr: SharedCapture,
    ) -> Self {
        let (exit_tx, _) = watch::channel(None);
        Self {
            pid,
            signature,
            detached,
            started_at: Utc::now(),
            started: Instant::now(),
            state: Mutex::new(ProcessState::Spawned),
            exited: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            exit_tx,
            stdout,
            stderr,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock()
    }

    /// Apply a state transition; invalid transitions are ignored and reported
    /// as `false`.
    pub fn transition(&self, next: ProcessState) -> bool {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            tracing::trace!(pid = %self.pid, from = %*state, to = %next, "ignoring state transition");
            return false;
        }
        tracing::trace!(pid = %self.pid, from = %*state, to = %next, "process state change");
        *state = next;
        true
    }

    /// True once the process was reaped by its supervision task.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_tx.borrow()
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    /// Output captured so far: `(stdout, stderr)`.
    pub fn output(&self) -> (Vec<u8>, Vec<u8>) {
        (self.stdout.lock().snapshot().0, self.stderr.lock().snapshot().0)
    }

    /// Resolve once the process has been reaped, with its exit code.
    pub async fn wait_exit(&self) -> Option<i32> {
        let mut rx = self.exit_tx.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(code) => *code,
            Err(_) => self.exit_code(),
        }
    }

    pub(crate) fn mark_running(&self) {
        self.transition(ProcessState::Running);
    }

    pub(crate) fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
    }

    /// Record the reaped exit code and move to the matching terminal state.
    pub(crate) fn mark_exited(&self, code: i32) {
        self.exited.store(true, Ordering::SeqCst);
        self.exit_tx.send_replace(Some(code));

        let next = {
            let state = self.state();
            if self.timed_out() {
                ProcessState::ExitedTimeout
            } else if matches!(state, ProcessState::Spawned | ProcessState::Running) {
                ProcessState::ExitedNormally
            } else {
                ProcessState::Exited
            }
        };
        self.transition(next);
    }

    pub(crate) fn stdout_capture(&self) -> &SharedCapture {
        &self.stdout
    }

    pub(crate) fn stderr_capture(&self) -> &SharedCapture {
        &self.stderr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::shared_capture;

    fn handle() -> ProcessHandle {
        ProcessHandle::new(
            Pid::new(4242),
            Signature::from("sleep 30"),
            false,
            shared_capture(16),
            shared_capture(16),
        )
    }

    #[test]
    fn normal_exit_path() {
        let handle = handle();
        handle.mark_running();
        assert_eq!(handle.state(), ProcessState::Running);
        handle.mark_exited(0);
        assert_eq!(handle.state(), ProcessState::ExitedNormally);
        assert!(handle.has_exited());
        assert_eq!(handle.exit_code(), Some(0));
    }

    #[test]
    fn timeout_escalation_path() {
        let handle = handle();
        handle.mark_running();
        handle.mark_timed_out();
        assert!(handle.transition(ProcessState::StopRequested));
        assert!(handle.transition(ProcessState::SignaledTerm));
        assert!(handle.transition(ProcessState::SignaledKill));
        handle.mark_exited(137);
        assert_eq!(handle.state(), ProcessState::ExitedTimeout);
    }

    #[test]
    fn stop_failed_is_never_rewritten() {
        let handle = handle();
        handle.mark_running();
        assert!(handle.transition(ProcessState::StopRequested));
        assert!(handle.transition(ProcessState::SignaledKill));
        assert!(handle.transition(ProcessState::StopFailed));

        handle.mark_exited(137);
        assert_eq!(handle.state(), ProcessState::StopFailed);
        assert!(!handle.transition(ProcessState::Exited));
        assert!(ProcessState::StopFailed.is_terminal());
    }

    #[test]
    fn outcome_confirmation() {
        assert!(StopOutcome::AlreadyExited.confirmed());
        assert!(StopOutcome::ExitedAfterKill.confirmed());
        assert!(!StopOutcome::Failed.confirmed());
    }

    #[tokio::test]
    async fn wait_exit_resolves_after_mark() {
        let handle = std::sync::Arc::new(handle());
        let waiter = {
            let handle = std::sync::Arc::clone(&handle);
            tokio::spawn(async move { handle.wait_exit().await })
        };
        handle.mark_exited(3);
        assert_eq!(waiter.await.ok().flatten(), Some(3));
    }
}
