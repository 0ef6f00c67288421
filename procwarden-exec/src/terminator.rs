//! Signal delivery and the graceful-then-forceful stop protocol.
//!
//! Escalation:
//! 1. send the graceful signal (TERM unless configured otherwise), poll for
//!    exit every `poll_interval` for up to `term_timeout`;
//! 2. send KILL, poll again for up to `kill_timeout`;
//! 3. still alive: [`StopOutcome::Failed`], logged at error level and
//!    recorded as [`ProcessState::StopFailed`]. Never reported as success.
//!
//! In group mode signals go to the process group by id and a step only
//! counts as done once no member of the group is left running.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use procwarden_config::{DiscoveryConfig, TerminationConfig};
use procwarden_exec_events::{
    EventSink, LockReleasedEvent, ProcessEvent, ProcessRef, SignalEvent, StopKind, StoppedEvent,
};
use tokio::time::Instant;

use crate::discovery;
use crate::lock::{self, LockRemoval};
use crate::os::ProcessOs;
use crate::pid::Pid;
use crate::process::{ProcessHandle, ProcessState, StopOutcome};
use crate::process_group::Delivery;
use crate::signal::Signal;
use crate::spec::Signature;
use crate::table::ProcessTable;

/// Ends processes by pid or by signature. Cheap to clone; clones share the
/// table, OS interface and event sink.
#[derive(Clone)]
pub struct Terminator {
    table: Arc<ProcessTable>,
    os: Arc<dyn ProcessOs>,
    sink: Arc<dyn EventSink>,
    config: TerminationConfig,
    discovery: DiscoveryConfig,
    default_signal: Signal,
}

impl fmt::Debug for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Terminator")
            .field("config", &self.config)
            .field("default_signal", &self.default_signal)
            .finish_non_exhaustive()
    }
}

enum Sent {
    Delivered,
    Gone,
    Refused,
}

impl Terminator {
    pub fn new(
        table: Arc<ProcessTable>,
        os: Arc<dyn ProcessOs>,
        sink: Arc<dyn EventSink>,
        config: TerminationConfig,
        discovery: DiscoveryConfig,
    ) -> Self {
        let default_signal = config.default_signal.parse().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "invalid termination.default_signal, using TERM");
            Signal::Term
        });
        Self {
            table,
            os,
            sink,
            config,
            discovery,
            default_signal,
        }
    }

    pub fn default_signal(&self) -> Signal {
        self.default_signal
    }

    pub fn config(&self) -> &TerminationConfig {
        &self.config
    }

    /// Send `signal` to `pid`.
    ///
    /// Returns whether the OS accepted the signal, not whether the process
    /// exited. Invalid pids and processes that are no longer running yield
    /// `false`, so stopping twice is a harmless no-op.
    pub fn stop(&self, pid: Pid, signal: Signal) -> bool {
        self.deliver(pid, signal, false)
    }

    /// [`Terminator::stop`] against the whole process group of `pid`. A
    /// process sharing our own group is signalled alone.
    pub fn stop_group(&self, pid: Pid, signal: Signal) -> bool {
        self.deliver(pid, signal, true)
    }

    /// Signal every process whose command line matches `signature`.
    ///
    /// `false` when nothing matched; otherwise `true` only if every signal
    /// was accepted.
    pub fn kill(&self, signature: &Signature, signal: Signal) -> bool {
        let matches = discovery::find_blocking(self.os.as_ref(), signature, &self.discovery);
        if matches.is_empty() {
            tracing::debug!(signature = %signature, "no process matches, nothing to kill");
            return false;
        }
        let mut all_delivered = true;
        for info in matches {
            all_delivered &= self.stop(info.pid, signal);
        }
        all_delivered
    }

    /// Escalate against `pid` starting with the default signal.
    pub async fn terminate(&self, pid: Pid) -> StopOutcome {
        self.terminate_with(pid, self.default_signal, false).await
    }

    pub async fn terminate_with(&self, pid: Pid, signal: Signal, group: bool) -> StopOutcome {
        if !pid.is_valid() {
            return StopOutcome::AlreadyExited;
        }
        let handle = self.table.lookup_by_pid(pid);
        let group = if group { self.os.group_of(pid) } else { None };
        let tracked = handle.clone();
        let os = Arc::clone(&self.os);
        let exited = move || tracked.as_ref().is_some_and(|h| h.has_exited()) || !os.is_alive(pid);
        self.escalate(pid, handle, signal, group, exited).await
    }

    /// Blocking form of [`Terminator::terminate`] for callers without a
    /// runtime. Must not be called from inside an async context.
    pub fn terminate_blocking(&self, pid: Pid) -> StopOutcome {
        match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
        {
            Ok(runtime) => runtime.block_on(self.terminate(pid)),
            Err(err) => {
                tracing::error!(pid = %pid, error = %err, "cannot start runtime for termination");
                StopOutcome::Failed
            }
        }
    }

    /// Escalate against `pid`, then remove `lock_file` if termination was
    /// confirmed. A lock held by a process that could not be stopped is left
    /// in place. Returns whether termination was confirmed.
    pub async fn terminate_and_release(&self, pid: Pid, lock_file: &Path) -> bool {
        let outcome = self.terminate(pid).await;
        if !outcome.confirmed() {
            tracing::error!(
                pid = %pid,
                lock = %lock_file.display(),
                "keeping lock file, process termination not confirmed"
            );
            return false;
        }
        self.release_lock(lock_file, Some(pid));
        true
    }

    /// Delete-if-exists cleanup of a lock file; failures are logged only.
    pub fn release_lock(&self, lock_file: &Path, pid: Option<Pid>) -> LockRemoval {
        let removal = lock::remove_lock_file(lock_file);
        if removal == LockRemoval::Removed {
            self.emit(ProcessEvent::LockReleased(LockReleasedEvent {
                path: lock_file.display().to_string(),
                pid: pid.map(Pid::as_raw),
            }));
        }
        removal
    }

    /// The escalation protocol against `pid`, or against process group
    /// `group` when one is given. `exited` is polled to observe the exit of
    /// `pid` itself; the executor passes a check that also reaps its own
    /// child.
    pub(crate) async fn escalate<F>(
        &self,
        pid: Pid,
        handle: Option<Arc<ProcessHandle>>,
        first: Signal,
        group: Option<Pid>,
        mut exited: F,
    ) -> StopOutcome
    where
        F: FnMut() -> bool,
    {
        let os = Arc::clone(&self.os);
        // The leader check runs first so the executor reaps its child before
        // the group is inspected.
        let mut exited = move || exited() && group.is_none_or(|pgid| !os.is_group_alive(pgid));

        if exited() {
            return self.finish(pid, StopOutcome::AlreadyExited);
        }

        let mark = |state| {
            if let Some(handle) = &handle {
                handle.transition(state);
            }
        };
        mark(ProcessState::StopRequested);
        self.emit(ProcessEvent::StopRequested(signal_event(
            pid,
            first,
            group.is_some(),
        )));

        if first != Signal::Kill {
            match self.send(pid, first, group) {
                Sent::Delivered => {
                    mark(ProcessState::SignaledTerm);
                    if self
                        .wait_for_exit(self.config.term_timeout(), &mut exited)
                        .await
                    {
                        return self.finish(pid, StopOutcome::ExitedAfterTerm);
                    }
                    tracing::warn!(
                        pid = %pid,
                        signal = %first,
                        timeout_ms = self.config.term_timeout_ms,
                        "process ignored graceful signal, escalating to KILL"
                    );
                }
                Sent::Gone if exited() => {
                    return self.finish(pid, StopOutcome::AlreadyExited);
                }
                Sent::Gone | Sent::Refused => {}
            }
        }

        match self.send(pid, Signal::Kill, group) {
            Sent::Delivered => mark(ProcessState::SignaledKill),
            Sent::Gone if exited() => {
                return self.finish(pid, StopOutcome::ExitedAfterTerm);
            }
            Sent::Gone | Sent::Refused => {}
        }
        if self
            .wait_for_exit(self.config.kill_timeout(), &mut exited)
            .await
        {
            return self.finish(pid, StopOutcome::ExitedAfterKill);
        }

        tracing::error!(
            pid = %pid,
            timeout_ms = self.config.kill_timeout_ms,
            "process survived KILL, termination could not be confirmed"
        );
        if let Some(handle) = &handle {
            if handle.state() != ProcessState::SignaledKill {
                handle.transition(ProcessState::SignaledKill);
            }
            handle.transition(ProcessState::StopFailed);
        }
        self.emit(ProcessEvent::StopFailed(ProcessRef {
            pid: pid.as_raw(),
            signature: handle
                .as_ref()
                .map(|h| h.signature().to_string())
                .unwrap_or_default(),
        }));
        StopOutcome::Failed
    }

    async fn wait_for_exit<F>(&self, window: Duration, exited: &mut F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + window;
        loop {
            if exited() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.poll_interval().min(deadline - now)).await;
        }
    }

    fn deliver(&self, pid: Pid, signal: Signal, group: bool) -> bool {
        if !pid.is_valid() {
            tracing::debug!(pid = %pid, "refusing to signal invalid pid");
            return false;
        }
        if !self.os.is_alive(pid) {
            tracing::debug!(pid = %pid, signal = %signal, "process not running, nothing to stop");
            return false;
        }

        let handle = self.table.lookup_by_pid(pid);
        if signal.is_terminating() {
            if let Some(handle) = &handle {
                handle.transition(ProcessState::StopRequested);
            }
            self.emit(ProcessEvent::StopRequested(signal_event(pid, signal, group)));
        }

        let target_group = if group { self.os.group_of(pid) } else { None };
        let delivered = matches!(self.send(pid, signal, target_group), Sent::Delivered);
        if delivered
            && signal.is_terminating()
            && let Some(handle) = &handle
        {
            handle.transition(if signal == Signal::Kill {
                ProcessState::SignaledKill
            } else {
                ProcessState::SignaledTerm
            });
        }
        delivered
    }

    fn send(&self, pid: Pid, signal: Signal, group: Option<Pid>) -> Sent {
        tracing::info!(pid = %pid, signal = %signal, pgid = ?group, "sending signal to process");
        let result = match group {
            Some(pgid) => self.os.send_group_signal(pgid, signal),
            None => self.os.send_signal(pid, signal),
        };
        match result {
            Ok(Delivery::Delivered) => {
                self.emit(ProcessEvent::Signaled(signal_event(
                    pid,
                    signal,
                    group.is_some(),
                )));
                Sent::Delivered
            }
            Ok(Delivery::NoSuchProcess) => {
                tracing::debug!(pid = %pid, signal = %signal, "process vanished before signal");
                Sent::Gone
            }
            Err(err) => {
                tracing::warn!(pid = %pid, signal = %signal, error = %err, "signal delivery refused");
                Sent::Refused
            }
        }
    }

    fn finish(&self, pid: Pid, outcome: StopOutcome) -> StopOutcome {
        let kind = match outcome {
            StopOutcome::AlreadyExited => StopKind::AlreadyExited,
            StopOutcome::ExitedAfterTerm => StopKind::AfterTerm,
            StopOutcome::ExitedAfterKill => StopKind::AfterKill,
            StopOutcome::Failed => return outcome,
        };
        tracing::debug!(pid = %pid, outcome = ?outcome, "process stopped");
        self.emit(ProcessEvent::Stopped(StoppedEvent {
            pid: pid.as_raw(),
            kind,
        }));
        outcome
    }

    pub(crate) fn emit(&self, event: ProcessEvent) {
        self.sink.emit(&event);
    }
}

fn signal_event(pid: Pid, signal: Signal, group: bool) -> SignalEvent {
    SignalEvent {
        pid: pid.as_raw(),
        signal: signal.name().to_string(),
        group,
    }
}
