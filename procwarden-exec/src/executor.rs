//! Turns a [`CommandSpec`] into a supervised OS process and, eventually,
//! into a [`CommandStatus`].
//!
//! Forks happen on the executor's spawner thread; waiting, output draining
//! and timeout escalation run on the executor's worker pool. The pool is
//! either a multi-thread runtime owned by the executor (sized by
//! `executor.worker_threads`) or an existing runtime reached through a
//! [`Handle`]. Attached children die with the executor, not with the thread
//! that submitted them.
//!
//! Every child leads its own process group. A timeout or shutdown escalates
//! against that whole group and only completes once no member is left.
//!
//! For every attached process the table entry is removed after exit was
//! observed and before the status is handed back, so `is_running(pid)` on a
//! returned status is always `false`.

use std::fmt;
use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use procwarden_config::{DiscoveryConfig, ExecutorConfig, ProcwardenConfig};
use procwarden_exec_events::{
    EventSink, ExitedEvent, NoopSink, ProcessEvent, ProcessRef, RejectedEvent, SpawnFailedEvent,
    SpawnedEvent,
};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::discovery;
use crate::os::{self, ProcessInfo, ProcessOs};
use crate::pid::Pid;
use crate::pipe::SpawnedChild;
use crate::process::{ProcessHandle, StopOutcome};
use crate::spawner::Spawner;
use crate::spec::{CommandSpec, Signature};
use crate::status::{CommandStatus, Completion, exit_code_of};
use crate::table::ProcessTable;
use crate::terminator::Terminator;

/// State shared between the executor and its supervision tasks.
struct Shared {
    config: ExecutorConfig,
    discovery: DiscoveryConfig,
    table: Arc<ProcessTable>,
    os: Arc<dyn ProcessOs>,
    sink: Arc<dyn EventSink>,
    terminator: Terminator,
    shutdown: CancellationToken,
}

impl Shared {
    fn emit(&self, event: ProcessEvent) {
        self.sink.emit(&event);
    }

    /// Output, unregister, event. Called once the exit code is known.
    async fn finish(
        &self,
        handle: &ProcessHandle,
        readers: Vec<JoinHandle<()>>,
        exit_code: Option<i32>,
    ) {
        close_readers(readers, self.config.drain_grace()).await;
        if let Some(code) = exit_code {
            handle.mark_exited(code);
        }
        self.table.unregister_pid(handle.pid());

        let elapsed_ms = u64::try_from(handle.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::debug!(
            pid = %handle.pid(),
            exit_code = ?exit_code,
            timed_out = handle.timed_out(),
            elapsed_ms,
            "process exited"
        );
        self.emit(ProcessEvent::Exited(ExitedEvent {
            pid: handle.pid().as_raw(),
            signature: handle.signature().to_string(),
            exit_code,
            timed_out: handle.timed_out(),
            elapsed_ms,
        }));
    }
}

struct Pool {
    handle: Handle,
    runtime: Option<Runtime>,
}

/// Spawns and supervises commands.
pub struct Executor {
    pool: Pool,
    spawner: Spawner,
    shared: Arc<Shared>,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.shared.config)
            .field("owns_runtime", &self.pool.runtime.is_some())
            .field("tracked", &self.shared.table.len())
            .field("shut_down", &self.shared.shutdown.is_cancelled())
            .finish()
    }
}

/// Configures an [`Executor`] before it starts its pool.
pub struct ExecutorBuilder {
    config: ProcwardenConfig,
    os: Option<Arc<dyn ProcessOs>>,
    sink: Option<Arc<dyn EventSink>>,
    handle: Option<Handle>,
}

impl ExecutorBuilder {
    /// Replace the OS interface (tests inject fakes here).
    pub fn os(mut self, os: Arc<dyn ProcessOs>) -> Self {
        self.os = Some(os);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Run supervision on an existing runtime instead of an owned pool.
    pub fn runtime_handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn build(self) -> io::Result<Executor> {
        let ProcwardenConfig {
            executor,
            termination,
            discovery,
            ..
        } = self.config;

        let pool = match self.handle {
            Some(handle) => Pool {
                handle,
                runtime: None,
            },
            None => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(executor.worker_threads.max(1))
                    .thread_name("procwarden-worker")
                    .enable_all()
                    .build()?;
                Pool {
                    handle: runtime.handle().clone(),
                    runtime: Some(runtime),
                }
            }
        };

        let spawner = Spawner::start(pool.handle.clone(), executor.clone())?;
        let os = self.os.unwrap_or_else(os::default_os);
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(NoopSink) as Arc<dyn EventSink>);
        let table = Arc::new(ProcessTable::new(Arc::clone(&os)));
        let terminator = Terminator::new(
            Arc::clone(&table),
            Arc::clone(&os),
            Arc::clone(&sink),
            termination,
            discovery.clone(),
        );

        tracing::debug!(
            worker_threads = executor.worker_threads,
            owns_runtime = pool.runtime.is_some(),
            "executor started"
        );

        Ok(Executor {
            pool,
            spawner,
            shared: Arc::new(Shared {
                config: executor,
                discovery,
                table,
                os,
                sink,
                terminator,
                shutdown: CancellationToken::new(),
            }),
        })
    }
}

impl Executor {
    pub fn builder(config: ProcwardenConfig) -> ExecutorBuilder {
        ExecutorBuilder {
            config,
            os: None,
            sink: None,
            handle: None,
        }
    }

    /// Executor with its own worker pool, the platform OS interface and no
    /// event sink.
    pub fn new(config: ProcwardenConfig) -> io::Result<Self> {
        Self::builder(config).build()
    }

    /// Run `spec` and block until it exits, times out, or is left running
    /// (detached specs).
    ///
    /// Never fails: refusals and spawn errors come back as sentinel statuses.
    /// Must not be called from a task of the executor's own pool.
    pub fn execute(&self, spec: CommandSpec) -> CommandStatus {
        self.execute_with_cancel(spec, CancellationToken::new())
    }

    /// [`Executor::execute`] whose wait can be abandoned through `cancel`.
    /// The process itself is not touched; it is reaped in the background.
    pub fn execute_with_cancel(&self, spec: CommandSpec, cancel: CancellationToken) -> CommandStatus {
        let fallback = spec.clone();
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        self.start(spec, cancel, move |status| {
            let _ = tx.send(status);
        });
        rx.recv().unwrap_or_else(|_| {
            CommandStatus::rejected(fallback, "executor stopped before the command completed")
        })
    }

    /// Spawn `spec` and return its pid immediately (or [`Pid::NOT_FOUND`]
    /// when nothing was spawned). `on_complete` runs exactly once on a pool
    /// task with the final status, after the table entry is removed.
    pub fn execute_async<F>(&self, spec: CommandSpec, on_complete: F) -> Pid
    where
        F: FnOnce(CommandStatus) + Send + 'static,
    {
        self.start(spec, CancellationToken::new(), on_complete)
    }

    /// Async form of [`Executor::execute`].
    pub async fn run(&self, spec: CommandSpec) -> CommandStatus {
        self.run_with_cancel(spec, CancellationToken::new()).await
    }

    pub async fn run_with_cancel(&self, spec: CommandSpec, cancel: CancellationToken) -> CommandStatus {
        let fallback = spec.clone();
        let (tx, rx) = oneshot::channel();
        self.start(spec, cancel, move |status| {
            let _ = tx.send(status);
        });
        rx.await.unwrap_or_else(|_| {
            CommandStatus::rejected(fallback, "executor stopped before the command completed")
        })
    }

    /// Refuse new commands and terminate every supervised process with the
    /// escalation protocol. Detached processes are left alone.
    pub fn shutdown(&self) {
        if !self.shared.shutdown.is_cancelled() {
            tracing::info!(tracked = self.shared.table.len(), "executor shutting down");
        }
        self.shared.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Processes in the OS process list whose command line is exactly
    /// `signature`, including ones this executor did not spawn. Empty
    /// results are retried `discovery.lookup_attempts` times.
    pub fn get_pids(&self, signature: &Signature) -> Vec<ProcessInfo> {
        discovery::find_blocking(self.shared.os.as_ref(), signature, &self.shared.discovery)
    }

    /// Async form of [`Executor::get_pids`].
    pub async fn find_pids(&self, signature: &Signature) -> Vec<ProcessInfo> {
        discovery::find(self.shared.os.as_ref(), signature, &self.shared.discovery).await
    }

    pub fn pids(&self, signature: &Signature) -> Vec<Pid> {
        self.get_pids(signature)
            .into_iter()
            .map(|info| info.pid)
            .collect()
    }

    pub fn is_running(&self, pid: Pid) -> bool {
        pid.is_valid() && self.shared.os.is_alive(pid)
    }

    pub fn is_running_command(&self, signature: &Signature) -> bool {
        !self.get_pids(signature).is_empty()
    }

    pub fn table(&self) -> &Arc<ProcessTable> {
        &self.shared.table
    }

    /// Terminator sharing this executor's table, OS interface and sink.
    pub fn terminator(&self) -> &Terminator {
        &self.shared.terminator
    }

    pub fn os(&self) -> &Arc<dyn ProcessOs> {
        &self.shared.os
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.shared.config
    }

    pub fn runtime(&self) -> &Handle {
        &self.pool.handle
    }

    fn start<F>(&self, spec: CommandSpec, cancel: CancellationToken, on_complete: F) -> Pid
    where
        F: FnOnce(CommandStatus) + Send + 'static,
    {
        let shared = &self.shared;

        if let Err(err) = spec.validate() {
            return self.reject(spec, err.to_string(), on_complete);
        }
        if shared.shutdown.is_cancelled() {
            return self.reject(spec, "executor is shut down".to_string(), on_complete);
        }

        let signature = spec.signature();
        let claim = if spec.is_exclusive() {
            match shared.table.claim(signature.clone()) {
                Ok(claim) => Some(claim),
                Err(err) => return self.reject(spec, err.to_string(), on_complete),
            }
        } else {
            None
        };

        let spawned = match self.spawner.spawn(&spec) {
            Ok(spawned) => spawned,
            Err(err) => {
                drop(claim);
                tracing::warn!(signature = %signature, error = %err, "failed to spawn command");
                shared.emit(ProcessEvent::SpawnFailed(SpawnFailedEvent {
                    signature: signature.to_string(),
                    reason: err.to_string(),
                }));
                let status = CommandStatus::spawn_failed(spec, err.to_string());
                self.pool.handle.spawn(async move { on_complete(status) });
                return Pid::NOT_FOUND;
            }
        };

        let handle = Arc::clone(&spawned.handle);
        let pid = handle.pid();
        let registered = match claim {
            Some(claim) => claim.register(Arc::clone(&handle)),
            None => shared.table.register(Arc::clone(&handle)),
        };
        if let Err(err) = registered {
            tracing::warn!(pid = %pid, error = %err, "spawned process could not be tracked");
        }
        handle.mark_running();
        shared.emit(ProcessEvent::Spawned(SpawnedEvent {
            pid: pid.as_raw(),
            signature: signature.to_string(),
            detached: spec.is_detached(),
        }));

        let task_shared = Arc::clone(shared);
        if spec.is_detached() {
            let status = CommandStatus::running(spec, pid, handle.started_at());
            self.pool.handle.spawn(reap(task_shared, spawned));
            self.pool.handle.spawn(async move { on_complete(status) });
        } else {
            self.pool.handle.spawn(async move {
                let status = supervise(task_shared, spawned, spec, cancel).await;
                on_complete(status);
            });
        }
        pid
    }

    fn reject<F>(&self, spec: CommandSpec, reason: String, on_complete: F) -> Pid
    where
        F: FnOnce(CommandStatus) + Send + 'static,
    {
        let status = self.refuse(spec, reason);
        self.pool.handle.spawn(async move { on_complete(status) });
        Pid::NOT_FOUND
    }

    /// Sentinel status for a command refused before any OS call.
    pub(crate) fn refuse(&self, spec: CommandSpec, reason: String) -> CommandStatus {
        let signature = spec.signature();
        tracing::warn!(signature = %signature, reason = %reason, "command rejected");
        self.shared.emit(ProcessEvent::Rejected(RejectedEvent {
            signature: signature.to_string(),
            reason: reason.clone(),
        }));
        CommandStatus::rejected(spec, reason)
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.spawner.stop();
        if let Some(runtime) = self.pool.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

enum Wake {
    Exited(io::Result<ExitStatus>),
    TimedOut,
    Shutdown,
    Abandoned,
}

async fn supervise(
    shared: Arc<Shared>,
    spawned: SpawnedChild,
    spec: CommandSpec,
    cancel: CancellationToken,
) -> CommandStatus {
    let SpawnedChild {
        mut child,
        handle,
        readers,
        started,
    } = spawned;
    let pid = handle.pid();
    let deadline = spec.get_timeout().map(|timeout| started + timeout);

    let wake = tokio::select! {
        biased;
        result = child.wait() => Wake::Exited(result),
        () = shared.shutdown.cancelled() => Wake::Shutdown,
        () = sleep_until(deadline) => Wake::TimedOut,
        () = cancel.cancelled() => Wake::Abandoned,
    };

    let timed_out = matches!(wake, Wake::TimedOut);
    let mut termination = None;
    let exit_code = match wake {
        Wake::Exited(result) => wait_code(pid, result),
        Wake::Abandoned => {
            tracing::debug!(pid = %pid, "wait abandoned, process left running");
            shared.emit(ProcessEvent::Abandoned(ProcessRef {
                pid: pid.as_raw(),
                signature: handle.signature().to_string(),
            }));
            let status = snapshot(&spec, &handle, None, None);
            tokio::spawn(reap(
                Arc::clone(&shared),
                SpawnedChild {
                    child,
                    handle,
                    readers,
                    started,
                },
            ));
            return status;
        }
        Wake::TimedOut | Wake::Shutdown => {
            if timed_out {
                handle.mark_timed_out();
                tracing::warn!(
                    pid = %pid,
                    signature = %handle.signature(),
                    timeout = ?spec.get_timeout(),
                    "command timed out"
                );
                shared.emit(ProcessEvent::TimedOut(ProcessRef {
                    pid: pid.as_raw(),
                    signature: handle.signature().to_string(),
                }));
            } else {
                tracing::info!(pid = %pid, "terminating process for executor shutdown");
            }

            let signal = spec
                .get_signal()
                .unwrap_or_else(|| shared.terminator.default_signal());
            // The child called setsid, so its pid is also its group id.
            let group = Some(pid);
            let os = Arc::clone(&shared.os);
            let mut reaped = None;
            let outcome = shared
                .terminator
                .escalate(pid, Some(Arc::clone(&handle)), signal, group, || {
                    reaped.is_some() || leader_exited(child.try_wait(), pid, os.as_ref(), &mut reaped)
                })
                .await;
            termination = Some(outcome);

            match reaped {
                Some(status) => Some(exit_code_of(status)),
                None if outcome.confirmed() => {
                    match tokio::time::timeout(shared.config.drain_grace(), child.wait()).await {
                        Ok(result) => wait_code(pid, result),
                        Err(_) => None,
                    }
                }
                None => {
                    // Still alive after KILL: keep it tracked until it goes away.
                    let status = snapshot(&spec, &handle, None, termination);
                    tokio::spawn(reap(
                        Arc::clone(&shared),
                        SpawnedChild {
                            child,
                            handle,
                            readers,
                            started,
                        },
                    ));
                    return status;
                }
            }
        }
    };

    shared.finish(&handle, readers, exit_code).await;
    snapshot(&spec, &handle, exit_code, termination)
}

/// Wait for a process nobody is waiting on anymore (detached, abandoned or
/// unkillable) and drop its table entry once it exits.
async fn reap(shared: Arc<Shared>, spawned: SpawnedChild) {
    let SpawnedChild {
        mut child,
        handle,
        readers,
        ..
    } = spawned;
    let exit_code = wait_code(handle.pid(), child.wait().await);
    shared.finish(&handle, readers, exit_code).await;
}

/// Exit check for a child under escalation. A failed `try_wait` defers to the
/// OS process list instead of counting as an exit.
fn leader_exited(
    polled: io::Result<Option<ExitStatus>>,
    pid: Pid,
    os: &dyn ProcessOs,
    reaped: &mut Option<ExitStatus>,
) -> bool {
    match polled {
        Ok(Some(status)) => {
            *reaped = Some(status);
            true
        }
        Ok(None) => false,
        Err(err) => {
            tracing::debug!(pid = %pid, error = %err, "try_wait failed");
            !os.is_alive(pid)
        }
    }
}

fn wait_code(pid: Pid, result: io::Result<ExitStatus>) -> Option<i32> {
    match result {
        Ok(status) => Some(exit_code_of(status)),
        Err(err) => {
            tracing::warn!(pid = %pid, error = %err, "failed to wait for process");
            None
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Give readers `grace` to drain what is left in the pipes, then close them.
/// A grandchild holding the pipe open must not keep the caller waiting.
async fn close_readers(mut readers: Vec<JoinHandle<()>>, grace: Duration) {
    let drained = tokio::time::timeout(grace, async {
        for reader in &mut readers {
            let _ = reader.await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::debug!("output still open after drain grace, closing readers");
        for reader in &readers {
            reader.abort();
        }
    }
}

fn snapshot(
    spec: &CommandSpec,
    handle: &ProcessHandle,
    exit_code: Option<i32>,
    termination: Option<StopOutcome>,
) -> CommandStatus {
    let (stdout, stdout_truncated) = handle.stdout_capture().lock().snapshot();
    let (stderr, stderr_truncated) = handle.stderr_capture().lock().snapshot();
    CommandStatus::completed(
        spec.clone(),
        handle.pid(),
        handle.started_at(),
        handle.elapsed(),
        Completion {
            exit_code,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            timed_out: handle.timed_out(),
            termination,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn failed_try_wait_is_not_taken_as_exit() {
        let os = os::default_os();
        let me = Pid::from(std::process::id());
        let mut reaped = None;

        let error = || Err(io::Error::other("wait failed"));
        assert!(!leader_exited(error(), me, os.as_ref(), &mut reaped));
        assert!(leader_exited(error(), Pid::new(2_000_000_000), os.as_ref(), &mut reaped));
        assert!(reaped.is_none());

        assert!(!leader_exited(Ok(None), me, os.as_ref(), &mut reaped));
        assert!(leader_exited(Ok(Some(ExitStatus::from_raw(0))), me, os.as_ref(), &mut reaped));
        assert_eq!(reaped.map(exit_code_of), Some(0));
    }
}
