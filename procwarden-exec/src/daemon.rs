//! Supervision of one long-running, connection-oriented daemon (a `pppd`
//! per dial-up interface, for example).
//!
//! At most one instance runs per signature. An instance left behind by a
//! previous run of the service is found through the OS process list, so a
//! restart neither double-spawns nor loses the ability to stop it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::discovery;
use crate::executor::Executor;
use crate::lock;
use crate::pid::Pid;
use crate::spec::{CommandSpec, Signature};
use crate::status::CommandStatus;

#[derive(Debug)]
pub struct DaemonSupervisor {
    executor: Arc<Executor>,
    spec: CommandSpec,
    lock_file: Option<PathBuf>,
}

impl DaemonSupervisor {
    /// `spec` is always run exclusive and detached.
    pub fn new(executor: Arc<Executor>, spec: CommandSpec) -> Self {
        Self {
            executor,
            spec: spec.exclusive(true).detached(true),
            lock_file: None,
        }
    }

    /// Serial device whose UUCP lock the daemon holds; released after a
    /// confirmed stop.
    pub fn with_serial_lock(mut self, lock_dir: &Path, device: &str) -> Self {
        self.lock_file = Some(lock::serial_lock_path(lock_dir, device));
        self
    }

    pub fn signature(&self) -> Signature {
        self.spec.signature()
    }

    pub fn lock_file(&self) -> Option<&Path> {
        self.lock_file.as_deref()
    }

    /// Start the daemon unless an instance is already alive.
    pub fn start(&self) -> CommandStatus {
        if let Some(pid) = self.pid() {
            return self.executor.refuse(
                self.spec.clone(),
                format!("`{}` is already running as pid {pid}", self.signature()),
            );
        }
        self.executor.execute(self.spec.clone())
    }

    /// Tracked instance first, then the OS process list.
    pub fn pid(&self) -> Option<Pid> {
        let signature = self.signature();
        if let Some(handle) = self.executor.table().lookup(&signature) {
            return Some(handle.pid());
        }
        discovery::scan(self.executor.os().as_ref(), &signature)
            .first()
            .map(|info| info.pid)
    }

    pub fn is_running(&self) -> bool {
        self.pid().is_some()
    }

    /// Stop every instance with escalation, then release the lock file.
    ///
    /// `false` when any instance could not be confirmed dead; the lock file
    /// is kept in that case. A lock recorded by some other live process is
    /// never removed.
    pub async fn stop(&self) -> bool {
        let signature = self.signature();
        let mut pids = self
            .executor
            .table()
            .lookup_all(&signature)
            .iter()
            .map(|handle| handle.pid())
            .collect::<Vec<_>>();
        pids.extend(
            self.executor
                .find_pids(&signature)
                .await
                .into_iter()
                .map(|info| info.pid),
        );
        pids.sort_unstable();
        pids.dedup();

        if pids.is_empty() {
            tracing::debug!(signature = %signature, "daemon not running");
        }

        let terminator = self.executor.terminator();
        let mut confirmed = true;
        for &pid in &pids {
            confirmed &= terminator.terminate(pid).await.confirmed();
        }
        if !confirmed {
            tracing::error!(signature = %signature, "daemon did not stop, keeping its lock file");
            return false;
        }

        if let Some(lock_file) = &self.lock_file {
            match lock::lock_owner(lock_file) {
                Some(owner) if !pids.contains(&owner) && self.executor.is_running(owner) => {
                    tracing::warn!(
                        lock = %lock_file.display(),
                        owner = %owner,
                        "lock file belongs to another live process, leaving it"
                    );
                }
                owner => {
                    terminator.release_lock(lock_file, owner);
                }
            }
        }
        true
    }
}
