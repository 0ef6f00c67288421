//! Registry of in-flight processes, indexed by pid and by signature.
//!
//! Registration policy:
//! - Plain commands may run any number of times; every live instance is
//!   tracked under the same signature.
//! - Exclusive commands (connection daemons and other per-interface
//!   singletons) reserve their signature with [`ProcessTable::claim`] before
//!   spawning. The claim fails while a live instance is tracked or while
//!   another exclusive spawn of the same signature is in progress.
//!
//! Entries whose process exited without going through the executor (or that
//! the OS no longer reports alive) are stale and are purged on the next
//! lookup touching them.

use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;

use crate::os::ProcessOs;
use crate::pid::Pid;
use crate::process::ProcessHandle;
use crate::spec::Signature;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("`{signature}` is already running as pid {pid}")]
    AlreadyRunning { signature: Signature, pid: Pid },
    #[error("`{signature}` is already being started")]
    AlreadyStarting { signature: Signature },
    #[error("pid {pid} is already tracked")]
    DuplicatePid { pid: Pid },
}

#[derive(Debug, Default)]
struct Entries {
    by_pid: HashMap<Pid, Arc<ProcessHandle>>,
    /// Registration order; the last pid is the most recent instance.
    by_signature: HashMap<Signature, Vec<Pid>>,
    claims: HashSet<Signature>,
}

impl Entries {
    fn insert(&mut self, handle: Arc<ProcessHandle>) {
        let pid = handle.pid();
        self.by_signature
            .entry(handle.signature().clone())
            .or_default()
            .push(pid);
        self.by_pid.insert(pid, handle);
    }

    fn remove_pid(&mut self, pid: Pid) -> Option<Arc<ProcessHandle>> {
        let handle = self.by_pid.remove(&pid)?;
        if let Some(pids) = self.by_signature.get_mut(handle.signature()) {
            pids.retain(|tracked| *tracked != pid);
            if pids.is_empty() {
                self.by_signature.remove(handle.signature());
            }
        }
        Some(handle)
    }

    fn pids_for(&self, signature: &Signature) -> Vec<Pid> {
        self.by_signature.get(signature).cloned().unwrap_or_default()
    }
}

/// Thread-safe process registry shared by the executor and terminator.
#[derive(Debug)]
pub struct ProcessTable {
    entries: RwLock<Entries>,
    os: Arc<dyn ProcessOs>,
}

impl ProcessTable {
    pub fn new(os: Arc<dyn ProcessOs>) -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            os,
        }
    }

    fn is_stale(&self, handle: &ProcessHandle) -> bool {
        handle.has_exited() || !self.os.is_alive(handle.pid())
    }

    fn purge_signature(&self, entries: &mut Entries, signature: &Signature) {
        for pid in entries.pids_for(signature) {
            let stale = entries
                .by_pid
                .get(&pid)
                .is_some_and(|handle| self.is_stale(handle));
            if stale {
                tracing::debug!(pid = %pid, signature = %signature, "purging stale process entry");
                entries.remove_pid(pid);
            }
        }
    }

    /// Reserve `signature` for an exclusive spawn.
    pub fn claim(&self, signature: Signature) -> Result<Claim<'_>, TableError> {
        let mut entries = self.entries.write();
        self.purge_signature(&mut entries, &signature);
        if let Some(pid) = entries.pids_for(&signature).last().copied() {
            return Err(TableError::AlreadyRunning { signature, pid });
        }
        if !entries.claims.insert(signature.clone()) {
            return Err(TableError::AlreadyStarting { signature });
        }
        Ok(Claim {
            table: self,
            signature,
            released: false,
        })
    }

    /// Track a spawned process. A pid can only be tracked once while its
    /// process is alive; a stale entry for a recycled pid is replaced.
    pub fn register(&self, handle: Arc<ProcessHandle>) -> Result<(), TableError> {
        let mut entries = self.entries.write();
        self.insert_checked(&mut entries, handle)
    }

    fn insert_checked(
        &self,
        entries: &mut Entries,
        handle: Arc<ProcessHandle>,
    ) -> Result<(), TableError> {
        let pid = handle.pid();
        if let Some(existing) = entries.by_pid.get(&pid) {
            if !self.is_stale(existing) {
                return Err(TableError::DuplicatePid { pid });
            }
            entries.remove_pid(pid);
        }
        tracing::trace!(pid = %pid, signature = %handle.signature(), "registered process");
        entries.insert(handle);
        Ok(())
    }

    /// Remove every entry for `signature`. Removing an unknown signature is a
    /// no-op.
    pub fn unregister(&self, signature: &Signature) -> Vec<Arc<ProcessHandle>> {
        let mut entries = self.entries.write();
        entries
            .pids_for(signature)
            .into_iter()
            .filter_map(|pid| entries.remove_pid(pid))
            .collect()
    }

    /// Remove one process, leaving other instances of its signature alone.
    pub fn unregister_pid(&self, pid: Pid) -> Option<Arc<ProcessHandle>> {
        self.entries.write().remove_pid(pid)
    }

    /// Most recently registered live instance of `signature`.
    pub fn lookup(&self, signature: &Signature) -> Option<Arc<ProcessHandle>> {
        let mut entries = self.entries.write();
        self.purge_signature(&mut entries, signature);
        let pid = entries.pids_for(signature).last().copied()?;
        entries.by_pid.get(&pid).cloned()
    }

    /// Every live instance of `signature`, oldest first.
    pub fn lookup_all(&self, signature: &Signature) -> Vec<Arc<ProcessHandle>> {
        let mut entries = self.entries.write();
        self.purge_signature(&mut entries, signature);
        entries
            .pids_for(signature)
            .iter()
            .filter_map(|pid| entries.by_pid.get(pid).cloned())
            .collect()
    }

    pub fn lookup_by_pid(&self, pid: Pid) -> Option<Arc<ProcessHandle>> {
        let mut entries = self.entries.write();
        let handle = entries.by_pid.get(&pid).cloned()?;
        if self.is_stale(&handle) {
            tracing::debug!(pid = %pid, "purging stale process entry");
            entries.remove_pid(pid);
            return None;
        }
        Some(handle)
    }

    /// Snapshot of every tracked handle, stale or not.
    pub fn handles(&self) -> Vec<Arc<ProcessHandle>> {
        self.entries.read().by_pid.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().by_pid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().by_pid.is_empty()
    }
}

/// Reservation of a signature for one exclusive spawn. Dropping it without
/// calling [`Claim::register`] releases the signature.
#[must_use = "dropping a claim releases the signature"]
#[derive(Debug)]
pub struct Claim<'a> {
    table: &'a ProcessTable,
    signature: Signature,
    released: bool,
}

impl Claim<'_> {
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Convert the reservation into a tracked entry atomically.
    pub fn register(mut self, handle: Arc<ProcessHandle>) -> Result<(), TableError> {
        let mut entries = self.table.entries.write();
        entries.claims.remove(&self.signature);
        self.released = true;
        self.table.insert_checked(&mut entries, handle)
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.table.entries.write().claims.remove(&self.signature);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::ProcessInfo;
    use crate::stream::shared_capture;
    use std::io;

    #[derive(Debug, Default)]
    struct DeadSet(parking_lot::Mutex<HashSet<Pid>>);

    impl ProcessOs for DeadSet {
        fn enumerate_processes(&self) -> io::Result<Vec<ProcessInfo>> {
            Ok(Vec::new())
        }

        fn is_alive(&self, pid: Pid) -> bool {
            !self.0.lock().contains(&pid)
        }
    }

    fn handle(pid: i32, signature: &str) -> Arc<ProcessHandle> {
        Arc::new(ProcessHandle::new(
            Pid::new(pid),
            Signature::from(signature),
            false,
            shared_capture(8),
            shared_capture(8),
        ))
    }

    fn table() -> (Arc<DeadSet>, ProcessTable) {
        let os = Arc::new(DeadSet::default());
        let table = ProcessTable::new(Arc::clone(&os) as Arc<dyn ProcessOs>);
        (os, table)
    }

    #[test]
    fn lookups_by_both_keys() -> Result<(), TableError> {
        let (_os, table) = table();
        table.register(handle(10, "sleep 5"))?;
        table.register(handle(11, "sleep 5"))?;

        assert_eq!(table.lookup(&"sleep 5".into()).map(|h| h.pid()), Some(Pid::new(11)));
        assert_eq!(table.lookup_all(&"sleep 5".into()).len(), 2);
        assert!(table.lookup_by_pid(Pid::new(10)).is_some());
        assert!(table.lookup(&"sleep 6".into()).is_none());
        Ok(())
    }

    #[test]
    fn unregister_is_idempotent() -> Result<(), TableError> {
        let (_os, table) = table();
        table.register(handle(10, "sleep 5"))?;
        assert_eq!(table.unregister(&"sleep 5".into()).len(), 1);
        assert!(table.unregister(&"sleep 5".into()).is_empty());
        assert!(table.unregister_pid(Pid::new(10)).is_none());
        assert!(table.is_empty());
        Ok(())
    }

    #[test]
    fn unregister_pid_keeps_siblings() -> Result<(), TableError> {
        let (_os, table) = table();
        table.register(handle(10, "sleep 5"))?;
        table.register(handle(11, "sleep 5"))?;
        table.unregister_pid(Pid::new(11));
        assert_eq!(table.lookup(&"sleep 5".into()).map(|h| h.pid()), Some(Pid::new(10)));
        Ok(())
    }

    #[test]
    fn exclusive_claim_refuses_live_instance() -> Result<(), TableError> {
        let (_os, table) = table();
        let claim = table.claim("pppd call provider".into())?;
        assert_eq!(
            table.claim("pppd call provider".into()).err(),
            Some(TableError::AlreadyStarting {
                signature: "pppd call provider".into()
            })
        );
        claim.register(handle(20, "pppd call provider"))?;

        assert_eq!(
            table.claim("pppd call provider".into()).err(),
            Some(TableError::AlreadyRunning {
                signature: "pppd call provider".into(),
                pid: Pid::new(20)
            })
        );
        Ok(())
    }

    #[test]
    fn dropped_claim_releases_signature() -> Result<(), TableError> {
        let (_os, table) = table();
        drop(table.claim("pppd call provider".into())?);
        let _again = table.claim("pppd call provider".into())?;
        Ok(())
    }

    #[test]
    fn stale_entries_are_purged_on_lookup() -> Result<(), TableError> {
        let (os, table) = table();
        table.register(handle(30, "pppd call provider"))?;
        let exited = handle(31, "sleep 1");
        table.register(Arc::clone(&exited))?;

        os.0.lock().insert(Pid::new(30));
        exited.mark_exited(0);

        assert!(table.lookup(&"pppd call provider".into()).is_none());
        assert!(table.lookup_by_pid(Pid::new(31)).is_none());
        assert!(table.is_empty());
        let _claim = table.claim("pppd call provider".into())?;
        Ok(())
    }

    #[test]
    fn live_pid_cannot_be_registered_twice() -> Result<(), TableError> {
        let (_os, table) = table();
        table.register(handle(40, "a"))?;
        assert_eq!(
            table.register(handle(40, "b")),
            Err(TableError::DuplicatePid { pid: Pid::new(40) })
        );
        Ok(())
    }

    #[test]
    fn concurrent_claims_admit_exactly_one() {
        let (_os, table) = table();
        let table = Arc::new(table);
        let winners = std::thread::scope(|scope| {
            let workers = (0..8)
                .map(|i| {
                    let table = Arc::clone(&table);
                    scope.spawn(move || match table.claim("pppd call provider".into()) {
                        Ok(claim) => claim.register(handle(100 + i, "pppd call provider")).is_ok(),
                        Err(_) => false,
                    })
                })
                .collect::<Vec<_>>();
            workers
                .into_iter()
                .map(|worker| worker.join())
                .filter(|joined| matches!(joined, Ok(true)))
                .count()
        });
        assert_eq!(winners, 1);
    }
}
