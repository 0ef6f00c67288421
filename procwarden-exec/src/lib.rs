//! Privileged command execution and process lifecycle management.
//!
//! - [`Executor`] spawns [`CommandSpec`]s, drains their output, enforces
//!   deadlines and hands back immutable [`CommandStatus`] snapshots.
//! - [`Terminator`] signals processes by pid or command-line signature and
//!   escalates from a graceful signal to KILL, confirming exit by polling.
//! - [`ProcessTable`] tracks in-flight processes by pid and signature.
//! - [`DaemonSupervisor`] keeps one instance of a long-running daemon.
//!
//! Everything that touches processes this crate did not spawn goes through
//! the [`ProcessOs`] trait.

#[cfg(not(unix))]
compile_error!("procwarden-exec only supports Unix targets");

pub mod daemon;
pub mod discovery;
pub mod executor;
pub mod lock;
pub mod os;
pub mod pid;
pub mod pipe;
pub mod process;
pub mod process_group;
pub mod signal;
mod spawner;
pub mod spec;
pub mod status;
pub mod stream;
pub mod table;
pub mod terminator;

pub use daemon::DaemonSupervisor;
pub use executor::{Executor, ExecutorBuilder};
pub use lock::{LockRemoval, remove_lock_file, serial_lock_path};
pub use os::{ProcessInfo, ProcessOs, default_os};
pub use pid::Pid;
pub use pipe::{SpawnError, effective_argv};
pub use process::{ProcessHandle, ProcessState, StopOutcome};
pub use process_group::Delivery;
pub use signal::{Signal, SignalParseError};
pub use spec::{CommandSpec, EnvMode, Signature, SpecError};
pub use status::{CommandStatus, EXIT_REJECTED, EXIT_SPAWN_FAILED, SIGNAL_EXIT_BASE};
pub use table::{Claim, ProcessTable, TableError};
pub use terminator::Terminator;

pub use procwarden_exec_events as events;
