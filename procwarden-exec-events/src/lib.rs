//! Structured process lifecycle events shared across procwarden crates.
//!
//! The executor and terminator report every state change of a managed
//! process (spawn, exit, timeout, signal delivery, stop failure) as a
//! [`ProcessEvent`]. Consumers plug in an [`EventSink`] to forward these
//! into audit logs or dashboards without depending on `procwarden-exec`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Semantic version of the serialized event schema exported by this crate.
pub const EVENT_SCHEMA_VERSION: &str = "0.1.0";

/// Wraps a [`ProcessEvent`] with schema metadata and the emission time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionedProcessEvent {
    /// Semantic version describing the schema of the nested event payload.
    pub schema_version: String,
    /// Wall-clock time at which the event was wrapped.
    pub emitted_at: DateTime<Utc>,
    /// Concrete event emitted by the executor or terminator.
    pub event: ProcessEvent,
}

impl VersionedProcessEvent {
    /// Creates a new [`VersionedProcessEvent`] stamped with the current time.
    pub fn new(event: ProcessEvent) -> Self {
        Self {
            schema_version: EVENT_SCHEMA_VERSION.to_string(),
            emitted_at: Utc::now(),
            event,
        }
    }

    /// Returns the nested [`ProcessEvent`], consuming the wrapper.
    pub fn into_event(self) -> ProcessEvent {
        self.event
    }
}

impl From<ProcessEvent> for VersionedProcessEvent {
    fn from(event: ProcessEvent) -> Self {
        Self::new(event)
    }
}

/// Sink for processing [`ProcessEvent`] instances.
///
/// Sinks are shared between every worker task of an executor, so they take
/// `&self` and must be thread safe.
pub trait EventSink: Send + Sync {
    /// Invoked for each event emitted by the process manager.
    fn emit(&self, event: &ProcessEvent);
}

impl<F> EventSink for F
where
    F: Fn(&ProcessEvent) + Send + Sync,
{
    fn emit(&self, event: &ProcessEvent) {
        self(event);
    }
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: &ProcessEvent) {}
}

/// JSON helper utilities for serializing and deserializing process events.
#[cfg(feature = "serde-json")]
pub mod json {
    use super::{ProcessEvent, VersionedProcessEvent};

    /// Serializes an event into a JSON string.
    pub fn to_string(event: &ProcessEvent) -> serde_json::Result<String> {
        serde_json::to_string(event)
    }

    /// Deserializes an event from a JSON string.
    pub fn from_str(payload: &str) -> serde_json::Result<ProcessEvent> {
        serde_json::from_str(payload)
    }

    /// Serializes an event inside a [`VersionedProcessEvent`] wrapper.
    pub fn versioned_to_string(event: &ProcessEvent) -> serde_json::Result<String> {
        serde_json::to_string(&VersionedProcessEvent::new(event.clone()))
    }

    /// Deserializes a [`VersionedProcessEvent`] wrapper.
    pub fn versioned_from_str(payload: &str) -> serde_json::Result<VersionedProcessEvent> {
        serde_json::from_str(payload)
    }
}

/// Lifecycle events emitted for managed processes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ProcessEvent {
    /// The OS accepted the spawn request.
    #[serde(rename = "process.spawned")]
    Spawned(SpawnedEvent),
    /// The spawn request failed at the OS level.
    #[serde(rename = "process.spawn_failed")]
    SpawnFailed(SpawnFailedEvent),
    /// The request was refused before any OS call.
    #[serde(rename = "process.rejected")]
    Rejected(RejectedEvent),
    /// The process exited and was reaped.
    #[serde(rename = "process.exited")]
    Exited(ExitedEvent),
    /// The configured deadline elapsed before the process exited.
    #[serde(rename = "process.timed_out")]
    TimedOut(ProcessRef),
    /// The caller stopped waiting; the process keeps running.
    #[serde(rename = "process.abandoned")]
    Abandoned(ProcessRef),
    /// A stop was requested for a running process.
    #[serde(rename = "stop.requested")]
    StopRequested(SignalEvent),
    /// The OS accepted a signal for delivery.
    #[serde(rename = "stop.signaled")]
    Signaled(SignalEvent),
    /// Termination was confirmed.
    #[serde(rename = "stop.completed")]
    Stopped(StoppedEvent),
    /// The process survived every escalation step.
    #[serde(rename = "stop.failed")]
    StopFailed(ProcessRef),
    /// A lock file tied to the process was removed.
    #[serde(rename = "lock.released")]
    LockReleased(LockReleasedEvent),
}

impl ProcessEvent {
    /// Pid the event refers to, when there is one.
    pub fn pid(&self) -> Option<i32> {
        match self {
            ProcessEvent::Spawned(event) => Some(event.pid),
            ProcessEvent::Exited(event) => Some(event.pid),
            ProcessEvent::TimedOut(event)
            | ProcessEvent::Abandoned(event)
            | ProcessEvent::StopFailed(event) => Some(event.pid),
            ProcessEvent::StopRequested(event) | ProcessEvent::Signaled(event) => {
                Some(event.pid)
            }
            ProcessEvent::Stopped(event) => Some(event.pid),
            ProcessEvent::LockReleased(event) => event.pid,
            ProcessEvent::SpawnFailed(_) | ProcessEvent::Rejected(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpawnedEvent {
    pub pid: i32,
    /// Space-joined argv of the command.
    pub signature: String,
    #[serde(default)]
    pub detached: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpawnFailedEvent {
    pub signature: String,
    /// OS error description.
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RejectedEvent {
    pub signature: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExitedEvent {
    pub pid: i32,
    pub signature: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub timed_out: bool,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessRef {
    pub pid: i32,
    #[serde(default)]
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignalEvent {
    pub pid: i32,
    /// Signal name without the `SIG` prefix, e.g. `TERM`.
    pub signal: String,
    /// Whether the whole process group was targeted.
    #[serde(default)]
    pub group: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StopKind {
    /// The process was gone before any signal was sent.
    #[default]
    AlreadyExited,
    /// The graceful signal was enough.
    AfterTerm,
    /// The process needed the forceful signal.
    AfterKill,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoppedEvent {
    pub pid: i32,
    pub kind: StopKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockReleasedEvent {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[test]
    fn exited_event_serializes_with_type_tag() -> serde_json::Result<()> {
        let event = ProcessEvent::Exited(ExitedEvent {
            pid: 42,
            signature: "sleep 1".to_string(),
            exit_code: Some(0),
            timed_out: false,
            elapsed_ms: 1003,
        });

        let value = serde_json::to_value(&event)?;
        assert_eq!(value["type"], "process.exited");
        assert_eq!(value["pid"], 42);
        assert_eq!(value["exit_code"], 0);
        Ok(())
    }

    #[test]
    fn missing_exit_code_is_omitted() -> serde_json::Result<()> {
        let event = ProcessEvent::Exited(ExitedEvent {
            pid: 7,
            signature: "pppd".to_string(),
            exit_code: None,
            timed_out: true,
            elapsed_ms: 5000,
        });

        let payload = json::to_string(&event)?;
        assert!(!payload.contains("exit_code"));
        assert_eq!(json::from_str(&payload)?, event);
        Ok(())
    }

    #[test]
    fn versioned_wrapper_carries_schema_version() -> serde_json::Result<()> {
        let event = ProcessEvent::StopFailed(ProcessRef {
            pid: 99,
            signature: String::new(),
        });
        let payload = json::versioned_to_string(&event)?;
        let decoded = json::versioned_from_str(&payload)?;
        assert_eq!(decoded.schema_version, EVENT_SCHEMA_VERSION);
        assert_eq!(decoded.into_event(), event);
        Ok(())
    }

    #[test]
    fn closures_act_as_sinks() {
        let seen = Mutex::new(Vec::new());
        let sink = |event: &ProcessEvent| {
            if let Ok(mut guard) = seen.lock() {
                guard.push(event.pid());
            }
        };

        sink.emit(&ProcessEvent::TimedOut(ProcessRef {
            pid: 3,
            signature: "sleep 30".to_string(),
        }));
        sink.emit(&ProcessEvent::Rejected(RejectedEvent {
            signature: String::new(),
            reason: "empty argv".to_string(),
        }));

        let seen = seen.into_inner().unwrap_or_default();
        assert_eq!(seen, vec![Some(3), None]);
    }
}
