use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::executor::ExecutorConfig;
use crate::termination::TerminationConfig;

/// Main configuration structure for procwarden.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ProcwardenConfig {
    /// Spawning and output capture
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Signal escalation timings
    #[serde(default)]
    pub termination: TerminationConfig,

    /// OS process-list lookups
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Serial lock files
    #[serde(default)]
    pub locks: LockConfig,

    /// Log verbosity for the binary
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ProcwardenConfig {
    pub fn validate(&self) -> Result<()> {
        self.executor
            .validate()
            .context("Invalid executor configuration")?;
        self.termination
            .validate()
            .context("Invalid termination configuration")?;
        self.discovery
            .validate()
            .context("Invalid discovery configuration")?;
        self.locks
            .validate()
            .context("Invalid locks configuration")?;
        Ok(())
    }
}

/// How hard to look for a process that was only just spawned.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Number of process-list scans before an empty result is reported.
    #[serde(default = "DiscoveryConfig::default_lookup_attempts")]
    pub lookup_attempts: u32,
    /// Delay (ms) between scans.
    #[serde(default = "DiscoveryConfig::default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            lookup_attempts: Self::default_lookup_attempts(),
            retry_delay_ms: Self::default_retry_delay_ms(),
        }
    }
}

impl DiscoveryConfig {
    const fn default_lookup_attempts() -> u32 {
        5
    }

    const fn default_retry_delay_ms() -> u64 {
        20
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.lookup_attempts >= 1,
            "discovery.lookup_attempts must be at least 1"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct LockConfig {
    /// Directory holding UUCP-style `LCK..<device>` files.
    #[serde(default = "LockConfig::default_lock_dir")]
    pub lock_dir: PathBuf,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_dir: Self::default_lock_dir(),
        }
    }
}

impl LockConfig {
    fn default_lock_dir() -> PathBuf {
        PathBuf::from("/var/lock")
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.lock_dir.is_absolute(),
            "locks.lock_dir must be an absolute path"
        );
        Ok(())
    }
}

/// Log level for the `procwarden*` targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "trace" => Some(Self::Trace),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        if let Some(parsed) = Self::parse(&raw) {
            Ok(parsed)
        } else {
            tracing::warn!(value = %raw, "unknown logging.level; falling back to info");
            Ok(Self::default())
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Level applied when `RUST_LOG` is not set.
    #[serde(default)]
    pub level: LogLevel,
}

impl LoggingConfig {
    /// `EnvFilter` directive covering every procwarden crate.
    pub fn filter_directive(&self) -> String {
        let level = self.level.as_str();
        format!(
            "procwarden={level},procwarden_exec={level},procwarden_config={level},procwarden_exec_events={level}"
        )
    }
}
