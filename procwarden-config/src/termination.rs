use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Escalation timings used when stopping a process.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TerminationConfig {
    /// Signal sent first when a stop is requested (`TERM`, `SIGINT`, `15`...).
    #[serde(default = "TerminationConfig::default_signal")]
    pub default_signal: String,
    /// Interval (ms) between liveness polls.
    #[serde(default = "TerminationConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long (ms) to wait for exit after the graceful signal.
    #[serde(default = "TerminationConfig::default_term_timeout_ms")]
    pub term_timeout_ms: u64,
    /// How long (ms) to wait for exit after KILL before reporting failure.
    #[serde(default = "TerminationConfig::default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            default_signal: Self::default_signal(),
            poll_interval_ms: Self::default_poll_interval_ms(),
            term_timeout_ms: Self::default_term_timeout_ms(),
            kill_timeout_ms: Self::default_kill_timeout_ms(),
        }
    }
}

impl TerminationConfig {
    fn default_signal() -> String {
        "TERM".to_string()
    }

    const fn default_poll_interval_ms() -> u64 {
        500
    }

    const fn default_term_timeout_ms() -> u64 {
        5_000
    }

    const fn default_kill_timeout_ms() -> u64 {
        5_000
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn term_timeout(&self) -> Duration {
        Duration::from_millis(self.term_timeout_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.default_signal.trim().is_empty(),
            "termination.default_signal must not be empty"
        );
        ensure!(
            self.poll_interval_ms > 0,
            "termination.poll_interval_ms must be greater than zero"
        );
        ensure!(
            self.poll_interval_ms <= self.term_timeout_ms
                && self.poll_interval_ms <= self.kill_timeout_ms,
            "termination.poll_interval_ms must not exceed term_timeout_ms or kill_timeout_ms"
        );
        Ok(())
    }
}
