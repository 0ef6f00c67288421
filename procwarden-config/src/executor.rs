use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Settings for spawning commands and capturing their output.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Number of worker threads in the pool that supervises processes.
    #[serde(default = "ExecutorConfig::default_worker_threads")]
    pub worker_threads: usize,
    /// Working directory used when a command does not name one.
    /// Unset means the OS temporary directory.
    #[serde(default)]
    pub default_working_dir: Option<PathBuf>,
    /// Per-stream ceiling (bytes) for captured stdout/stderr.
    #[serde(default = "ExecutorConfig::default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Milliseconds the stream readers may keep draining after exit or kill.
    #[serde(default = "ExecutorConfig::default_drain_grace_ms")]
    pub drain_grace_ms: u64,
    /// Account that runs non-privileged commands. Unset runs everything with
    /// the service's own credentials.
    #[serde(default)]
    pub unprivileged_user: Option<String>,
    /// Program used to switch users for non-privileged commands.
    #[serde(default = "ExecutorConfig::default_sudo_program")]
    pub sudo_program: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_threads: Self::default_worker_threads(),
            default_working_dir: None,
            max_output_bytes: Self::default_max_output_bytes(),
            drain_grace_ms: Self::default_drain_grace_ms(),
            unprivileged_user: None,
            sudo_program: Self::default_sudo_program(),
        }
    }
}

impl ExecutorConfig {
    const MAX_WORKER_THREADS: usize = 64;
    const MIN_OUTPUT_BYTES: usize = 1_024;

    const fn default_worker_threads() -> usize {
        4
    }

    const fn default_max_output_bytes() -> usize {
        100 * 1_024
    }

    const fn default_drain_grace_ms() -> u64 {
        500
    }

    fn default_sudo_program() -> String {
        "sudo".to_string()
    }

    /// Resolve the working directory for commands without an explicit one.
    pub fn working_dir(&self) -> PathBuf {
        self.default_working_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    pub fn drain_grace(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.drain_grace_ms)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            (1..=Self::MAX_WORKER_THREADS).contains(&self.worker_threads),
            "executor.worker_threads must be between 1 and {}",
            Self::MAX_WORKER_THREADS
        );
        ensure!(
            self.max_output_bytes >= Self::MIN_OUTPUT_BYTES,
            "executor.max_output_bytes must be at least {} bytes",
            Self::MIN_OUTPUT_BYTES
        );
        ensure!(
            !self.sudo_program.trim().is_empty(),
            "executor.sudo_program must not be empty"
        );
        if let Some(user) = &self.unprivileged_user {
            ensure!(
                !user.trim().is_empty(),
                "executor.unprivileged_user must not be blank when set"
            );
        }
        Ok(())
    }
}
