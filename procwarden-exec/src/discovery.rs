//! Locating processes by command-line signature in the OS process list.
//!
//! Matching is an exact comparison between the signature and the
//! single-space-joined command line the OS reports. An argument that itself
//! contains spaces is indistinguishable from two arguments, and a process
//! started with extra whitespace or through a shell wrapper will not match.
//! Callers that need to find such processes must construct the signature the
//! way the OS will report it.

use procwarden_config::DiscoveryConfig;

use crate::os::{ProcessInfo, ProcessOs};
use crate::spec::Signature;

/// One scan of the process list. Enumeration errors are logged and read as
/// "nothing found".
pub fn scan(os: &dyn ProcessOs, signature: &Signature) -> Vec<ProcessInfo> {
    if signature.is_empty() {
        return Vec::new();
    }
    match os.enumerate_processes() {
        Ok(processes) => processes
            .into_iter()
            .filter(|info| signature.matches(&info.command_line))
            .collect(),
        Err(err) => {
            tracing::warn!(signature = %signature, error = %err, "failed to enumerate processes");
            Vec::new()
        }
    }
}

/// Scan, retrying empty results `lookup_attempts` times. A process that was
/// just spawned may not show its final command line yet (exec in progress).
pub fn find_blocking(
    os: &dyn ProcessOs,
    signature: &Signature,
    config: &DiscoveryConfig,
) -> Vec<ProcessInfo> {
    let attempts = config.lookup_attempts.max(1);
    for attempt in 1..=attempts {
        let found = scan(os, signature);
        if !found.is_empty() || attempt == attempts {
            return found;
        }
        std::thread::sleep(config.retry_delay());
    }
    Vec::new()
}

/// Async twin of [`find_blocking`].
pub async fn find(
    os: &dyn ProcessOs,
    signature: &Signature,
    config: &DiscoveryConfig,
) -> Vec<ProcessInfo> {
    let attempts = config.lookup_attempts.max(1);
    for attempt in 1..=attempts {
        let found = scan(os, signature);
        if !found.is_empty() || attempt == attempts {
            return found;
        }
        tokio::time::sleep(config.retry_delay()).await;
    }
    Vec::new()
}
