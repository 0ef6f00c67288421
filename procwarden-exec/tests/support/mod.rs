#![allow(dead_code)]

use std::time::{Duration, Instant};

use procwarden_config::ProcwardenConfig;

/// Fast escalation timings so timeout tests finish in about a second.
pub fn config() -> ProcwardenConfig {
    let mut config = ProcwardenConfig::default();
    config.executor.worker_threads = 4;
    config.executor.drain_grace_ms = 200;
    config.termination.poll_interval_ms = 50;
    config.termination.term_timeout_ms = 1_000;
    config.termination.kill_timeout_ms = 1_000;
    config.discovery.retry_delay_ms = 20;
    config
}

/// A `sleep` argument no other test (or test run) uses, so the command line
/// is unique in the OS process list.
pub fn unique_sleep(seconds: u32) -> String {
    format!("{seconds}.{}", std::process::id())
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    condition()
}
