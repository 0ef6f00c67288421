mod support;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use pretty_assertions::assert_eq;
use procwarden_exec::{CommandSpec, DaemonSupervisor, EXIT_REJECTED, Executor};

use support::{config, unique_sleep, wait_until};

#[tokio::test]
async fn start_is_exclusive_and_stop_releases_the_lock() -> Result<()> {
    let executor = Arc::new(Executor::new(config())?);
    let dir = tempfile::tempdir()?;
    let arg = unique_sleep(51);
    let daemon = DaemonSupervisor::new(Arc::clone(&executor), CommandSpec::new(["sleep", arg.as_str()]))
        .with_serial_lock(dir.path(), "/dev/ttyUSB7");

    assert!(!daemon.is_running());
    let started = daemon.start();
    assert_eq!(started.exit_code(), None);
    let pid = started.pid();
    assert_eq!(daemon.pid(), Some(pid));

    let again = daemon.start();
    assert_eq!(again.exit_code(), Some(EXIT_REJECTED));
    assert!(again.stderr_lossy().contains("already running"));

    let lock_file = dir.path().join("LCK..ttyUSB7");
    assert_eq!(daemon.lock_file(), Some(lock_file.as_path()));
    std::fs::write(&lock_file, format!("{:>10}\n", pid.as_raw()))?;

    assert!(daemon.stop().await);
    assert!(!lock_file.exists());
    assert!(!executor.is_running(pid));
    assert!(!daemon.is_running());
    Ok(())
}

#[tokio::test]
async fn instance_from_a_previous_run_is_found_and_stopped() -> Result<()> {
    let arg = unique_sleep(52);
    let spec = CommandSpec::new(["sleep", arg.as_str()]);

    let previous = Executor::new(config())?;
    let orphan = previous.execute(spec.clone().detached(true));
    assert!(orphan.pid().is_valid());

    let executor = Arc::new(Executor::new(config())?);
    let daemon = DaemonSupervisor::new(Arc::clone(&executor), spec);
    assert!(executor.table().is_empty());
    assert_eq!(daemon.pid(), Some(orphan.pid()));

    let refused = daemon.start();
    assert_eq!(refused.exit_code(), Some(EXIT_REJECTED));

    assert!(daemon.stop().await);
    assert!(wait_until(Duration::from_secs(2), || !previous.is_running(orphan.pid())));
    assert_eq!(daemon.pid(), None);
    Ok(())
}

#[tokio::test]
async fn stale_lock_is_cleaned_when_nothing_runs() -> Result<()> {
    let executor = Arc::new(Executor::new(config())?);
    let dir = tempfile::tempdir()?;
    let arg = unique_sleep(53);
    let daemon = DaemonSupervisor::new(executor, CommandSpec::new(["sleep", arg.as_str()]))
        .with_serial_lock(dir.path(), "ttyACM0");

    let lock_file = dir.path().join("LCK..ttyACM0");
    std::fs::write(&lock_file, "2147483646\n")?;

    assert!(daemon.stop().await);
    assert!(!lock_file.exists());
    Ok(())
}
