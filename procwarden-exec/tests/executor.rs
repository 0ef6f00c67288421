mod support;

use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use procwarden_exec::events::ProcessEvent;
use procwarden_exec::{
    CommandSpec, EXIT_REJECTED, EXIT_SPAWN_FAILED, EnvMode, Executor, Pid, Signal, Signature,
    StopOutcome,
};
use tokio_util::sync::CancellationToken;

use support::{config, unique_sleep, wait_until};

#[test]
fn true_exits_zero_with_empty_stderr() -> Result<()> {
    let executor = Executor::new(config())?;
    let status = executor.execute(CommandSpec::new(["true"]));

    assert_eq!(status.exit_code(), Some(0));
    assert!(status.stderr().is_empty());
    assert!(!status.timed_out());
    assert!(status.is_success());
    assert!(status.pid().is_valid());
    assert!(!executor.is_running(status.pid()));
    Ok(())
}

#[test]
fn missing_executable_returns_sentinel_quickly() -> Result<()> {
    let executor = Executor::new(config())?;
    let started = Instant::now();
    let status = executor.execute(CommandSpec::new(["/nonexistent/procwarden-missing-binary"]));

    assert_eq!(status.exit_code(), Some(EXIT_SPAWN_FAILED));
    assert!(status.never_ran());
    assert!(!status.stderr().is_empty());
    assert_eq!(status.pid(), Pid::NOT_FOUND);
    assert!(started.elapsed() < Duration::from_secs(2));
    Ok(())
}

#[test]
fn empty_argv_is_rejected_without_spawning() -> Result<()> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink_events = Arc::clone(&events);
    let executor = Executor::builder(config())
        .event_sink(Arc::new(move |event: &ProcessEvent| {
            sink_events.lock().push(event.clone())
        }))
        .build()?;

    let empty: [&str; 0] = [];
    let status = executor.execute(CommandSpec::new(empty));

    assert_eq!(status.exit_code(), Some(EXIT_REJECTED));
    assert!(status.stderr_lossy().contains("no arguments"));
    let events = events.lock();
    assert!(matches!(events.as_slice(), [ProcessEvent::Rejected(_)]));
    Ok(())
}

#[test]
fn timeout_terminates_and_flags_status() -> Result<()> {
    let executor = Executor::new(config())?;
    let started = Instant::now();
    let status = executor.execute(
        CommandSpec::new(["sleep", unique_sleep(30).as_str()]).timeout(Duration::from_millis(300)),
    );

    assert!(status.timed_out());
    assert!(!status.is_success());
    assert_eq!(status.exit_code(), Some(128 + libc::SIGTERM));
    assert_eq!(status.termination(), Some(StopOutcome::ExitedAfterTerm));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(!executor.is_running(status.pid()));
    assert!(executor.table().lookup_by_pid(status.pid()).is_none());
    Ok(())
}

#[test]
fn timeout_escalates_to_kill_when_term_is_ignored() -> Result<()> {
    let executor = Executor::new(config())?;
    let script = format!("trap '' TERM; echo ready; sleep {}", unique_sleep(31));
    let status = executor.execute(
        CommandSpec::new(["sh", "-c", script.as_str()]).timeout(Duration::from_millis(300)),
    );

    assert!(status.timed_out());
    assert_eq!(status.exit_code(), Some(128 + libc::SIGKILL));
    assert_eq!(status.termination(), Some(StopOutcome::ExitedAfterKill));
    assert_eq!(status.stdout_lossy(), "ready\n");
    Ok(())
}

#[test]
fn timeout_kills_group_members_that_ignore_term() -> Result<()> {
    let executor = Executor::new(config())?;
    let arg = unique_sleep(38);
    // The leader dies on TERM; the background member ignores it.
    let script = format!("(trap '' TERM; exec sleep {arg}) & sleep 30");
    let status = executor.execute(
        CommandSpec::new(["sh", "-c", script.as_str()]).timeout(Duration::from_millis(300)),
    );

    assert!(status.timed_out());
    assert_eq!(status.exit_code(), Some(128 + libc::SIGTERM));
    assert_eq!(status.termination(), Some(StopOutcome::ExitedAfterKill));
    assert!(!executor.is_running_command(&Signature::from_argv(&["sleep", arg.as_str()])));
    Ok(())
}

#[test]
fn custom_timeout_signal_is_used_first() -> Result<()> {
    let executor = Executor::new(config())?;
    let status = executor.execute(
        CommandSpec::new(["sleep", unique_sleep(32).as_str()])
            .timeout(Duration::from_millis(200))
            .signal(Signal::Hup),
    );
    assert_eq!(status.exit_code(), Some(128 + libc::SIGHUP));
    Ok(())
}

#[test]
fn async_completion_runs_once_on_another_thread() -> Result<()> {
    let executor = Executor::new(config())?;
    let (tx, rx) = mpsc::channel();
    let caller = std::thread::current().id();

    let pid = executor.execute_async(CommandSpec::new(["sh", "-c", "echo hi"]), move |status| {
        let _ = tx.send((status, std::thread::current().id()));
    });

    assert!(pid.is_valid());
    let (status, thread) = rx.recv_timeout(Duration::from_secs(10))?;
    assert_ne!(thread, caller);
    assert_eq!(status.pid(), pid);
    assert_eq!(status.stdout_lossy(), "hi\n");
    assert!(executor.table().lookup_by_pid(pid).is_none());
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    Ok(())
}

#[test]
fn async_child_outlives_the_submitting_thread() -> Result<()> {
    let executor = Arc::new(Executor::new(config())?);
    let (tx, rx) = mpsc::channel();

    let submitter = Arc::clone(&executor);
    let pid = std::thread::spawn(move || {
        submitter.execute_async(
            CommandSpec::new(["sh", "-c", "sleep 0.5; echo survived"]),
            move |status| {
                let _ = tx.send(status);
            },
        )
    })
    .join()
    .expect("submitting thread panicked");

    assert!(pid.is_valid());
    let status = rx.recv_timeout(Duration::from_secs(5))?;
    assert_eq!(status.exit_code(), Some(0));
    assert!(!status.timed_out());
    assert_eq!(status.stdout_lossy(), "survived\n");
    Ok(())
}

#[test]
fn async_rejections_still_call_back() -> Result<()> {
    let executor = Executor::new(config())?;
    let (tx, rx) = mpsc::channel();
    let pid = executor.execute_async(CommandSpec::new([""]), move |status| {
        let _ = tx.send(status);
    });
    assert_eq!(pid, Pid::NOT_FOUND);
    let status = rx.recv_timeout(Duration::from_secs(5))?;
    assert_eq!(status.exit_code(), Some(EXIT_REJECTED));
    Ok(())
}

#[test]
fn environment_merge_and_replace() -> Result<()> {
    let executor = Executor::new(config())?;

    let merged = executor.execute(
        CommandSpec::new(["sh", "-c", "printf '%s' \"$MYVAR\""]).env("MYVAR", "MYVALUE"),
    );
    assert_eq!(merged.stdout_lossy(), "MYVALUE");

    let replaced = executor.execute(
        CommandSpec::new(["env"])
            .env("ONLY", "this")
            .env_mode(EnvMode::Replace),
    );
    assert_eq!(replaced.stdout_lossy(), "ONLY=this\n");
    Ok(())
}

#[test]
fn working_directory_is_applied() -> Result<()> {
    let executor = Executor::new(config())?;
    let dir = tempfile::tempdir()?;
    let status = executor.execute(CommandSpec::new(["pwd"]).working_dir(dir.path()));
    assert_eq!(
        status.stdout_lossy().trim_end(),
        dir.path().canonicalize()?.to_string_lossy()
    );
    Ok(())
}

#[test]
fn stdin_is_fed_and_closed() -> Result<()> {
    let executor = Executor::new(config())?;
    let status = executor.execute(CommandSpec::new(["cat"]).stdin("line one\nline two\n"));
    assert_eq!(status.stdout_lossy(), "line one\nline two\n");
    assert_eq!(status.exit_code(), Some(0));
    Ok(())
}

#[test]
fn output_beyond_the_ceiling_is_truncated() -> Result<()> {
    let mut config = config();
    config.executor.max_output_bytes = 1024;
    let executor = Executor::new(config)?;

    let status = executor.execute(CommandSpec::new(["head", "-c", "200000", "/dev/zero"]));

    assert_eq!(status.exit_code(), Some(0));
    assert_eq!(status.stdout().len(), 1024);
    assert!(status.stdout_truncated());
    assert!(!status.stderr_truncated());
    Ok(())
}

#[test]
fn concurrent_executions_do_not_cross_talk() -> Result<()> {
    let executor = Executor::new(config())?;
    let results = std::thread::scope(|scope| {
        let workers = (0..16)
            .map(|i| {
                let executor = &executor;
                scope.spawn(move || {
                    let script = format!("echo out-{i}; echo err-{i} >&2; exit {}", i % 7);
                    (i, executor.execute(CommandSpec::new(["sh", "-c", script.as_str()])))
                })
            })
            .collect::<Vec<_>>();
        workers
            .into_iter()
            .filter_map(|worker| worker.join().ok())
            .collect::<Vec<_>>()
    });

    assert_eq!(results.len(), 16);
    for (i, status) in results {
        assert_eq!(status.exit_code(), Some(i % 7));
        assert_eq!(status.stdout_lossy(), format!("out-{i}\n"));
        assert_eq!(status.stderr_lossy(), format!("err-{i}\n"));
    }
    Ok(())
}

#[test]
fn get_pids_round_trip() -> Result<()> {
    let executor = Executor::new(config())?;
    let arg = unique_sleep(33);
    let spec = CommandSpec::new(["sleep", arg.as_str()]);
    let signature = Signature::from_argv(&["sleep", arg.as_str()]);

    assert!(executor.get_pids(&signature).is_empty());
    assert!(!executor.is_running_command(&signature));

    let (tx, rx) = mpsc::channel();
    let pid = executor.execute_async(spec, move |status| {
        let _ = tx.send(status);
    });
    assert_eq!(executor.pids(&signature), vec![pid]);
    assert!(executor.is_running(pid));

    assert!(executor.terminator().stop(pid, Signal::Term));
    let status = rx.recv_timeout(Duration::from_secs(10))?;
    assert_eq!(status.exit_code(), Some(128 + libc::SIGTERM));

    assert!(executor.get_pids(&signature).is_empty());
    assert!(!executor.is_running(pid));
    Ok(())
}

#[test]
fn exclusive_commands_refuse_a_second_instance() -> Result<()> {
    let executor = Executor::new(config())?;
    let spec = CommandSpec::new(["sleep", unique_sleep(34).as_str()]).exclusive(true);

    let (tx, rx) = mpsc::channel();
    let first = executor.execute_async(spec.clone(), move |status| {
        let _ = tx.send(status);
    });
    assert!(first.is_valid());

    let second = executor.execute(spec.clone());
    assert_eq!(second.exit_code(), Some(EXIT_REJECTED));
    assert!(second.stderr_lossy().contains("already running"));

    assert!(executor.terminator().stop(first, Signal::Kill));
    rx.recv_timeout(Duration::from_secs(10))?;

    let third = executor.execute(spec.timeout(Duration::from_millis(100)));
    assert!(third.timed_out());
    Ok(())
}

#[test]
fn detached_commands_return_immediately() -> Result<()> {
    let executor = Executor::new(config())?;
    let status = executor.execute(CommandSpec::new(["sleep", unique_sleep(35).as_str()]).detached(true));

    assert_eq!(status.exit_code(), None);
    let pid = status.pid();
    assert!(executor.is_running(pid));
    assert!(executor.table().lookup_by_pid(pid).is_some());

    assert!(executor.terminator().stop(pid, Signal::Term));
    assert!(wait_until(Duration::from_secs(5), || executor.table().is_empty()));
    assert!(!executor.is_running(pid));
    Ok(())
}

#[test]
fn shutdown_terminates_supervised_processes() -> Result<()> {
    let executor = Executor::new(config())?;
    let (tx, rx) = mpsc::channel();
    let pid = executor.execute_async(CommandSpec::new(["sleep", unique_sleep(36).as_str()]), move |status| {
        let _ = tx.send(status);
    });
    assert!(wait_until(Duration::from_secs(2), || executor.is_running(pid)));

    executor.shutdown();
    let status = rx.recv_timeout(Duration::from_secs(10))?;
    assert!(!status.timed_out());
    assert!(status.termination().is_some_and(StopOutcome::confirmed));
    assert!(!executor.is_running(pid));

    let refused = executor.execute(CommandSpec::new(["true"]));
    assert_eq!(refused.exit_code(), Some(EXIT_REJECTED));
    Ok(())
}

#[test]
fn lifecycle_events_are_emitted_in_order() -> Result<()> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink_events = Arc::clone(&events);
    let executor = Executor::builder(config())
        .event_sink(Arc::new(move |event: &ProcessEvent| {
            sink_events.lock().push(event.clone())
        }))
        .build()?;

    let status = executor.execute(CommandSpec::new(["true"]));

    let events = events.lock();
    match events.as_slice() {
        [ProcessEvent::Spawned(spawned), ProcessEvent::Exited(exited)] => {
            assert_eq!(spawned.pid, status.pid().as_raw());
            assert_eq!(exited.exit_code, Some(0));
            assert_eq!(exited.signature, "true");
        }
        other => panic!("unexpected events: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn run_works_from_async_code() -> Result<()> {
    let executor = Executor::new(config())?;
    let status = executor.run(CommandSpec::new(["sh", "-c", "printf async"])).await;
    assert_eq!(status.stdout_lossy(), "async");
    Ok(())
}

#[tokio::test]
async fn cancelled_wait_leaves_the_process_running() -> Result<()> {
    let executor = Executor::new(config())?;
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let status = executor
        .run_with_cancel(CommandSpec::new(["sleep", unique_sleep(37).as_str()]), cancel)
        .await;

    assert_eq!(status.exit_code(), None);
    assert!(!status.timed_out());
    let pid = status.pid();
    assert!(executor.is_running(pid));
    assert!(executor.table().lookup_by_pid(pid).is_some());

    let outcome = executor.terminator().terminate(pid).await;
    assert!(outcome.confirmed());
    for _ in 0..100 {
        if executor.table().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(executor.table().is_empty());
    Ok(())
}
