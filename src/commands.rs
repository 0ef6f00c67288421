use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use procwarden_config::ProcwardenConfig;
use procwarden_exec::events::{ProcessEvent, json};
use procwarden_exec::{
    CommandSpec, CommandStatus, DaemonSupervisor, EnvMode, Executor, Pid, Signature,
    serial_lock_path,
};
use tokio::runtime::Handle;

use crate::args::{
    Cli, Command, DaemonAction, DaemonArgs, KillArgs, MatchArgs, RunArgs, RunningArgs, StopArgs,
};

/// Exit code for commands that never ran (rejected or spawn failure).
const EXIT_NOT_RUN: u8 = 127;
/// Exit code for commands terminated by their deadline.
const EXIT_TIMED_OUT: u8 = 124;

pub async fn dispatch(cli: Cli, config: ProcwardenConfig) -> Result<ExitCode> {
    let lock_dir = config.locks.lock_dir.clone();
    let mut builder = Executor::builder(config).runtime_handle(Handle::current());
    if cli.events {
        builder = builder.event_sink(Arc::new(print_event));
    }
    let executor = Arc::new(builder.build().context("failed to start executor")?);

    match cli.command {
        Command::Run(args) => run(&executor, args).await,
        Command::Pids(args) => pids(&executor, args).await,
        Command::Running(args) => running(&executor, args).await,
        Command::Stop(args) => stop(&executor, args, &lock_dir).await,
        Command::Kill(args) => kill(&executor, args).await,
        Command::Daemon(args) => daemon(executor, args, &lock_dir).await,
    }
}

fn print_event(event: &ProcessEvent) {
    match json::versioned_to_string(event) {
        Ok(line) => eprintln!("{line}"),
        Err(err) => tracing::warn!(error = %err, "failed to serialize event"),
    }
}

async fn run(executor: &Executor, args: RunArgs) -> Result<ExitCode> {
    let mut spec = CommandSpec::new(args.argv)
        .envs(args.env)
        .privileged(args.privileged)
        .detached(args.detach)
        .exclusive(args.exclusive);
    if args.replace_env {
        spec = spec.env_mode(EnvMode::Replace);
    }
    if let Some(dir) = args.cwd {
        spec = spec.working_dir(dir);
    }
    if let Some(timeout) = args.timeout {
        spec = spec.timeout(timeout);
    }
    if let Some(signal) = args.signal {
        spec = spec.signal(signal);
    }

    let status = executor.run(spec).await;
    print_status(&status)?;
    Ok(ExitCode::from(exit_code_for(&status)))
}

fn print_status(status: &CommandStatus) -> Result<()> {
    let mut stdout = io::stdout().lock();
    stdout.write_all(status.stdout())?;
    if status.spec().is_detached() && status.pid().is_valid() {
        writeln!(stdout, "{}", status.pid())?;
    }
    stdout.flush()?;

    let mut stderr = io::stderr().lock();
    stderr.write_all(status.stderr())?;
    stderr.flush()?;
    Ok(())
}

fn exit_code_for(status: &CommandStatus) -> u8 {
    if status.never_ran() {
        return EXIT_NOT_RUN;
    }
    if status.timed_out() {
        return EXIT_TIMED_OUT;
    }
    match status.exit_code() {
        Some(code) => u8::try_from(code).unwrap_or(1),
        None => 0,
    }
}

async fn pids(executor: &Executor, args: MatchArgs) -> Result<ExitCode> {
    let found = executor
        .find_pids(&Signature::from_argv(&args.argv))
        .await;
    let mut stdout = io::stdout().lock();
    for info in &found {
        writeln!(stdout, "{}", info.pid)?;
    }
    Ok(success_if(!found.is_empty()))
}

async fn running(executor: &Executor, args: RunningArgs) -> Result<ExitCode> {
    let alive = match args.pid {
        Some(pid) => executor.is_running(Pid::new(pid)),
        None => !executor
            .find_pids(&Signature::from_argv(&args.argv))
            .await
            .is_empty(),
    };
    Ok(success_if(alive))
}

async fn stop(executor: &Executor, args: StopArgs, lock_dir: &std::path::Path) -> Result<ExitCode> {
    let pid = Pid::new(args.pid);
    let terminator = executor.terminator();
    let signal = args.signal.unwrap_or_else(|| terminator.default_signal());

    if !args.escalate {
        let sent = if args.group {
            terminator.stop_group(pid, signal)
        } else {
            terminator.stop(pid, signal)
        };
        return Ok(success_if(sent));
    }

    let outcome = terminator.terminate_with(pid, signal, args.group).await;
    tracing::info!(pid = %pid, outcome = ?outcome, "stop finished");
    if outcome.confirmed()
        && let Some(device) = args.lock_device
    {
        terminator.release_lock(&serial_lock_path(lock_dir, &device), Some(pid));
    }
    Ok(success_if(outcome.confirmed()))
}

async fn kill(executor: &Executor, args: KillArgs) -> Result<ExitCode> {
    let terminator = executor.terminator().clone();
    let signal = args.signal.unwrap_or_else(|| terminator.default_signal());
    let signature = Signature::from_argv(&args.argv);
    let delivered = tokio::task::spawn_blocking(move || terminator.kill(&signature, signal))
        .await
        .context("kill task failed")?;
    Ok(success_if(delivered))
}

async fn daemon(
    executor: Arc<Executor>,
    args: DaemonArgs,
    lock_dir: &std::path::Path,
) -> Result<ExitCode> {
    let mut supervisor = DaemonSupervisor::new(executor, CommandSpec::new(args.argv));
    if let Some(device) = &args.lock_device {
        supervisor = supervisor.with_serial_lock(lock_dir, device);
    }

    match args.action {
        DaemonAction::Start => {
            let status = tokio::task::spawn_blocking(move || supervisor.start())
                .await
                .context("daemon start task failed")?;
            print_status(&status)?;
            Ok(success_if(!status.never_ran()))
        }
        DaemonAction::Stop => Ok(success_if(supervisor.stop().await)),
        DaemonAction::Status => {
            let pid = supervisor.pid();
            if let Some(pid) = pid {
                writeln!(io::stdout().lock(), "{pid}")?;
            }
            Ok(success_if(pid.is_some()))
        }
    }
}

fn success_if(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
