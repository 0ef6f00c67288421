//! Pipe-based spawning of a [`CommandSpec`].
//!
//! Every child becomes the leader of a new session so its whole tree can be
//! signalled as one group. Attached children also get a parent-death signal
//! and piped stdout/stderr drained by one reader task per stream; detached
//! children get `/dev/null` for all three streams.

use std::io;
use std::process::Stdio;
use std::sync::Arc;

use procwarden_config::ExecutorConfig;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::pid::Pid;
use crate::process::ProcessHandle;
use crate::process_group;
use crate::spec::{CommandSpec, EnvMode};
use crate::stream::{drain_into, shared_capture};

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to start `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("`{program}` was started but the OS reported no pid")]
    MissingPid { program: String },
    #[error("cannot start `{program}`: the executor's spawner thread has stopped")]
    SpawnerStopped { program: String },
}

/// A freshly spawned child and the tasks attached to it. Owned by exactly one
/// supervision task.
#[derive(Debug)]
pub(crate) struct SpawnedChild {
    pub child: Child,
    pub handle: Arc<ProcessHandle>,
    pub readers: Vec<JoinHandle<()>>,
    pub started: tokio::time::Instant,
}

/// The argv actually executed: the command's own argv, or a `sudo` wrapper
/// when the command must drop privileges.
///
/// The wrapper ends in `env [-i] K=V... argv`, so the process that finally
/// runs reports exactly the command's argv as its command line and stays
/// discoverable by signature. `sudo` resets the environment first, so under
/// [`EnvMode::Merge`] the overrides land on the environment `sudo` builds
/// for the target user rather than on the service's.
pub fn effective_argv(spec: &CommandSpec, config: &ExecutorConfig) -> Vec<String> {
    let user = match config.unprivileged_user.as_deref() {
        Some(user) if !spec.is_privileged() => user,
        _ => return spec.argv().to_vec(),
    };

    let mut argv = vec![
        config.sudo_program.clone(),
        "-n".to_string(),
        "-u".to_string(),
        user.to_string(),
        "--".to_string(),
        "env".to_string(),
    ];
    if spec.get_env_mode() == EnvMode::Replace {
        argv.push("-i".to_string());
    }
    argv.extend(spec.get_env().iter().map(|(key, value)| format!("{key}={value}")));
    argv.extend(spec.argv().iter().cloned());
    argv
}

fn uses_wrapper(spec: &CommandSpec, config: &ExecutorConfig) -> bool {
    config.unprivileged_user.is_some() && !spec.is_privileged()
}

fn build_command(spec: &CommandSpec, config: &ExecutorConfig) -> Result<Command, SpawnError> {
    let argv = effective_argv(spec, config);
    let Some((program, args)) = argv.split_first() else {
        return Err(SpawnError::Io {
            program: String::new(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "empty argv"),
        });
    };

    let mut command = Command::new(program);
    command.args(args);
    command.current_dir(
        spec.get_working_dir()
            .cloned()
            .unwrap_or_else(|| config.working_dir()),
    );

    if !uses_wrapper(spec, config) {
        if spec.get_env_mode() == EnvMode::Replace {
            command.env_clear();
        }
        command.envs(spec.get_env());
    }

    let detached = spec.is_detached();
    if detached {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
    } else {
        command
            .stdin(if spec.get_stdin().is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
    }

    let parent_pid = unsafe { libc::getpid() };
    // SAFETY: the hook only makes async-signal-safe libc calls.
    unsafe {
        command.pre_exec(move || {
            process_group::detach_from_tty()?;
            if !detached {
                process_group::set_parent_death_signal(parent_pid)?;
            }
            Ok(())
        });
    }

    Ok(command)
}

/// Spawn `spec`. Must run inside a tokio runtime context: the reader and
/// stdin tasks are spawned onto the current runtime.
pub(crate) fn spawn(
    spec: &CommandSpec,
    config: &ExecutorConfig,
) -> Result<SpawnedChild, SpawnError> {
    let program = spec.program().unwrap_or_default().to_string();
    let mut command = build_command(spec, config)?;

    let mut child = command.spawn().map_err(|source| SpawnError::Io {
        program: program.clone(),
        source,
    })?;
    let started = tokio::time::Instant::now();
    let Some(pid) = child.id().map(Pid::from) else {
        return Err(SpawnError::MissingPid { program });
    };

    let limit = if spec.is_detached() {
        0
    } else {
        config.max_output_bytes
    };
    let stdout_capture = shared_capture(limit);
    let stderr_capture = shared_capture(limit);

    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(drain_into(stdout, Arc::clone(&stdout_capture))));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(drain_into(stderr, Arc::clone(&stderr_capture))));
    }

    if let (Some(mut stdin), Some(input)) = (child.stdin.take(), spec.get_stdin()) {
        let input = input.to_vec();
        tokio::spawn(async move {
            if let Err(err) = stdin.write_all(&input).await {
                tracing::debug!(pid = %pid, error = %err, "child closed stdin early");
            }
            // Dropping stdin closes the pipe.
        });
    }

    let handle = Arc::new(ProcessHandle::new(
        pid,
        spec.signature(),
        spec.is_detached(),
        stdout_capture,
        stderr_capture,
    ));

    tracing::debug!(
        pid = %pid,
        signature = %handle.signature(),
        detached = spec.is_detached(),
        "spawned process"
    );

    Ok(SpawnedChild {
        child,
        handle,
        readers,
        started,
    })
}
