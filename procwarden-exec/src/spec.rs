//! What to run: argv, environment, deadline and lifecycle flags.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::signal::Signal;

/// How [`CommandSpec::env`] combines with the service's own environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EnvMode {
    /// Inherit the service environment and overlay the given variables.
    ///
    /// Commands wrapped in `sudo -u` start from the environment `sudo` builds
    /// for the target user (`env_reset`), not from the service's; the
    /// overrides are applied on top of that.
    #[default]
    Merge,
    /// Start from an empty environment containing only the given variables.
    Replace,
}

/// Deterministic lookup key derived from an argv vector.
///
/// Arguments are joined with a single space and no quoting, which is also how
/// OS-reported command lines are normalized before comparison. Two argv
/// vectors that differ only in where spaces fall (`["a b"]` vs `["a", "b"]`)
/// therefore share a signature; exact-match callers depend on this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature(String);

impl Signature {
    pub fn from_argv<S: AsRef<str>>(argv: &[S]) -> Self {
        let joined = argv
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join(" ");
        Self(joined)
    }

    /// Wrap an already-joined command line such as `pppd call provider`.
    pub fn from_command_line(line: impl Into<String>) -> Self {
        Self(line.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Exact comparison against an OS-reported command line.
    pub fn matches(&self, command_line: &str) -> bool {
        self.0 == command_line
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Signature {
    fn from(line: &str) -> Self {
        Self::from_command_line(line)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    #[error("command has no arguments")]
    EmptyArgv,
    #[error("command program name is empty")]
    EmptyProgram,
    #[error("argument {index} contains a NUL byte")]
    NulByte { index: usize },
}

/// Description of a command to run. Never a shell string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    argv: Vec<String>,
    working_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
    env_mode: EnvMode,
    timeout: Option<Duration>,
    privileged: bool,
    signal: Option<Signal>,
    detached: bool,
    exclusive: bool,
    stdin: Option<Vec<u8>>,
}

impl CommandSpec {
    /// Create a spec from `argv[0]` plus arguments.
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add one environment override.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn env_mode(mut self, mode: EnvMode) -> Self {
        self.env_mode = mode;
        self
    }

    /// Deadline measured from spawn. Zero means no timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Run with the service's own credentials even when an unprivileged
    /// user is configured.
    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// First signal sent when the deadline expires or a stop is escalated.
    pub fn signal(mut self, signal: Signal) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Return as soon as the process is spawned; it outlives the caller's wait.
    pub fn detached(mut self, detached: bool) -> Self {
        self.detached = detached;
        self
    }

    /// Refuse to spawn while another live instance has the same signature.
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Bytes written to the child's stdin before it is closed.
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }

    pub fn args(&self) -> &[String] {
        self.argv.get(1..).unwrap_or_default()
    }

    pub fn signature(&self) -> Signature {
        Signature::from_argv(&self.argv)
    }

    pub fn get_working_dir(&self) -> Option<&PathBuf> {
        self.working_dir.as_ref()
    }

    pub fn get_env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn get_env_mode(&self) -> EnvMode {
        self.env_mode
    }

    pub fn get_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    pub fn get_signal(&self) -> Option<Signal> {
        self.signal
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn get_stdin(&self) -> Option<&[u8]> {
        self.stdin.as_deref()
    }

    /// Checks the command before any OS call is attempted.
    pub fn validate(&self) -> Result<(), SpecError> {
        let program = self.argv.first().ok_or(SpecError::EmptyArgv)?;
        if program.trim().is_empty() {
            return Err(SpecError::EmptyProgram);
        }
        if let Some(index) = self.argv.iter().position(|arg| arg.contains('\0')) {
            return Err(SpecError::NulByte { index });
        }
        Ok(())
    }
}
