use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgGroup, Args, Parser, Subcommand, ValueEnum};
use procwarden_exec::Signal;

#[derive(Debug, Parser)]
#[command(
    name = "procwarden",
    version,
    about = "Run, find and stop processes with TERM-to-KILL escalation"
)]
pub struct Cli {
    /// Configuration file layered over the system file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Print lifecycle events as JSON lines on stderr
    #[arg(long, global = true)]
    pub events: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a command and report its output and exit code
    Run(RunArgs),
    /// List pids whose command line matches exactly
    Pids(MatchArgs),
    /// Exit 0 when the process is running
    Running(RunningArgs),
    /// Signal one process, optionally escalating to KILL
    Stop(StopArgs),
    /// Signal every process whose command line matches
    Kill(KillArgs),
    /// Keep a single instance of a long-running command
    Daemon(DaemonArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Terminate the command after this many seconds
    #[arg(long, value_name = "SECS", value_parser = parse_seconds)]
    pub timeout: Option<Duration>,

    #[arg(long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Environment override, repeatable
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    pub env: Vec<(String, String)>,

    /// Start from an empty environment instead of inheriting
    #[arg(long)]
    pub replace_env: bool,

    /// Skip the unprivileged-user wrapper
    #[arg(long)]
    pub privileged: bool,

    /// First signal sent on timeout
    #[arg(long, value_name = "SIG")]
    pub signal: Option<Signal>,

    /// Return right after spawning and leave the process running
    #[arg(long)]
    pub detach: bool,

    /// Refuse to start while the same command line is tracked
    #[arg(long)]
    pub exclusive: bool,

    #[arg(last = true, required = true, value_name = "ARGV")]
    pub argv: Vec<String>,
}

#[derive(Debug, Args)]
pub struct MatchArgs {
    #[arg(last = true, required = true, value_name = "ARGV")]
    pub argv: Vec<String>,
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("target").required(true).args(["pid", "argv"])))]
pub struct RunningArgs {
    #[arg(long)]
    pub pid: Option<i32>,

    #[arg(last = true, value_name = "ARGV")]
    pub argv: Vec<String>,
}

#[derive(Debug, Args)]
pub struct StopArgs {
    #[arg(long)]
    pub pid: i32,

    /// Defaults to `termination.default_signal`
    #[arg(long, value_name = "SIG")]
    pub signal: Option<Signal>,

    /// Signal the whole process group
    #[arg(long)]
    pub group: bool,

    /// Follow up with KILL and wait until the process is gone
    #[arg(long)]
    pub escalate: bool,

    /// Serial device whose lock file is removed after a confirmed stop
    #[arg(long, value_name = "DEV", requires = "escalate")]
    pub lock_device: Option<String>,
}

#[derive(Debug, Args)]
pub struct KillArgs {
    #[arg(long, value_name = "SIG")]
    pub signal: Option<Signal>,

    #[arg(last = true, required = true, value_name = "ARGV")]
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DaemonAction {
    Start,
    Stop,
    Status,
}

#[derive(Debug, Args)]
pub struct DaemonArgs {
    pub action: DaemonAction,

    /// Serial device the daemon locks
    #[arg(long, value_name = "DEV")]
    pub lock_device: Option<String>,

    #[arg(last = true, required = true, value_name = "ARGV")]
    pub argv: Vec<String>,
}

fn parse_seconds(raw: &str) -> Result<Duration, String> {
    let seconds: f64 = raw
        .parse()
        .map_err(|err| format!("invalid number of seconds `{raw}`: {err}"))?;
    Duration::try_from_secs_f64(seconds).map_err(|err| format!("invalid timeout `{raw}`: {err}"))
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}
