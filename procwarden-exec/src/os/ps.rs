use std::io;
use std::process::{Command, Stdio};

use super::{ProcessInfo, ProcessOs};
use crate::pid::Pid;
use crate::process_group;

/// Process list read from `ps -axo pid=,args=`, for Unix targets without
/// procfs.
#[derive(Debug, Clone, Copy, Default)]
pub struct PsOs;

impl ProcessOs for PsOs {
    fn enumerate_processes(&self) -> io::Result<Vec<ProcessInfo>> {
        let output = Command::new("ps")
            .args(["-axo", "pid=,args="])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()?;
        if !output.status.success() {
            return Err(io::Error::other(format!("ps exited with {}", output.status)));
        }
        let me = Pid::from(std::process::id());
        Ok(parse_ps_output(&String::from_utf8_lossy(&output.stdout))
            .into_iter()
            .filter(|info| info.pid != me)
            .collect())
    }

    fn is_alive(&self, pid: Pid) -> bool {
        process_group::probe(pid)
    }
}

fn parse_ps_output(stdout: &str) -> Vec<ProcessInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let (pid, args) = line.trim_start().split_once(char::is_whitespace)?;
            let pid = pid.parse::<i32>().ok().map(Pid::new)?;
            let args = args.split_whitespace().collect::<Vec<_>>().join(" ");
            (!args.is_empty()).then(|| ProcessInfo::new(pid, args))
        })
        .collect()
}
