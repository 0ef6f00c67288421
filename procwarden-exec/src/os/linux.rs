use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use super::{ProcessInfo, ProcessOs};
use crate::pid::Pid;
use crate::process_group;

const PROC_ROOT: &str = "/proc";

/// Process list backed by procfs.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
    self_pid: Pid,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcFs {
    pub fn new() -> Self {
        Self::with_root(PROC_ROOT)
    }

    /// Read from an alternate procfs mount (tests point this at a fixture).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            self_pid: Pid::from(std::process::id()),
        }
    }

    fn read_command_line(&self, pid_dir: &Path) -> io::Result<String> {
        let raw = fs::read(pid_dir.join("cmdline"))?;
        Ok(join_cmdline(&raw))
    }
}

impl ProcessOs for ProcFs {
    fn enumerate_processes(&self) -> io::Result<Vec<ProcessInfo>> {
        let mut processes = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let Ok(entry) = entry else { continue };
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<i32>().ok())
                .map(Pid::new)
            else {
                continue;
            };
            if pid == self.self_pid {
                continue;
            }
            // Processes vanish between readdir and read; skip them.
            match self.read_command_line(&entry.path()) {
                Ok(line) if !line.is_empty() => processes.push(ProcessInfo::new(pid, line)),
                Ok(_) => {}
                Err(err) => {
                    tracing::trace!(pid = %pid, error = %err, "skipping unreadable process");
                }
            }
        }
        Ok(processes)
    }

    /// Scans `/proc` for live members; zombies left behind by a dead
    /// parent do not count.
    fn is_group_alive(&self, pgid: Pid) -> bool {
        if !pgid.is_valid() {
            return false;
        }
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::debug!(pgid = %pgid, error = %err, "procfs unreadable, falling back to killpg");
                return process_group::group_exists(pgid);
            }
        };
        entries.flatten().any(|entry| {
            let is_pid = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.bytes().all(|byte| byte.is_ascii_digit()));
            is_pid
                && fs::read_to_string(entry.path().join("stat"))
                    .ok()
                    .and_then(|stat| stat_group(&stat))
                    .is_some_and(|(state, group)| {
                        group == pgid && !matches!(state, 'Z' | 'X' | 'x')
                    })
        })
    }

    fn is_alive(&self, pid: Pid) -> bool {
        if !pid.is_valid() {
            return false;
        }
        let stat_path = self.root.join(pid.as_raw().to_string()).join("stat");
        match fs::read_to_string(&stat_path) {
            Ok(stat) => !matches!(stat_state(&stat), Some('Z' | 'X' | 'x')),
            Err(err) if err.kind() == ErrorKind::NotFound => false,
            Err(err) => {
                tracing::debug!(pid = %pid, error = %err, "stat unreadable, probing with signal 0");
                process_group::probe(pid)
            }
        }
    }
}

/// `/proc/<pid>/cmdline` is NUL separated with a trailing NUL.
fn join_cmdline(raw: &[u8]) -> String {
    raw.split(|byte| *byte == 0)
        .filter(|part| !part.is_empty())
        .map(String::from_utf8_lossy)
        .collect::<Vec<_>>()
        .join(" ")
}

/// State letter from `/proc/<pid>/stat`. The command name may itself contain
/// spaces and parentheses, so scan from the last `)`.
fn stat_state(stat: &str) -> Option<char> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.trim_start().chars().next()
}

/// State letter and process group id from `/proc/<pid>/stat`. The group is
/// the third field after the command name.
fn stat_group(stat: &str) -> Option<(char, Pid)> {
    let (_, rest) = stat.rsplit_once(')')?;
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let group = fields.nth(1)?.parse::<i32>().ok()?;
    Some((state, Pid::new(group)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_process(root: &Path, pid: i32, cmdline: &[u8], state: char) -> io::Result<()> {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("cmdline"), cmdline)?;
        fs::write(
            dir.join("stat"),
            format!("{pid} (odd) name) {state} 1 {pid} {pid} 0 -1"),
        )?;
        Ok(())
    }

    #[test]
    fn cmdline_is_joined_with_single_spaces() {
        assert_eq!(join_cmdline(b"pppd\0call\0provider\0"), "pppd call provider");
        assert_eq!(join_cmdline(b""), "");
    }

    #[test]
    fn stat_state_survives_parentheses_in_comm() {
        assert_eq!(stat_state("42 (a) b) S 1 2"), Some('S'));
        assert_eq!(stat_state("42 (zombie) Z 1"), Some('Z'));
        assert_eq!(stat_state("garbage"), None);
    }

    #[test]
    fn stat_group_reads_the_third_field() {
        assert_eq!(stat_group("42 (a) b) S 1 40 40"), Some(('S', Pid::new(40))));
        assert_eq!(stat_group("42 (x) Z 1"), None);
    }

    #[test]
    fn group_is_alive_while_a_live_member_remains() -> io::Result<()> {
        let root = tempfile::tempdir()?;
        fake_process(root.path(), 200, b"sh\0", 'Z')?;
        let procfs = ProcFs::with_root(root.path());
        assert!(!procfs.is_group_alive(Pid::new(200)));

        // A member whose group is 200: `fake_process` writes pgrp = pid, so
        // spell the stat out by hand.
        let member = root.path().join("201");
        fs::create_dir_all(&member)?;
        fs::write(member.join("cmdline"), b"sleep\x0030\0")?;
        fs::write(member.join("stat"), "201 (sleep) S 1 200 200 0 -1")?;
        assert!(procfs.is_group_alive(Pid::new(200)));
        assert!(!procfs.is_group_alive(Pid::new(201)));
        Ok(())
    }

    #[test]
    fn enumerates_fixture_tree() -> io::Result<()> {
        let root = tempfile::tempdir()?;
        fake_process(root.path(), 100, b"sleep\x0030\0", 'S')?;
        fake_process(root.path(), 101, b"", 'S')?;
        fake_process(root.path(), 102, b"defunct\0", 'Z')?;
        fs::create_dir_all(root.path().join("self"))?;

        let procfs = ProcFs::with_root(root.path());
        let mut processes = procfs.enumerate_processes()?;
        processes.sort_by_key(|info| info.pid);

        assert_eq!(
            processes,
            vec![
                ProcessInfo::new(Pid::new(100), "sleep 30"),
                ProcessInfo::new(Pid::new(102), "defunct"),
            ]
        );
        assert!(procfs.is_alive(Pid::new(100)));
        assert!(!procfs.is_alive(Pid::new(102)));
        assert!(!procfs.is_alive(Pid::new(999)));
        Ok(())
    }
}
