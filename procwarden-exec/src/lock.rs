//! UUCP-style serial port lock files (`/var/lock/LCK..ttyUSB0`).
//!
//! A dial-up daemon that dies without cleaning up leaves its lock behind and
//! the port stays unusable. Cleanup is delete-if-exists: concurrent removal
//! by another party is not an error.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::pid::Pid;

const LOCK_PREFIX: &str = "LCK..";

/// Lock file path for `device`, which may be given as `/dev/ttyUSB0` or
/// `ttyUSB0`.
pub fn serial_lock_path(lock_dir: &Path, device: &str) -> PathBuf {
    let name = Path::new(device)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(device);
    lock_dir.join(format!("{LOCK_PREFIX}{name}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRemoval {
    Removed,
    /// Nothing to remove.
    Absent,
    /// Removal failed; already logged.
    Failed,
}

impl LockRemoval {
    /// True unless the file may still be there.
    pub fn is_clean(self) -> bool {
        !matches!(self, Self::Failed)
    }
}

pub fn remove_lock_file(path: &Path) -> LockRemoval {
    match fs::remove_file(path) {
        Ok(()) => {
            tracing::info!(path = %path.display(), "removed lock file");
            LockRemoval::Removed
        }
        Err(err) if err.kind() == ErrorKind::NotFound => LockRemoval::Absent,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove lock file");
            LockRemoval::Failed
        }
    }
}

/// Pid recorded in a lock file. Both the ASCII (`"      1234\n"`) and the
/// legacy 4-byte binary layouts are understood.
pub fn lock_owner(path: &Path) -> Option<Pid> {
    let raw = fs::read(path).ok()?;
    if let Some(pid) = std::str::from_utf8(&raw)
        .ok()
        .and_then(|text| text.trim().parse::<i32>().ok())
    {
        return Some(Pid::new(pid)).filter(|pid| pid.is_valid());
    }
    let bytes: [u8; 4] = raw.as_slice().try_into().ok()?;
    Some(Pid::new(i32::from_ne_bytes(bytes))).filter(|pid| pid.is_valid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_path_uses_device_basename() {
        let dir = Path::new("/var/lock");
        assert_eq!(
            serial_lock_path(dir, "/dev/ttyUSB0"),
            PathBuf::from("/var/lock/LCK..ttyUSB0")
        );
        assert_eq!(
            serial_lock_path(dir, "ttyACM1"),
            PathBuf::from("/var/lock/LCK..ttyACM1")
        );
    }

    #[test]
    fn removal_is_idempotent() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = serial_lock_path(dir.path(), "/dev/ttyUSB0");
        fs::write(&path, "      4242\n")?;

        assert_eq!(lock_owner(&path), Some(Pid::new(4242)));
        assert_eq!(remove_lock_file(&path), LockRemoval::Removed);
        assert_eq!(remove_lock_file(&path), LockRemoval::Absent);
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn removal_failure_is_reported_not_raised() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        // A directory cannot be removed with remove_file.
        let path = dir.path().join("LCK..ttyS0");
        fs::create_dir(&path)?;
        assert_eq!(remove_lock_file(&path), LockRemoval::Failed);
        assert!(!LockRemoval::Failed.is_clean());
        Ok(())
    }

    #[test]
    fn binary_lock_owner() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("LCK..ttyS1");
        fs::write(&path, 77_i32.to_ne_bytes())?;
        assert_eq!(lock_owner(&path), Some(Pid::new(77)));
        fs::write(&path, "garbage")?;
        assert_eq!(lock_owner(&path), None);
        Ok(())
    }
}
