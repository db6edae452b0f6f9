//! Small filesystem and timing helpers shared across the runtime.

use std::fs::{self, OpenOptions};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::time::{Duration, Instant};

use nix::sys::statfs;

use crate::{LxcriError, Result};

/// A verb deadline. Every blocking wait in the runtime (sync FIFO, console
/// socket, cgroup events, monitor exit) checks the deadline and returns
/// [LxcriError::Timeout] once it expired.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    end: Instant,
    op: &'static str,
}

impl Deadline {
    pub fn after(timeout: Duration, op: &'static str) -> Self {
        Self {
            end: Instant::now() + timeout,
            op,
        }
    }

    pub fn seconds(secs: u64, op: &'static str) -> Self {
        Self::after(Duration::from_secs(secs), op)
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.end
    }

    /// Remaining time, or a timeout error if the deadline has passed.
    pub fn remaining(&self) -> Result<Duration> {
        let now = Instant::now();
        if now >= self.end {
            return Err(LxcriError::Timeout { op: self.op });
        }
        Ok(self.end - now)
    }

    /// Sleep for `interval`, clamped to the remaining time.
    pub fn sleep(&self, interval: Duration) -> Result<()> {
        let remaining = self.remaining()?;
        std::thread::sleep(remaining.min(interval));
        Ok(())
    }

    pub fn op(&self) -> &'static str {
        self.op
    }
}

/// Returns true if path is a regular file with at least one execute bit set.
pub fn is_executable(path: &Path) -> std::io::Result<bool> {
    let metadata = path.metadata()?;
    Ok(metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
}

/// Checks that all given binaries exist and are executable.
pub fn can_execute<'a>(paths: impl IntoIterator<Item = &'a Path>) -> Result<()> {
    for path in paths {
        match is_executable(path) {
            Ok(true) => {}
            Ok(false) => {
                return Err(LxcriError::Engine(format!(
                    "{} is not executable",
                    path.display()
                )))
            }
            Err(err) => {
                return Err(LxcriError::Engine(format!(
                    "failed to access {}: {err}",
                    path.display()
                )))
            }
        }
    }
    Ok(())
}

/// Verifies that procfs is mounted on the given path.
/// The runtime depends on /proc for init state detection.
pub fn ensure_procfs(path: &Path) -> Result<()> {
    let info = statfs::statfs(path)?;
    if info.filesystem_type() != statfs::PROC_SUPER_MAGIC {
        return Err(LxcriError::Engine(format!(
            "procfs is not mounted on {}",
            path.display()
        )));
    }
    Ok(())
}

/// Creates an empty file, used as bind mount anchor for the init binary.
pub fn touch(path: &Path, mode: u32) -> std::io::Result<()> {
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .mode(mode)
        .open(path)
        .map(|_| ())
}

/// Writes the PID file for `create --pid-file` and `exec --pid-file`.
pub fn create_pid_file(path: &Path, pid: i32) -> std::io::Result<()> {
    fs::write(path, format!("{pid}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_expires() {
        let d = Deadline::after(Duration::from_millis(5), "test");
        assert!(!d.expired());
        std::thread::sleep(Duration::from_millis(10));
        assert!(d.expired());
        assert!(matches!(
            d.remaining(),
            Err(LxcriError::Timeout { op: "test" })
        ));
    }

    #[test]
    fn test_is_executable() {
        let tmp = tempfile::tempdir().unwrap();
        let plain = tmp.path().join("plain");
        std::fs::write(&plain, "").unwrap();
        assert!(!is_executable(&plain).unwrap());
        assert!(is_executable(Path::new("/bin/sh")).unwrap());
        assert!(!is_executable(tmp.path()).unwrap());
        assert!(is_executable(Path::new("/does/not/exist")).is_err());
    }

    #[test]
    fn test_ensure_procfs() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(ensure_procfs(Path::new("/proc")).is_ok());
        assert!(ensure_procfs(tmp.path()).is_err());
    }
}
