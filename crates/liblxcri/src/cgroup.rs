//! Cgroup (v2) helpers.
//!
//! The engine creates and enters the container cgroup; the runtime only
//! reserves the directory at create time, waits for it to drain on delete
//! and removes it afterwards.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::statfs;

use crate::utils::Deadline;
use crate::Result;

pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

#[derive(Debug, thiserror::Error)]
pub enum CgroupError {
    #[error("cgroup {0:?} already exists")]
    Exists(PathBuf),
    #[error("failed to create cgroup {path:?}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to delete cgroup {path:?}")]
    Delete {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// State parsed from a `cgroup.events` file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CgroupEvents {
    pub populated: bool,
    pub frozen: bool,
}

fn parse_events(data: &str) -> CgroupEvents {
    let mut events = CgroupEvents::default();
    for line in data.lines() {
        match line.split_once(' ') {
            Some(("populated", v)) => events.populated = v.trim() == "1",
            Some(("frozen", v)) => events.frozen = v.trim() == "1",
            _ => {}
        }
    }
    events
}

/// Detects the cgroup2 filesystem root.
pub fn detect_cgroup_root() -> PathBuf {
    for root in [DEFAULT_CGROUP_ROOT, "/sys/fs/cgroup/unified"] {
        if let Ok(info) = statfs::statfs(root) {
            if info.filesystem_type() == statfs::CGROUP2_SUPER_MAGIC {
                return PathBuf::from(root);
            }
        }
    }
    tracing::warn!("cgroup2 root detection failed, using {DEFAULT_CGROUP_ROOT}");
    PathBuf::from(DEFAULT_CGROUP_ROOT)
}

/// Expands a systemd encoded cgroups path `slice:prefix:name` into a
/// filesystem path, e.g `machine.slice:lxcri:x` becomes
/// `machine.slice/lxcri-x.scope`. Plain paths are returned unchanged.
pub fn parse_systemd_cgroup_path(path: &str) -> PathBuf {
    let mut parts = path.splitn(3, ':');
    let (Some(slice), Some(prefix)) = (parts.next(), parts.next()) else {
        return PathBuf::from(path);
    };
    let name = parts.next().unwrap_or("");

    let mut out = expand_slice(slice);
    if prefix.is_empty() {
        out.push(format!("{name}.scope"));
    } else {
        out.push(format!("{prefix}-{name}.scope"));
    }
    out
}

/// Expands a systemd slice name into its nested directory form:
/// `machine-lxc.slice` becomes `machine.slice/machine-lxc.slice`.
fn expand_slice(slice: &str) -> PathBuf {
    let Some(stem) = slice.strip_suffix(".slice") else {
        return PathBuf::from(slice);
    };
    if stem.is_empty() || slice == "-.slice" {
        return PathBuf::new();
    }

    let mut out = PathBuf::new();
    let mut prefix = String::new();
    for part in stem.split('-') {
        if !prefix.is_empty() {
            prefix.push('-');
        }
        prefix.push_str(part);
        out.push(format!("{prefix}.slice"));
    }
    out
}

/// Reserves the container cgroup directory. Two containers configured with
/// the same cgroups path collide here, the second create fails.
pub fn create_cgroup(root: &Path, dir: &Path) -> std::result::Result<PathBuf, CgroupError> {
    let path = root.join(dir);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| CgroupError::Create {
            path: parent.to_owned(),
            source: err,
        })?;
    }
    match fs::create_dir(&path) {
        Ok(()) => Ok(path),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(CgroupError::Exists(path))
        }
        Err(err) => Err(CgroupError::Create { path, source: err }),
    }
}

/// Polls the `cgroup.events` file until the predicate matches or the
/// deadline expires. Changes are signalled through POLLPRI on the events
/// file, so this does not busy-loop on /proc.
pub fn poll_cgroup_events(
    events_file: &Path,
    deadline: &Deadline,
    predicate: impl Fn(&CgroupEvents) -> bool,
) -> Result<()> {
    let mut file = File::open(events_file)?;
    let mut data = String::new();

    loop {
        data.clear();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_string(&mut data)?;
        let events = parse_events(&data);
        tracing::trace!(file = ?events_file, ?events, "cgroup events");
        if predicate(&events) {
            return Ok(());
        }

        let remaining = deadline.remaining()?;
        let timeout_ms = remaining.min(Duration::from_millis(200)).as_millis() as i32;
        let file_fd = file.as_fd();
        let mut fds = [PollFd::new(&file_fd, PollFlags::POLLPRI)];
        poll(&mut fds, timeout_ms.max(1))?;
    }
}

/// Waits until no live process is left in the cgroup.
pub fn wait_drained(cgroup_dir: &Path, deadline: &Deadline) -> Result<()> {
    let events_file = cgroup_dir.join("cgroup.events");
    poll_cgroup_events(&events_file, deadline, |ev| !ev.populated)
}

/// Removes the cgroup directory and any nested cgroups. cgroup2
/// directories only support rmdir, and a missing directory is not an
/// error.
pub fn delete_cgroup(cgroup_dir: &Path) -> std::result::Result<(), CgroupError> {
    fn remove(dir: &Path) -> std::io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                remove(&entry.path())?;
            }
        }
        fs::remove_dir(dir)
    }

    match remove(cgroup_dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(CgroupError::Delete {
            path: cgroup_dir.to_owned(),
            source: err,
        }),
    }
}
