//! The in-memory container handle.
//!
//! A container is created once by [Runtime::create](crate::runtime::Runtime)
//! and persisted as `lxcri.json` in the runtime directory. All subsequent
//! verbs re-hydrate the handle with [Container::load].

use std::ffi::OsStr;
use std::os::unix::prelude::RawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sys::signal::Signal;
use nix::sys::stat::Mode;
use nix::unistd::Pid;
use oci_spec::runtime::Spec;
use serde::{Deserialize, Serialize};

use crate::container::{ContainerStatus, OciState};
use crate::utils::Deadline;
use crate::{store, LxcriError, Result, BUNDLE_CONFIG_FILE};

/// Name of the serialized container handle in the runtime directory.
pub const CONTAINER_FILE: &str = "lxcri.json";
/// Name of the engine configuration file in the runtime directory.
pub const ENGINE_CONFIG_FILE: &str = "config";
/// Name of the sync fifo in the runtime directory.
pub const SYNC_FIFO_FILE: &str = "syncfifo";

/// Environment marker set by lxcri-init while it is blocked at the sync
/// fifo. Its presence in `/proc/<initpid>/environ` distinguishes `created`
/// from `running` without signalling the process.
pub const INIT_STATE_ENV: (&str, &str) = ("LXCRI_STATE", "created");

/// Per-container configuration passed to create.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub container_id: String,
    pub bundle_path: PathBuf,
    /// The OCI spec is persisted separately as `config.json` in the
    /// runtime directory, where the hook binary also reads it.
    #[serde(skip)]
    pub spec: Spec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub console_socket: Option<PathBuf>,
    /// Log file and level for the engine (container) log.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    /// The cgroups path in the spec is systemd encoded and must be
    /// expanded.
    #[serde(default)]
    pub systemd_cgroup: bool,
}

/// A container handle, bound to its runtime directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Container {
    #[serde(flatten)]
    pub config: ContainerConfig,

    /// PID of the monitor process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor_pid: Option<i32>,
    pub created_at: Option<DateTime<Utc>>,
    /// Container cgroup, relative to the cgroup root.
    pub cgroup_dir: PathBuf,
    /// Monitor cgroup, relative to the cgroup root.
    pub monitor_cgroup_dir: PathBuf,

    #[serde(skip)]
    runtime_dir: PathBuf,
    #[serde(skip)]
    cgroup_root: PathBuf,
}

impl Container {
    pub fn new(config: ContainerConfig, runtime_dir: PathBuf, cgroup_root: PathBuf) -> Self {
        Self {
            config,
            monitor_pid: None,
            created_at: None,
            cgroup_dir: PathBuf::new(),
            monitor_cgroup_dir: PathBuf::new(),
            runtime_dir,
            cgroup_root,
        }
    }

    /// Loads a container handle from its runtime directory.
    pub fn load(runtime_dir: PathBuf, cgroup_root: PathBuf) -> Result<Self> {
        let mut container: Container = store::read_json(&runtime_dir.join(CONTAINER_FILE))?;
        container.config.spec = Spec::load(runtime_dir.join(BUNDLE_CONFIG_FILE))?;
        container.runtime_dir = runtime_dir;
        container.cgroup_root = cgroup_root;
        Ok(container)
    }

    /// Persists the handle. Called exactly once, after the monitor started.
    pub fn save(&self) -> Result<()> {
        store::write_json_excl(&self.runtime_path(CONTAINER_FILE), self, 0o440)?;
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.config.container_id
    }

    pub fn spec(&self) -> &Spec {
        &self.config.spec
    }

    /// Builds an absolute path below the container runtime directory.
    pub fn runtime_path(&self, sub: impl AsRef<Path>) -> PathBuf {
        self.runtime_dir.join(sub)
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    pub fn config_file_path(&self) -> PathBuf {
        self.runtime_path(ENGINE_CONFIG_FILE)
    }

    pub fn sync_fifo_path(&self) -> PathBuf {
        self.runtime_path(SYNC_FIFO_FILE)
    }

    pub fn cgroup_path(&self) -> PathBuf {
        self.cgroup_root.join(&self.cgroup_dir)
    }

    fn process_alive(pid: Pid) -> bool {
        let Ok(proc) = procfs::process::Process::new(pid.as_raw()) else {
            return false;
        };
        match proc.stat().and_then(|stat| stat.state()) {
            Ok(procfs::process::ProcState::Zombie) | Ok(procfs::process::ProcState::Dead) => false,
            Ok(_) => true,
            Err(_) => false,
        }
    }

    pub fn monitor_alive(&self) -> bool {
        self.monitor_pid
            .is_some_and(|pid| Self::process_alive(Pid::from_raw(pid)))
    }

    /// PID of the container init process: the first member of the
    /// container cgroup, falling back to the monitor's first child.
    pub fn init_pid(&self) -> Option<Pid> {
        let procs = self.cgroup_path().join("cgroup.procs");
        if let Ok(data) = std::fs::read_to_string(procs) {
            if let Some(pid) = data
                .split_ascii_whitespace()
                .next()
                .and_then(|p| p.parse::<i32>().ok())
            {
                return Some(Pid::from_raw(pid));
            }
        }

        let monitor = self.monitor_pid?;
        let children = format!("/proc/{monitor}/task/{monitor}/children");
        let data = std::fs::read_to_string(children).ok()?;
        data.split_ascii_whitespace()
            .next()
            .and_then(|p| p.parse::<i32>().ok())
            .map(Pid::from_raw)
    }

    /// True while the init process environment carries the sync fifo
    /// marker, i.e the container process has not been exec'd yet.
    fn init_blocked(&self, pid: Pid) -> bool {
        let Ok(proc) = procfs::process::Process::new(pid.as_raw()) else {
            return false;
        };
        let Ok(environ) = proc.environ() else {
            return false;
        };
        environ
            .get(OsStr::new(INIT_STATE_ENV.0))
            .is_some_and(|v| v == OsStr::new(INIT_STATE_ENV.1))
    }

    /// Computes the container status from the engine's point of view.
    pub fn status(&self) -> ContainerStatus {
        if !self.monitor_alive() {
            return ContainerStatus::Stopped;
        }
        match self.init_pid() {
            None => ContainerStatus::Creating,
            Some(pid) => {
                if self.init_blocked(pid) {
                    ContainerStatus::Created
                } else if Self::process_alive(pid) {
                    ContainerStatus::Running
                } else {
                    ContainerStatus::Stopped
                }
            }
        }
    }

    /// The OCI state of the container.
    pub fn state(&self) -> OciState {
        let status = self.status();
        let pid = match status {
            ContainerStatus::Created | ContainerStatus::Running => {
                self.init_pid().map(|p| p.as_raw())
            }
            _ => None,
        };
        let mut state = OciState::new(self.id(), status, pid, &self.config.bundle_path);
        state.annotations = self.config.spec.annotations().clone();
        state
    }

    /// Sends the signal to the container init process.
    pub fn kill(&self, signal: Signal) -> Result<()> {
        let pid = self
            .init_pid()
            .ok_or_else(|| LxcriError::Engine("container init process not found".to_string()))?;
        tracing::info!(%signal, init = pid.as_raw(), "sending signal to init");
        nix::sys::signal::kill(pid, signal)?;
        Ok(())
    }

    /// Unblocks init by writing a single byte to the sync fifo. The write
    /// end can only be opened once init is blocked at the read end, so
    /// opening is retried until the deadline expires.
    pub(crate) fn unblock_init(&self, deadline: &Deadline) -> Result<()> {
        let fifo = self.sync_fifo_path();
        let fd: RawFd = loop {
            match open(&fifo, OFlag::O_WRONLY | OFlag::O_NONBLOCK, Mode::empty()) {
                Ok(fd) => break fd,
                // no reader yet
                Err(Errno::ENXIO) => deadline.sleep(Duration::from_millis(10))?,
                Err(err) => return Err(err.into()),
            }
        };
        let res = nix::unistd::write(fd, b"1");
        let _ = nix::unistd::close(fd);
        res?;
        Ok(())
    }

    fn wait_status(
        &self,
        deadline: &Deadline,
        accept: impl Fn(ContainerStatus) -> bool,
    ) -> Result<ContainerStatus> {
        loop {
            let status = self.status();
            if accept(status) {
                return Ok(status);
            }
            deadline.sleep(Duration::from_millis(20))?;
        }
    }

    /// Waits until init is blocked at the sync fifo (or the container
    /// failed early).
    pub(crate) fn wait_created(&self, deadline: &Deadline) -> Result<()> {
        let status = self.wait_status(deadline, |s| {
            matches!(s, ContainerStatus::Created | ContainerStatus::Stopped)
        })?;
        if status == ContainerStatus::Stopped {
            return Err(LxcriError::Engine(
                "container stopped before reaching created state".to_string(),
            ));
        }
        Ok(())
    }

    /// Waits until init has exec'd the container process.
    pub(crate) fn wait_running(&self, deadline: &Deadline) -> Result<()> {
        let status = self.wait_status(deadline, |s| {
            matches!(s, ContainerStatus::Running | ContainerStatus::Stopped)
        })?;
        // a short lived container process may already have exited
        tracing::debug!(%status, "container started");
        Ok(())
    }

    /// Waits for the monitor process to exit. The monitor is not a child
    /// of this process, so liveness is polled.
    pub(crate) fn wait_monitor_stopped(&self, deadline: &Deadline) -> Result<()> {
        while self.monitor_alive() {
            deadline.sleep(Duration::from_millis(20))?;
        }
        Ok(())
    }
}
