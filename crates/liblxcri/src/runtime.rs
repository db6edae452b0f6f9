//! The runtime: shared configuration and the OCI lifecycle verbs.

use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use nix::sys::signal::Signal;
use nix::unistd::Uid;
use oci_spec::runtime::{HookBuilder, Hooks, LinuxNamespaceType, Spec};
use serde::{Deserialize, Serialize};

use crate::container::{Container, ContainerStatus};
use crate::engine::EngineVersion;
use crate::hooks::{self, HookPhase};
use crate::utils::{self, Deadline};
use crate::{cgroup, specutil, store};
use crate::{LxcriError, Result, EXEC_HOOK, EXEC_HOOK_BUILTIN, EXEC_INIT, EXEC_START};

/// Environment variable set by container build tooling (buildah) when the
/// runtime is started inside a preconfigured user namespace.
const USERNS_CONFIGURED_ENV: &str = "_CONTAINERS_USERNS_CONFIGURED";

/// Environment variables passed through to the monitor process.
const MONITOR_ENV_ALLOWLIST: [&str; 4] = ["HOME", "XDG_RUNTIME_DIR", "PATH", "LISTEN_FDS"];

/// Security features supported by the runtime. Enabled features apply to
/// every container created by the runtime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeFeatures {
    pub seccomp: bool,
    pub capabilities: bool,
    pub apparmor: bool,
    pub cgroup_devices: bool,
}

impl Default for RuntimeFeatures {
    fn default() -> Self {
        Self {
            seccomp: true,
            capabilities: true,
            apparmor: true,
            cgroup_devices: true,
        }
    }
}

/// Per-verb timeouts in seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub create: u64,
    pub start: u64,
    pub kill: u64,
    pub delete: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            create: 60,
            start: 30,
            kill: 10,
            delete: 10,
        }
    }
}

/// Log sink configuration for runtime and engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub log_file: Option<PathBuf>,
    pub log_level: Option<String>,
    pub container_log_file: Option<PathBuf>,
    pub container_log_level: Option<String>,
}

/// The runtime is a factory for creating and managing containers.
/// One value is constructed per CLI invocation and threaded through the
/// verbs explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Runtime {
    /// Directory for per-container runtime state.
    pub root: PathBuf,
    /// Directory that contains the runtime executables
    /// (lxcri-start, lxcri-init, lxcri-hook).
    pub libexec_dir: PathBuf,
    /// Cgroup for the engine monitor process, similar to
    /// crio.conf#conmon_cgroup.
    pub monitor_cgroup: PathBuf,
    /// Default cgroup for container payloads, used when
    /// `linux.cgroups_path` is empty.
    pub payload_cgroup: PathBuf,
    pub features: RuntimeFeatures,
    pub log: LogConfig,
    pub timeouts: Timeouts,

    #[serde(skip)]
    pub hooks: Hooks,
    #[serde(skip)]
    monitor_env: Vec<(String, String)>,
    #[serde(skip)]
    userns_configured: bool,
    #[serde(skip)]
    cgroup_root: PathBuf,
    #[serde(skip)]
    engine_version: EngineVersion,
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/run/lxcri"),
            libexec_dir: PathBuf::from("/usr/libexec/lxcri"),
            monitor_cgroup: PathBuf::from("lxcri-monitor.slice"),
            payload_cgroup: PathBuf::from("lxcri.slice"),
            features: RuntimeFeatures::default(),
            log: LogConfig {
                log_file: Some(PathBuf::from("/var/log/lxcri/lxcri.log")),
                log_level: Some("info".to_string()),
                container_log_file: Some(PathBuf::from("/var/log/lxcri/lxcri.log")),
                container_log_level: Some("warn".to_string()),
            },
            timeouts: Timeouts::default(),
            hooks: Hooks::default(),
            monitor_env: Vec::new(),
            userns_configured: false,
            cgroup_root: PathBuf::from(cgroup::DEFAULT_CGROUP_ROOT),
            engine_version: EngineVersion::default(),
            config_path: None,
        }
    }
}

impl Runtime {
    /// Returns the default runtime configuration. With user set, runtime
    /// root and log paths move to user-writable locations.
    pub fn new(user: bool) -> Self {
        let mut rt = Self::default();
        if user {
            let base = PathBuf::from(format!("/var/tmp/lxcri/user/{}", Uid::current()));
            rt.root = base.join("run");
            let log = base.join("lxcri.log");
            rt.log.log_file = Some(log.clone());
            rt.log.container_log_file = Some(log);
        }
        rt
    }

    /// Resolves the runtime configuration file path:
    /// 1. the `LXCRI_CONFIG` environment variable
    /// 2. `$HOME/.config/lxcri.yaml`
    /// 3. `/etc/lxcri/lxcri.yaml`
    pub fn default_config_path() -> PathBuf {
        if let Ok(path) = std::env::var("LXCRI_CONFIG") {
            if !path.is_empty() {
                return PathBuf::from(path);
            }
        }
        if let Ok(home) = std::env::var("HOME") {
            if !home.is_empty() {
                let path = Path::new(&home).join(".config/lxcri.yaml");
                if path.is_file() {
                    return path;
                }
            }
        }
        PathBuf::from("/etc/lxcri/lxcri.yaml")
    }

    /// Loads the runtime configuration file. Values set in the file
    /// overlay the current configuration. A missing file is ignored.
    pub fn load_config(&mut self, path: Option<PathBuf>) -> Result<()> {
        let path = path.unwrap_or_else(Self::default_config_path);
        let data = match fs::read_to_string(&path) {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
            Ok(data) => data,
        };
        let overlay: ConfigOverlay = serde_yaml::from_str(&data)
            .map_err(|err| LxcriError::InvalidSpec(format!("invalid config file: {err}")))?;
        overlay.apply(self);
        self.config_path = Some(path);
        Ok(())
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Initializes the runtime: creates the runtime root, verifies the
    /// system configuration and probes the engine version. Must be called
    /// once before any verb.
    pub fn init(&mut self) -> Result<()> {
        tracing::debug!(root = ?self.root, "using runtime root");
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o711)
            .create(&self.root)?;

        self.userns_configured = std::env::var_os(USERNS_CONFIGURED_ENV).is_some();

        for name in MONITOR_ENV_ALLOWLIST {
            if let Ok(val) = std::env::var(name) {
                tracing::debug!(name, "keeping environment variable");
                self.monitor_env.push((name.to_string(), val));
            }
        }

        utils::can_execute(
            [
                self.libexec(EXEC_START),
                self.libexec(EXEC_HOOK),
                self.libexec(EXEC_INIT),
            ]
            .iter()
            .map(PathBuf::as_path),
        )?;

        utils::ensure_procfs(Path::new("/proc"))?;

        self.cgroup_root = cgroup::detect_cgroup_root();
        tracing::info!(root = ?self.cgroup_root, "using cgroup root");

        let monitor = self.libexec(EXEC_START);
        self.engine_version = EngineVersion::probe(&monitor)
            .map_err(|err| LxcriError::Engine(format!("failed to probe engine version: {err}")))?
            .ok_or_else(|| LxcriError::Engine("engine version probe returned garbage".into()))?;
        if !self.engine_version.at_least(3, 1, 0) {
            return Err(LxcriError::Engine(format!(
                "engine version is {}, but >= 3.1.0 is required",
                self.engine_version
            )));
        }
        if !self.engine_version.at_least(4, 0, 9) {
            tracing::warn!(
                version = %self.engine_version,
                "engine version >= 4.0.9 is required for lxc.init.groups support"
            );
        }

        self.hooks.set_create_container(Some(vec![HookBuilder::default()
            .path(self.libexec(EXEC_HOOK_BUILTIN))
            .build()?]));
        Ok(())
    }

    pub fn libexec(&self, name: &str) -> PathBuf {
        self.libexec_dir.join(name)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cgroup_root(&self) -> &Path {
        &self.cgroup_root
    }

    #[cfg(test)]
    pub(crate) fn cgroup_root_for_tests(&mut self, path: PathBuf) {
        self.cgroup_root = path;
    }

    pub(crate) fn monitor_env(&self) -> &[(String, String)] {
        &self.monitor_env
    }

    pub fn userns_configured(&self) -> bool {
        self.userns_configured
    }

    pub(crate) fn supports_init_groups(&self) -> bool {
        self.engine_version.at_least(4, 0, 9)
    }

    pub fn is_privileged(&self) -> bool {
        // inside a preconfigured user namespace uid 0 is not the host root
        !self.userns_configured && Uid::effective().is_root()
    }

    pub(crate) fn container_runtime_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Validates the spec invariants that must hold before translation.
    pub(crate) fn check_spec(&self, spec: &mut Spec) -> Result<()> {
        let root_path = spec
            .root()
            .as_ref()
            .map(|r| r.path().clone())
            .unwrap_or_default();
        if root_path.as_os_str().is_empty() {
            return Err(LxcriError::InvalidSpec("empty spec.root.path".to_string()));
        }

        let Some(mut process) = spec.process().clone() else {
            return Err(LxcriError::InvalidSpec("spec.process is empty".to_string()));
        };
        if process.args().as_deref().unwrap_or(&[]).is_empty() {
            return Err(LxcriError::InvalidSpec(
                "spec.process.args is empty".to_string(),
            ));
        }
        if process.cwd().as_os_str().is_empty() {
            tracing::info!("spec.process.cwd is unset, defaulting to '/'");
            process.set_cwd(PathBuf::from("/"));
            spec.set_process(Some(process));
        }

        let mount_ns = specutil::get_namespace(spec, LinuxNamespaceType::Mount);
        if specutil::is_namespace_shared_with_runtime(mount_ns, "mnt")? {
            return Err(LxcriError::InvalidSpec(
                "mount namespace shared with runtime".to_string(),
            ));
        }

        // Sharing the runtime PID namespace is not best practise but
        // containers do it, e.g sonobuoy-systemd-logs-daemon-set.
        let pid_ns = specutil::get_namespace(spec, LinuxNamespaceType::Pid);
        if specutil::is_namespace_shared_with_runtime(pid_ns, "pid")? {
            tracing::warn!("container shares the PID namespace with the runtime");
        }
        Ok(())
    }

    /// Loads a container previously created with [Runtime::create].
    pub fn load(&self, container_id: &str) -> Result<Container> {
        tracing::debug!(cid = container_id, "loading container");
        let dir = self.container_runtime_dir(container_id);
        if !dir.exists() {
            return Err(LxcriError::NotExist);
        }
        Container::load(dir, self.cgroup_root.clone())
    }

    /// Returns the IDs of all existing containers.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let name = entry?.file_name();
            if let Some(name) = name.to_str() {
                if !name.starts_with('.') {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Unblocks the init process, which then executes the container
    /// process, and runs the poststart hooks.
    pub fn start(&self, container: &mut Container, deadline: &Deadline) -> Result<()> {
        tracing::info!("notify init to start container process");

        let status = container.status();
        if !status.can_start() {
            return Err(LxcriError::InvalidState {
                state: status.to_string(),
                expected: ContainerStatus::Created.to_string(),
            });
        }

        container.unblock_init(deadline)?;
        container.wait_running(deadline)?;

        if let Some(spec_hooks) = container.spec().hooks() {
            let state = container.state();
            hooks::run_hooks(
                HookPhase::Poststart,
                hooks::hooks_for(spec_hooks, HookPhase::Poststart),
                &state,
                deadline,
            )?;
        }
        Ok(())
    }

    /// Sends the signal to the container init process.
    pub fn kill(&self, container: &Container, signal: Signal) -> Result<()> {
        let status = container.status();
        if !status.can_kill() {
            return Err(LxcriError::InvalidState {
                state: status.to_string(),
                expected: "created|running".to_string(),
            });
        }
        container.kill(signal)
    }

    /// Removes the container from the runtime directory. The container
    /// must be stopped, or force must be set to kill it first.
    pub fn delete(&self, container_id: &str, force: bool, deadline: &Deadline) -> Result<()> {
        tracing::info!(cid = container_id, force, "delete container");
        let container = match self.load(container_id) {
            Err(LxcriError::NotExist) => return Err(LxcriError::NotExist),
            Err(err) => {
                // no hooks will run in this case
                tracing::warn!(%err, "deleting runtime dir for unloadable container");
                store::remove(&self.container_runtime_dir(container_id))?;
                return Ok(());
            }
            Ok(container) => container,
        };
        self.delete_container(&container, force, deadline)
    }

    pub(crate) fn delete_container(
        &self,
        container: &Container,
        force: bool,
        deadline: &Deadline,
    ) -> Result<()> {
        let status = container.status();
        if status != ContainerStatus::Stopped {
            tracing::debug!(%status, "delete requested for a container that is not stopped");
            if !force {
                return Err(LxcriError::InvalidState {
                    state: status.to_string(),
                    expected: ContainerStatus::Stopped.to_string(),
                });
            }
            // the container may die between the status check and the kill
            if let Err(err) = container.kill(Signal::SIGKILL) {
                tracing::warn!(%err, "failed to kill container");
            }
        }

        if let Err(err) = container.wait_monitor_stopped(deadline) {
            tracing::error!(pid = ?container.monitor_pid, %err, "failed to stop monitor process");
        }

        // Resources not created by the runtime must not be deleted: the
        // engine container is configured with rootfs.managed=0, so there
        // is no engine-side state beyond the runtime directory.

        // The monitor may still be a member of the cgroup, wait for the
        // cgroup to drain before removing it.
        match cgroup::wait_drained(&container.cgroup_path(), deadline) {
            Err(LxcriError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                // try to delete the cgroup anyways
                tracing::warn!(%err, "failed to wait until cgroup.events populated=0");
            }
            Ok(()) => {}
        }
        cgroup::delete_cgroup(&container.cgroup_path())?;
        cgroup::delete_cgroup(&self.cgroup_root.join(&container.monitor_cgroup_dir))?;

        if let Some(spec_hooks) = container.spec().hooks() {
            let state = container.state();
            hooks::run_hooks(
                HookPhase::Poststop,
                hooks::hooks_for(spec_hooks, HookPhase::Poststop),
                &state,
                deadline,
            )?;
        }

        store::remove(container.runtime_dir())?;
        Ok(())
    }
}

/// Partial runtime configuration parsed from the YAML config file.
/// Only fields present in the file overwrite the current values.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigOverlay {
    root: Option<PathBuf>,
    libexec_dir: Option<PathBuf>,
    monitor_cgroup: Option<PathBuf>,
    payload_cgroup: Option<PathBuf>,
    features: Option<RuntimeFeatures>,
    log: Option<LogConfig>,
    timeouts: Option<Timeouts>,
}

impl ConfigOverlay {
    fn apply(self, rt: &mut Runtime) {
        if let Some(root) = self.root {
            rt.root = root;
        }
        if let Some(libexec_dir) = self.libexec_dir {
            rt.libexec_dir = libexec_dir;
        }
        if let Some(monitor_cgroup) = self.monitor_cgroup {
            rt.monitor_cgroup = monitor_cgroup;
        }
        if let Some(payload_cgroup) = self.payload_cgroup {
            rt.payload_cgroup = payload_cgroup;
        }
        if let Some(features) = self.features {
            rt.features = features;
        }
        if let Some(log) = self.log {
            rt.log = log;
        }
        if let Some(timeouts) = self.timeouts {
            rt.timeouts = timeouts;
        }
    }
}
