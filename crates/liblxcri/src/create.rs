//! The create verb: translates the OCI spec into the engine configuration,
//! materializes the runtime directory and starts the monitor process.

use std::fs::File;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};

use nix::sched::{setns, CloneFlags};
use nix::sys::signal::Signal;
use nix::sys::stat::{fchmodat, FchmodatFlags, Mode};
use nix::unistd::{sethostname, Uid};
use oci_spec::runtime::{
    LinuxDeviceCgroup, LinuxNamespace, LinuxNamespaceBuilder, LinuxNamespaceType, Mount,
    MountBuilder, Spec,
};

use crate::container::{Container, ContainerConfig, ContainerStatus, OciState};
use crate::engine::EngineConfig;
use crate::hooks::{self, HookPhase};
use crate::runtime::Runtime;
use crate::utils::Deadline;
use crate::{init, monitor, mount, seccomp, specutil, store};
use crate::{LxcriError, Result, EXEC_HOOK};

/// Annotation pointing runtime hooks at the engine config file.
const CONFIG_FILE_ANNOTATION: &str = "org.linuxcontainers.lxc.ConfigFile";
/// Annotation that enables a user namespace even for a privileged runtime.
const USERNS_ANNOTATION: &str = "org.linuxcontainers.lxcri.userns";

impl Runtime {
    /// Creates a container from the given configuration.
    ///
    /// This is the first verb in the lifecycle of a container. On success
    /// the container is in state `created`, with init blocked at the sync
    /// fifo. On failure the partial runtime directory is removed.
    pub fn create(&self, config: ContainerConfig, deadline: &Deadline) -> Result<Container> {
        if config.container_id.is_empty() {
            return Err(LxcriError::InvalidSpec("missing container ID".to_string()));
        }

        let runtime_dir = self.container_runtime_dir(&config.container_id);
        let mut container = Container::new(config, runtime_dir, self.cgroup_root().to_path_buf());

        self.check_spec(&mut container.config.spec)?;

        match store::create_dir(container.runtime_dir()) {
            Err(store::StoreError::Exists(_)) => return Err(LxcriError::AlreadyExists),
            Err(err) => return Err(err.into()),
            Ok(()) => {}
        }

        match self.create_container(&mut container, deadline) {
            Ok(()) => Ok(container),
            Err(err) => {
                tracing::error!(%err, "create failed, removing partial runtime state");
                self.cleanup_failed_create(&container);
                Err(err)
            }
        }
    }

    fn create_container(&self, container: &mut Container, deadline: &Deadline) -> Result<()> {
        let mut annotations = container
            .config
            .spec
            .annotations()
            .clone()
            .unwrap_or_default();
        annotations.insert(
            CONFIG_FILE_ANNOTATION.to_string(),
            container.config_file_path().display().to_string(),
        );
        container.config.spec.set_annotations(Some(annotations));

        let mut config = configure_container(self, container)?;

        specutil::clean_env(&mut container.config.spec, false);

        // The modified spec is serialized separately to make it available
        // for the engine-side hook binary.
        store::write_json_excl(
            &container.runtime_path(crate::BUNDLE_CONFIG_FILE),
            &container.config.spec,
            0o444,
        )?;
        store::write_json_excl(
            &container.runtime_path("hooks.json"),
            &container.config.spec.hooks(),
            0o444,
        )?;

        let mut state = OciState::new(
            container.id(),
            ContainerStatus::Creating,
            None,
            &container.config.bundle_path,
        );
        state.annotations = container.config.spec.annotations().clone();
        store::write_json_excl(&container.runtime_path("state.json"), &state, 0o444)?;

        monitor::start_monitor(self, container, &mut config, deadline)
    }

    fn cleanup_failed_create(&self, container: &Container) {
        if container.monitor_pid.is_some() {
            if let Err(err) = container.kill(Signal::SIGKILL) {
                tracing::warn!(%err, "failed to kill partially created container");
            }
        }
        if !container.cgroup_dir.as_os_str().is_empty() {
            let _ = crate::cgroup::delete_cgroup(&container.cgroup_path());
        }
        if let Err(err) = store::remove(container.runtime_dir()) {
            tracing::warn!(%err, "failed to remove partial runtime directory");
        }
    }
}

/// Translates the spec into engine config entries. The entry order is
/// fixed so the rendered config is identical for identical specs.
fn configure_container(rt: &Runtime, c: &mut Container) -> Result<EngineConfig> {
    let mut spec = std::mem::take(&mut c.config.spec);
    let mut config = EngineConfig::new();

    let result = configure_spec(rt, c, &mut spec, &mut config);
    c.config.spec = spec;
    result?;
    Ok(config)
}

fn configure_spec(
    rt: &Runtime,
    c: &mut Container,
    spec: &mut Spec,
    config: &mut EngineConfig,
) -> Result<()> {
    configure_engine_log(rt, c, config);
    configure_hostname(spec, config)?;
    configure_rootfs(rt, &c.config.bundle_path, spec, config)?;

    // mount point for the runtime directory bind mount
    let rootfs = spec
        .root()
        .as_ref()
        .map(|r| r.path().clone())
        .unwrap_or_default();
    std::fs::create_dir_all(rootfs.join(".lxcri"))?;

    configure_user_namespace(rt, spec)?;
    configure_namespaces(spec, config)?;
    init::configure_init(rt, c, spec, config)?;

    if let Some(process) = spec.process() {
        if let Some(oom_score_adj) = process.oom_score_adj() {
            config.set("lxc.proc.oom_score_adj", format!("{oom_score_adj}"));
        }
        if process.no_new_privileges().unwrap_or(false) {
            config.set("lxc.no_new_privs", "1");
        }
    }

    if rt.features.apparmor {
        configure_apparmor(spec, config);
    } else {
        tracing::warn!("apparmor feature is disabled - profile is set to unconfined");
    }

    if rt.features.seccomp {
        configure_seccomp(c, spec, config)?;
    } else {
        tracing::warn!("seccomp feature is disabled - all system calls are allowed");
    }

    if rt.features.capabilities {
        config.set("lxc.cap.keep", capabilities_keep(spec)?);
    } else {
        tracing::warn!(
            "capabilities feature is disabled - container inherits privileges of the runtime"
        );
    }

    // devices are created by the runtime, not by the engine
    config.set("lxc.autodev", "0");

    specutil::allow_essential_devices(spec)?;
    bind_mount_devices(spec)?;

    configure_hooks(rt, spec, config)?;
    configure_cgroup(rt, c, spec, config)?;
    configure_sysctl(spec, config);
    configure_rlimits(spec, config)?;

    mount::configure_mounts(spec, config)?;
    mount::configure_readonly_paths(spec, config)?;
    Ok(())
}

fn configure_engine_log(rt: &Runtime, c: &Container, config: &mut EngineConfig) {
    let file = c
        .config
        .log_file
        .clone()
        .or_else(|| rt.log.container_log_file.clone());
    let level = c
        .config
        .log_level
        .clone()
        .or_else(|| rt.log.container_log_level.clone());

    if let Some(file) = file {
        config.set("lxc.log.file", file.display().to_string());
    }
    if let Some(level) = level {
        config.set("lxc.log.level", level);
    }
}

fn configure_hostname(spec: &Spec, config: &mut EngineConfig) -> Result<()> {
    let Some(hostname) = spec.hostname().clone() else {
        return Ok(());
    };
    if hostname.is_empty() {
        return Ok(());
    }
    config.set("lxc.uts.name", hostname.clone());

    // The engine only applies the hostname to a private UTS namespace.
    // For a UTS namespace shared with another container it must be set
    // here, unless it is the runtime's own namespace.
    let Some(uts) = specutil::get_namespace(spec, LinuxNamespaceType::Uts) else {
        return Ok(());
    };
    let Some(path) = uts.path().clone() else {
        return Ok(());
    };
    if specutil::namespaces_equal(&path, Path::new("/proc/self/ns/uts"))? {
        return Ok(());
    }
    set_hostname_in_ns(&path, &hostname)
}

/// Enters the UTS namespace at `ns_path`, sets the hostname and returns
/// to the runtime's own UTS namespace.
fn set_hostname_in_ns(ns_path: &Path, hostname: &str) -> Result<()> {
    let own = File::open("/proc/self/ns/uts")?;
    let target = File::open(ns_path)?;
    setns(target.as_fd(), CloneFlags::CLONE_NEWUTS)?;
    let res = sethostname(hostname);
    setns(own.as_fd(), CloneFlags::CLONE_NEWUTS)?;
    res?;
    Ok(())
}

fn configure_rootfs(
    rt: &Runtime,
    bundle_path: &Path,
    spec: &mut Spec,
    config: &mut EngineConfig,
) -> Result<()> {
    let mut root = spec.root().clone().unwrap_or_default();
    let rootfs = if root.path().is_absolute() {
        root.path().clone()
    } else {
        bundle_path.join(root.path())
    };

    // The mapped container uid must be able to traverse the rootfs.
    if !Uid::effective().is_root() {
        fchmodat(
            None,
            &rootfs,
            Mode::from_bits_truncate(0o777),
            FchmodatFlags::FollowSymlink,
        )?;
    }

    config.set("lxc.rootfs.path", rootfs.display().to_string());
    config.set("lxc.rootfs.mount", rootfs.display().to_string());
    config.set("lxc.rootfs.managed", "0");
    // resources not created by the runtime must not be deleted by it
    config.set("lxc.ephemeral", "0");

    let mut options = Vec::new();
    if let Some(propagation) = spec
        .linux()
        .as_ref()
        .and_then(|l| l.rootfs_propagation().clone())
    {
        if !propagation.is_empty() {
            options.push(propagation);
        }
    }
    if root.readonly().unwrap_or(false) {
        options.push("ro".to_string());
    }
    config.set("lxc.rootfs.options", options.join(","));

    // later stages resolve mount destinations against the absolute path
    root.set_path(rootfs);
    spec.set_root(Some(root));
    Ok(())
}

/// Strips or synthesizes the user namespace depending on the runtime
/// privileges.
fn configure_user_namespace(rt: &Runtime, spec: &mut Spec) -> Result<()> {
    let mut linux = spec.linux().clone().unwrap_or_default();
    let mut ns = linux.namespaces().clone().unwrap_or_default();

    if rt.userns_configured() {
        // the runtime already runs inside the configured user namespace
        if ns.iter().any(|n| n.typ() == LinuxNamespaceType::User) {
            tracing::warn!("preconfigured user namespace is removed from the namespace list");
            ns.retain(|n| n.typ() != LinuxNamespaceType::User);
            linux.set_namespaces(Some(ns));
            spec.set_linux(Some(linux));
        }
        return Ok(());
    }

    if ns.iter().any(|n| n.typ() == LinuxNamespaceType::User) {
        return Ok(());
    }

    let mut enable = false;
    if !Uid::effective().is_root() {
        tracing::warn!("unprivileged runtime - enabling user namespace");
        enable = true;
    }
    if spec
        .annotations()
        .as_ref()
        .and_then(|a| a.get(USERNS_ANNOTATION))
        .is_some_and(|v| !v.is_empty())
    {
        tracing::warn!("{USERNS_ANNOTATION} annotation - enabling user namespace");
        enable = true;
    }
    if !enable {
        return Ok(());
    }

    // Placeholder range, the subuid/subgid ranges of the invoking user
    // are not loaded.
    let mapping = oci_spec::runtime::LinuxIdMappingBuilder::default()
        .container_id(0u32)
        .host_id(100000u32)
        .size(65536u32)
        .build()?;
    linux.set_uid_mappings(Some(vec![mapping.clone()]));
    linux.set_gid_mappings(Some(vec![mapping]));

    ns.push(
        LinuxNamespaceBuilder::default()
            .typ(LinuxNamespaceType::User)
            .build()?,
    );
    linux.set_namespaces(Some(ns));
    spec.set_linux(Some(linux));
    Ok(())
}

fn lxc_namespace_name(typ: LinuxNamespaceType) -> &'static str {
    match typ {
        LinuxNamespaceType::Mount => "mnt",
        LinuxNamespaceType::Network => "net",
        LinuxNamespaceType::Pid => "pid",
        LinuxNamespaceType::Ipc => "ipc",
        LinuxNamespaceType::Uts => "uts",
        LinuxNamespaceType::User => "user",
        LinuxNamespaceType::Cgroup => "cgroup",
        _ => "time",
    }
}

/// Namespaces without a path are cloned, namespaces with a path are
/// shared. Namespace types missing from the spec are inherited from the
/// runtime.
fn configure_namespaces(spec: &Spec, config: &mut EngineConfig) -> Result<()> {
    let empty = Vec::new();
    let namespaces: &Vec<LinuxNamespace> = spec
        .linux()
        .as_ref()
        .and_then(|l| l.namespaces().as_ref())
        .unwrap_or(&empty);

    let mut cloned = Vec::with_capacity(namespaces.len());
    for ns in namespaces {
        let name = lxc_namespace_name(ns.typ());
        match ns.path() {
            None => cloned.push(name),
            Some(path) => {
                config.set(
                    &format!("lxc.namespace.share.{name}"),
                    path.display().to_string(),
                );
            }
        }
    }
    config.set("lxc.namespace.clone", cloned.join(" "));
    Ok(())
}

fn configure_apparmor(spec: &Spec, config: &mut EngineConfig) {
    // the profile from crio.conf is used if the container defines none
    let profile = spec
        .process()
        .as_ref()
        .and_then(|p| p.apparmor_profile().clone())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "unconfined".to_string());
    config.set("lxc.apparmor.profile", profile);
}

fn configure_seccomp(c: &Container, spec: &Spec, config: &mut EngineConfig) -> Result<()> {
    let Some(policy) = spec.linux().as_ref().and_then(|l| l.seccomp().as_ref()) else {
        return Ok(());
    };
    if policy.syscalls().as_deref().unwrap_or(&[]).is_empty() {
        return Ok(());
    }
    let profile_path = c.runtime_path("seccomp.conf");
    seccomp::write_profile(&profile_path, policy)?;
    config.set("lxc.seccomp.profile", profile_path.display().to_string());
    Ok(())
}

/// Renders the permitted capability set as space separated lower-case
/// names without the cap_ prefix, sorted for reproducible output.
fn capabilities_keep(spec: &Spec) -> Result<String> {
    let Some(capabilities) = spec.process().as_ref().and_then(|p| p.capabilities().as_ref())
    else {
        return Ok("none".to_string());
    };
    let Some(permitted) = capabilities.permitted() else {
        return Ok("none".to_string());
    };

    let mut names = Vec::with_capacity(permitted.len());
    for cap in permitted {
        let name = serde_json::to_value(cap)?
            .as_str()
            .unwrap_or_default()
            .to_lowercase();
        names.push(name.trim_start_matches("cap_").to_string());
    }
    if names.is_empty() {
        return Ok("none".to_string());
    }
    names.sort();
    Ok(names.join(" "))
}

/// Replaces the device list with bind mounts over the /dev tmpfs.
/// The engine would have to mknod otherwise, which requires CAP_MKNOD.
fn bind_mount_devices(spec: &mut Spec) -> Result<()> {
    let mounts = spec.mounts().clone().unwrap_or_default();
    if !mounts
        .iter()
        .any(|m| m.destination() == Path::new("/dev"))
    {
        return Ok(());
    }

    let rootfs = spec
        .root()
        .as_ref()
        .map(|r| r.path().clone())
        .unwrap_or_default();
    let devices = spec
        .linux()
        .as_ref()
        .and_then(|l| l.devices().clone())
        .unwrap_or_default();

    let mut new_mounts: Vec<Mount> = Vec::with_capacity(mounts.len() + devices.len());
    for m in mounts {
        if m.destination() != Path::new("/dev") {
            new_mounts.push(m);
            continue;
        }
        std::fs::create_dir_all(rootfs.join("dev"))?;
        let mut tmpfs = MountBuilder::default()
            .destination("/dev")
            .source("tmpfs")
            .typ("tmpfs")
            .build()?;
        if let Some(options) = m.options() {
            tmpfs.set_options(Some(options.clone()));
        }
        new_mounts.push(tmpfs);
        tracing::info!("device files are bind mounted");
        for device in &devices {
            new_mounts.push(specutil::bind_mount(device.path(), device.path()));
        }
    }
    spec.set_mounts(Some(new_mounts));

    // the engine must not also mknod the devices
    let mut linux = spec.linux().clone().unwrap_or_default();
    linux.set_devices(None);
    spec.set_linux(Some(linux));
    Ok(())
}

/// Prepends runtime hooks and wires the engine hook binary into the
/// phases that have hooks registered.
fn configure_hooks(rt: &Runtime, spec: &mut Spec, config: &mut EngineConfig) -> Result<()> {
    let merged = hooks::merge_hooks(&rt.hooks, spec.hooks().as_ref());

    // context information is passed to hook scripts via environment
    config.set("lxc.hook.version", "1");

    let hook_cmd = rt.libexec(EXEC_HOOK).display().to_string();
    if !hooks::hooks_for(&merged, HookPhase::Prestart).is_empty()
        || !hooks::hooks_for(&merged, HookPhase::CreateRuntime).is_empty()
    {
        config.set("lxc.hook.pre-mount", hook_cmd.clone());
    }
    if !hooks::hooks_for(&merged, HookPhase::CreateContainer).is_empty() {
        config.set("lxc.hook.mount", hook_cmd.clone());
    }
    if !hooks::hooks_for(&merged, HookPhase::StartContainer).is_empty() {
        config.set("lxc.hook.start", hook_cmd);
    }

    spec.set_hooks(Some(merged));
    Ok(())
}

fn device_cgroup_rule(rule: &LinuxDeviceCgroup) -> String {
    let typ = match rule.typ() {
        Some(oci_spec::runtime::LinuxDeviceType::B) => "b",
        Some(oci_spec::runtime::LinuxDeviceType::C) => "c",
        _ => "a",
    };
    let major = rule
        .major()
        .map(|m| m.to_string())
        .unwrap_or_else(|| "*".to_string());
    let minor = rule
        .minor()
        .map(|m| m.to_string())
        .unwrap_or_else(|| "*".to_string());
    let access = rule.access().clone().unwrap_or_else(|| "rwm".to_string());
    format!("{typ} {major}:{minor} {access}")
}

/// Computes and reserves the container cgroup, and emits the device
/// controller rules.
fn configure_cgroup(
    rt: &Runtime,
    c: &mut Container,
    spec: &Spec,
    config: &mut EngineConfig,
) -> Result<()> {
    let cgroups_path = spec
        .linux()
        .as_ref()
        .and_then(|l| l.cgroups_path().clone())
        .unwrap_or_default();

    c.cgroup_dir = if cgroups_path.as_os_str().is_empty() {
        rt.payload_cgroup.join(c.id())
    } else if c.config.systemd_cgroup {
        crate::cgroup::parse_systemd_cgroup_path(&cgroups_path.display().to_string())
    } else {
        cgroups_path
    };
    c.monitor_cgroup_dir = rt.monitor_cgroup.join(format!("{}.scope", c.id()));

    config.set("lxc.cgroup.relative", "0");
    config.set(
        "lxc.cgroup.dir.container",
        c.cgroup_dir.display().to_string(),
    );
    config.set(
        "lxc.cgroup.dir.monitor",
        c.monitor_cgroup_dir.display().to_string(),
    );

    // Reserving the directory makes a second create with the same cgroups
    // path fail.
    crate::cgroup::create_cgroup(rt.cgroup_root(), &c.cgroup_dir)?;

    if rt.features.cgroup_devices {
        config.set("lxc.cgroup2.devices.deny", "a");
        let rules = spec
            .linux()
            .as_ref()
            .and_then(|l| l.resources().as_ref())
            .and_then(|r| r.devices().clone())
            .unwrap_or_default();
        for rule in &rules {
            let key = if rule.allow() {
                "lxc.cgroup2.devices.allow"
            } else {
                "lxc.cgroup2.devices.deny"
            };
            config.set(key, device_cgroup_rule(rule));
        }
    } else {
        tracing::warn!("cgroup device controller feature is disabled - all devices are allowed");
    }
    Ok(())
}

fn configure_sysctl(spec: &Spec, config: &mut EngineConfig) {
    let Some(sysctl) = spec.linux().as_ref().and_then(|l| l.sysctl().as_ref()) else {
        return;
    };
    // map iteration order is not stable, sort for reproducible output
    let mut keys: Vec<&String> = sysctl.keys().collect();
    keys.sort();
    for key in keys {
        config.set(&format!("lxc.sysctl.{key}"), sysctl[key].clone());
    }
}

/// Emits one prlimit entry per rlimit. A resource with no configured
/// limit is inherited from the process starting the container.
fn configure_rlimits(spec: &Spec, config: &mut EngineConfig) -> Result<()> {
    let rlimits = spec
        .process()
        .as_ref()
        .and_then(|p| p.rlimits().clone())
        .unwrap_or_default();

    let mut seen: Vec<String> = Vec::with_capacity(rlimits.len());
    for limit in &rlimits {
        let name = serde_json::to_value(limit.typ())?
            .as_str()
            .unwrap_or_default()
            .to_lowercase()
            .trim_start_matches("rlimit_")
            .to_string();
        if seen.contains(&name) {
            return Err(LxcriError::InvalidSpec(format!(
                "duplicate resource limit {name:?}"
            )));
        }
        config.set(
            &format!("lxc.prlimit.{name}"),
            format!("{}:{}", limit.soft(), limit.hard()),
        );
        seen.push(name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use oci_spec::runtime::{
        Capability, HookBuilder, HooksBuilder, LinuxBuilder, LinuxCapabilitiesBuilder,
        LinuxDeviceBuilder, LinuxDeviceType, PosixRlimitBuilder, PosixRlimitType, ProcessBuilder,
    };
    use std::collections::HashMap;

    struct TestSetup {
        _tmp: tempfile::TempDir,
        rt: Runtime,
        rootfs: PathBuf,
    }

    fn setup() -> TestSetup {
        let tmp = tempfile::tempdir().unwrap();
        let rootfs = tmp.path().join("rootfs");
        std::fs::create_dir_all(&rootfs).unwrap();
        let mut rt = Runtime::default();
        rt.root = tmp.path().join("run");
        rt.libexec_dir = tmp.path().join("libexec");
        rt.cgroup_root_for_tests(tmp.path().join("cgroup"));
        std::fs::create_dir_all(&rt.root).unwrap();
        // the init binary is a bind mount source, it must exist. The stubs
        // are not executable so spawning the monitor still fails.
        std::fs::create_dir_all(&rt.libexec_dir).unwrap();
        for name in [crate::EXEC_START, crate::EXEC_HOOK, crate::EXEC_INIT] {
            std::fs::write(rt.libexec_dir.join(name), "").unwrap();
        }
        TestSetup {
            _tmp: tmp,
            rt,
            rootfs,
        }
    }

    fn container(setup: &TestSetup, id: &str, spec: Spec) -> Container {
        let config = ContainerConfig {
            container_id: id.to_string(),
            bundle_path: setup.rootfs.parent().unwrap().to_path_buf(),
            spec,
            console_socket: None,
            log_file: None,
            log_level: None,
            systemd_cgroup: false,
        };
        let dir = setup.rt.container_runtime_dir(id);
        store::create_dir(&dir).unwrap();
        Container::new(config, dir, setup.rt.cgroup_root().to_path_buf())
    }

    fn test_spec(setup: &TestSetup) -> Spec {
        specutil::default_spec(&setup.rootfs, "/bin/sh").unwrap()
    }

    #[test]
    fn test_translation_core_entries() -> Result<()> {
        let setup = setup();
        let mut c = container(&setup, "c1", test_spec(&setup));
        let config = configure_container(&setup.rt, &mut c)?;

        let rootfs = setup.rootfs.display().to_string();
        assert_eq!(config.get("lxc.rootfs.path"), Some(rootfs.as_str()));
        assert_eq!(config.get("lxc.rootfs.mount"), Some(rootfs.as_str()));
        assert_eq!(config.get("lxc.rootfs.managed"), Some("0"));
        assert_eq!(config.get("lxc.ephemeral"), Some("0"));
        assert_eq!(config.get("lxc.autodev"), Some("0"));
        assert_eq!(config.get("lxc.hook.version"), Some("1"));
        assert_eq!(config.get("lxc.init.cwd"), Some("/.lxcri"));
        assert_eq!(config.get("lxc.init.cmd"), Some("/.lxcri/lxcri-init"));
        assert_eq!(config.get("lxc.cgroup.relative"), Some("0"));
        assert_eq!(config.get("lxc.mount.auto"), Some(""));

        // namespaces of the default spec are cloned
        let cloned = config.get("lxc.namespace.clone").unwrap();
        for name in ["mnt", "pid", "ipc", "uts", "net"] {
            assert!(cloned.contains(name), "{cloned}");
        }

        // sync fifo exists with the runtime-user mode
        let fifo = c.sync_fifo_path();
        use std::os::unix::fs::FileTypeExt;
        assert!(std::fs::metadata(fifo)?.file_type().is_fifo());

        // the essential devices were amended and bind mounted over /dev
        let spec = c.spec();
        assert!(spec.linux().as_ref().unwrap().devices().is_none());
        let entries: Vec<&str> = config.get_all("lxc.mount.entry").collect();
        assert!(entries.iter().any(|e| e.contains("/dev/null")), "{entries:?}");
        Ok(())
    }

    #[test]
    fn test_translation_is_reproducible() -> Result<()> {
        let setup1 = setup();
        let setup2 = setup();

        let mut spec1 = test_spec(&setup1);
        let mut sysctl = HashMap::new();
        sysctl.insert("net.ipv4.ip_forward".to_string(), "1".to_string());
        sysctl.insert("kernel.msgmax".to_string(), "8192".to_string());
        let linux1 = LinuxBuilder::default()
            .namespaces(
                spec1
                    .linux()
                    .as_ref()
                    .unwrap()
                    .namespaces()
                    .clone()
                    .unwrap(),
            )
            .sysctl(sysctl.clone())
            .build()?;
        spec1.set_linux(Some(linux1.clone()));

        let mut spec2 = test_spec(&setup2);
        spec2.set_root(spec1.root().clone());
        spec2.set_linux(Some(linux1));

        let mut c1 = container(&setup1, "same-id", spec1);
        let mut c2 = container(&setup2, "same-id", spec2);

        let r1 = configure_container(&setup1.rt, &mut c1)?.render();
        let r2 = configure_container(&setup2.rt, &mut c2)?.render();

        // identical modulo the runtime directories
        let normalize = |s: String, setup: &TestSetup| {
            s.replace(setup.rt.root.to_str().unwrap(), "RUNTIME_ROOT")
                .replace(setup.rt.cgroup_root().to_str().unwrap(), "CGROUP_ROOT")
                .replace(setup.rt.libexec_dir.to_str().unwrap(), "LIBEXEC")
        };
        assert_eq!(normalize(r1, &setup1), normalize(r2, &setup2));
        Ok(())
    }

    #[test]
    fn test_duplicate_rlimits_rejected() -> Result<()> {
        let rlimit = |soft: u64, hard: u64| {
            PosixRlimitBuilder::default()
                .typ(PosixRlimitType::RlimitNofile)
                .soft(soft)
                .hard(hard)
                .build()
                .unwrap()
        };

        let mut spec = Spec::default();
        spec.set_process(Some(
            ProcessBuilder::default()
                .args(vec!["/bin/sh".to_string()])
                .cwd("/")
                .rlimits(vec![rlimit(1024, 4096), rlimit(512, 1024)])
                .build()?,
        ));

        let mut config = EngineConfig::new();
        let err = configure_rlimits(&spec, &mut config).unwrap_err();
        assert!(matches!(err, LxcriError::InvalidSpec(msg) if msg.contains("nofile")));
        Ok(())
    }

    #[test]
    fn test_rlimit_entry_format() -> Result<()> {
        let mut spec = Spec::default();
        spec.set_process(Some(
            ProcessBuilder::default()
                .args(vec!["/bin/sh".to_string()])
                .cwd("/")
                .rlimits(vec![PosixRlimitBuilder::default()
                    .typ(PosixRlimitType::RlimitNproc)
                    .soft(100u64)
                    .hard(200u64)
                    .build()?])
                .build()?,
        ));
        let mut config = EngineConfig::new();
        configure_rlimits(&spec, &mut config)?;
        assert_eq!(config.get("lxc.prlimit.nproc"), Some("100:200"));
        Ok(())
    }

    #[test]
    fn test_capabilities_keep() -> Result<()> {
        let mut spec = Spec::default();
        assert_eq!(capabilities_keep(&spec)?, "none");

        let caps = LinuxCapabilitiesBuilder::default()
            .permitted(
                [Capability::NetAdmin, Capability::Chown, Capability::Kill]
                    .into_iter()
                    .collect::<std::collections::HashSet<_>>(),
            )
            .build()?;
        spec.set_process(Some(
            ProcessBuilder::default()
                .args(vec!["/bin/sh".to_string()])
                .cwd("/")
                .capabilities(caps)
                .build()?,
        ));
        // sorted, lower case, cap_ prefix stripped
        assert_eq!(capabilities_keep(&spec)?, "chown kill net_admin");
        Ok(())
    }

    #[test]
    fn test_apparmor_profile_defaults_to_unconfined() {
        let spec = Spec::default();
        let mut config = EngineConfig::new();
        configure_apparmor(&spec, &mut config);
        assert_eq!(config.get("lxc.apparmor.profile"), Some("unconfined"));

        let mut spec = Spec::default();
        spec.set_process(Some(
            ProcessBuilder::default()
                .args(vec!["/bin/sh".to_string()])
                .cwd("/")
                .apparmor_profile("my-profile")
                .build()
                .unwrap(),
        ));
        let mut config = EngineConfig::new();
        configure_apparmor(&spec, &mut config);
        assert_eq!(config.get("lxc.apparmor.profile"), Some("my-profile"));
    }

    #[test]
    fn test_namespace_share_entries() -> Result<()> {
        let mut spec = Spec::default();
        let ns = vec![
            LinuxNamespaceBuilder::default()
                .typ(LinuxNamespaceType::Mount)
                .build()?,
            LinuxNamespaceBuilder::default()
                .typ(LinuxNamespaceType::Network)
                .path("/var/run/netns/cni-1234")
                .build()?,
        ];
        spec.set_linux(Some(LinuxBuilder::default().namespaces(ns).build()?));

        let mut config = EngineConfig::new();
        configure_namespaces(&spec, &mut config)?;
        assert_eq!(config.get("lxc.namespace.clone"), Some("mnt"));
        assert_eq!(
            config.get("lxc.namespace.share.net"),
            Some("/var/run/netns/cni-1234")
        );
        Ok(())
    }

    #[test]
    fn test_cgroup_collision_fails_second_create() -> Result<()> {
        let setup = setup();

        let mut spec1 = test_spec(&setup);
        let linux = LinuxBuilder::default()
            .cgroups_path("shared.slice")
            .namespaces(
                spec1
                    .linux()
                    .as_ref()
                    .unwrap()
                    .namespaces()
                    .clone()
                    .unwrap(),
            )
            .build()?;
        spec1.set_linux(Some(linux.clone()));
        let mut spec2 = test_spec(&setup);
        spec2.set_linux(Some(linux));

        let mut c1 = container(&setup, "c1", spec1);
        configure_container(&setup.rt, &mut c1)?;

        let mut c2 = container(&setup, "c2", spec2);
        let err = configure_container(&setup.rt, &mut c2).unwrap_err();
        assert!(matches!(
            err,
            LxcriError::Cgroup(crate::cgroup::CgroupError::Exists(_))
        ));
        Ok(())
    }

    #[test]
    fn test_systemd_cgroup_path_expansion() -> Result<()> {
        let setup = setup();
        let mut spec = test_spec(&setup);
        let linux = LinuxBuilder::default()
            .cgroups_path("machine.slice:lxcri:c3")
            .namespaces(
                spec.linux().as_ref().unwrap().namespaces().clone().unwrap(),
            )
            .build()?;
        spec.set_linux(Some(linux));

        let mut c = container(&setup, "c3", spec);
        c.config.systemd_cgroup = true;
        let config = configure_container(&setup.rt, &mut c)?;
        assert_eq!(
            config.get("lxc.cgroup.dir.container"),
            Some("machine.slice/lxcri-c3.scope")
        );
        assert!(setup
            .rt
            .cgroup_root()
            .join("machine.slice/lxcri-c3.scope")
            .is_dir());
        Ok(())
    }

    #[test]
    fn test_device_cgroup_rules() -> Result<()> {
        let setup = setup();
        let mut c = container(&setup, "c1", test_spec(&setup));
        let mut spec = c.config.spec.clone();
        specutil::allow_essential_devices(&mut spec)?;

        let mut config = EngineConfig::new();
        configure_cgroup(&setup.rt, &mut c, &spec, &mut config)?;

        assert_eq!(config.get_all("lxc.cgroup2.devices.deny").next(), Some("a"));
        let allowed: Vec<&str> = config.get_all("lxc.cgroup2.devices.allow").collect();
        assert!(allowed.contains(&"c 1:3 rwm"), "{allowed:?}");
        assert!(allowed.contains(&"c 5:0 rwm"), "{allowed:?}");
        Ok(())
    }

    #[test]
    fn test_hooks_wired_to_engine() -> Result<()> {
        let setup = setup();
        let mut spec = test_spec(&setup);
        let spec_hooks = HooksBuilder::default()
            .prestart(vec![HookBuilder::default().path("/opt/netns").build()?])
            .build()?;
        spec.set_hooks(Some(spec_hooks));

        let mut config = EngineConfig::new();
        configure_hooks(&setup.rt, &mut spec, &mut config)?;
        assert_eq!(
            config.get("lxc.hook.pre-mount"),
            Some(setup.rt.libexec(EXEC_HOOK).to_str().unwrap())
        );
        assert_eq!(config.get("lxc.hook.mount"), None);
        assert_eq!(config.get("lxc.hook.version"), Some("1"));
        Ok(())
    }

    #[test]
    fn test_oom_and_no_new_privs() -> Result<()> {
        let setup = setup();
        let mut spec = test_spec(&setup);
        spec.set_process(Some(
            ProcessBuilder::default()
                .args(vec!["/bin/sh".to_string()])
                .cwd("/")
                .oom_score_adj(-1000)
                .no_new_privileges(true)
                .build()?,
        ));
        let mut c = container(&setup, "c1", spec);
        let config = configure_container(&setup.rt, &mut c)?;
        assert_eq!(config.get("lxc.proc.oom_score_adj"), Some("-1000"));
        assert_eq!(config.get("lxc.no_new_privs"), Some("1"));
        Ok(())
    }

    #[test]
    fn test_seccomp_profile_written() -> Result<()> {
        use oci_spec::runtime::{
            LinuxSeccompAction, LinuxSeccompBuilder, LinuxSyscallBuilder,
        };

        let setup = setup();
        let mut spec = test_spec(&setup);
        let seccomp_policy = LinuxSeccompBuilder::default()
            .default_action(LinuxSeccompAction::ScmpActAllow)
            .syscalls(vec![LinuxSyscallBuilder::default()
                .names(vec!["kexec_load".to_string()])
                .action(LinuxSeccompAction::ScmpActErrno)
                .build()?])
            .build()?;
        let linux = LinuxBuilder::default()
            .namespaces(
                spec.linux().as_ref().unwrap().namespaces().clone().unwrap(),
            )
            .seccomp(seccomp_policy)
            .build()?;
        spec.set_linux(Some(linux));

        let mut c = container(&setup, "c1", spec);
        let config = configure_container(&setup.rt, &mut c)?;

        let profile = c.runtime_path("seccomp.conf");
        assert_eq!(
            config.get("lxc.seccomp.profile"),
            Some(profile.to_str().unwrap())
        );
        let text = std::fs::read_to_string(profile)?;
        assert!(text.contains("kexec_load errno 1"), "{text}");
        Ok(())
    }

    #[test]
    fn test_device_bind_mounts_replace_mknod() -> Result<()> {
        let setup = setup();
        let mut spec = test_spec(&setup);

        let mounts = vec![MountBuilder::default()
            .destination("/dev")
            .typ("tmpfs")
            .source("tmpfs")
            .options(vec!["nosuid".to_string()])
            .build()?];
        spec.set_mounts(Some(mounts));
        let linux = LinuxBuilder::default()
            .namespaces(
                spec.linux().as_ref().unwrap().namespaces().clone().unwrap(),
            )
            .devices(vec![LinuxDeviceBuilder::default()
                .path("/dev/fuse")
                .typ(LinuxDeviceType::C)
                .major(10i64)
                .minor(229i64)
                .build()?])
            .build()?;
        spec.set_linux(Some(linux));

        specutil::allow_essential_devices(&mut spec)?;
        bind_mount_devices(&mut spec)?;

        assert!(spec.linux().as_ref().unwrap().devices().is_none());
        let mounts = spec.mounts().clone().unwrap();
        assert!(mounts
            .iter()
            .any(|m| m.destination() == Path::new("/dev/fuse")));
        assert!(mounts
            .iter()
            .any(|m| m.destination() == Path::new("/dev/urandom")));
        assert!(setup.rootfs.join("dev").is_dir());
        Ok(())
    }

    #[test]
    fn test_create_rejects_empty_id() {
        let setup = setup();
        let config = ContainerConfig {
            container_id: String::new(),
            bundle_path: PathBuf::from("."),
            spec: Spec::default(),
            ..Default::default()
        };
        let deadline = Deadline::seconds(1, "create");
        let err = setup.rt.create(config, &deadline).unwrap_err();
        assert!(matches!(err, LxcriError::InvalidSpec(_)));
    }

    #[test]
    fn test_create_id_collision() -> Result<()> {
        let setup = setup();
        store::create_dir(&setup.rt.container_runtime_dir("taken"))?;

        let config = ContainerConfig {
            container_id: "taken".to_string(),
            bundle_path: setup.rootfs.parent().unwrap().to_path_buf(),
            spec: test_spec(&setup),
            ..Default::default()
        };
        let deadline = Deadline::seconds(1, "create");
        let err = setup.rt.create(config, &deadline).unwrap_err();
        assert!(matches!(err, LxcriError::AlreadyExists));
        Ok(())
    }

    #[test]
    fn test_failed_create_removes_runtime_dir() {
        let setup = setup();
        // spawning the monitor fails because the stub binary is not
        // executable
        let config = ContainerConfig {
            container_id: "c9".to_string(),
            bundle_path: setup.rootfs.parent().unwrap().to_path_buf(),
            spec: test_spec(&setup),
            ..Default::default()
        };
        let deadline = Deadline::seconds(2, "create");
        let err = setup.rt.create(config, &deadline).unwrap_err();
        assert!(!matches!(err, LxcriError::AlreadyExists));
        assert!(!setup.rt.container_runtime_dir("c9").exists());
        // the reserved cgroup is released as well
        assert!(!setup.rt.cgroup_root().join("lxcri.slice/c9").exists());
    }
}
