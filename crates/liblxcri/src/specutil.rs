//! OCI spec helpers: id mapping, essential devices, default spec.

use std::path::Path;

use oci_spec::runtime::{
    Linux, LinuxDevice, LinuxDeviceBuilder, LinuxDeviceCgroup, LinuxDeviceCgroupBuilder,
    LinuxDeviceType, Mount, MountBuilder, ProcessBuilder, RootBuilder, Spec,
};

use crate::{LxcriError, Result};

/// Maps a container id to the host id using the given id mappings.
/// Returns the unchanged id if it is not covered by any mapping.
pub fn unmap_container_id(id: u32, mappings: &[oci_spec::runtime::LinuxIdMapping]) -> u32 {
    for m in mappings {
        if id >= m.container_id() && id < m.container_id() + m.size() {
            return m.host_id() + (id - m.container_id());
        }
    }
    id
}

/// The devices every container requires, independent of the spec.
/// See runc `DefaultSimpleDevices`.
pub fn essential_devices() -> Vec<LinuxDevice> {
    let dev = |path: &str, major: i64, minor: i64| -> LinuxDevice {
        LinuxDeviceBuilder::default()
            .path(path)
            .typ(LinuxDeviceType::C)
            .major(major)
            .minor(minor)
            .file_mode(0o666u32)
            .uid(0u32)
            .gid(0u32)
            .build()
            .expect("static device definition")
    };

    vec![
        dev("/dev/null", 1, 3),
        dev("/dev/zero", 1, 5),
        dev("/dev/full", 1, 7),
        dev("/dev/random", 1, 8),
        dev("/dev/urandom", 1, 9),
        dev("/dev/tty", 5, 0),
    ]
}

fn essential_device_rule(device: &LinuxDevice) -> LinuxDeviceCgroup {
    LinuxDeviceCgroupBuilder::default()
        .allow(true)
        .typ(device.typ())
        .major(device.major())
        .minor(device.minor())
        .access("rwm")
        .build()
        .expect("static device rule")
}

/// Amends the spec so the essential device set is always present, both in
/// `linux.devices` and as device cgroup allow rules.
pub fn allow_essential_devices(spec: &mut Spec) -> Result<()> {
    let mut linux = spec.linux().clone().unwrap_or_default();
    let mut devices = linux.devices().clone().unwrap_or_default();
    let mut resources = linux.resources().clone().unwrap_or_default();
    let mut rules = resources.devices().clone().unwrap_or_default();

    for device in essential_devices() {
        if !devices.iter().any(|d| d.path() == device.path()) {
            rules.push(essential_device_rule(&device));
            devices.push(device);
        }
    }

    resources.set_devices(Some(rules));
    linux.set_devices(Some(devices));
    linux.set_resources(Some(resources));
    spec.set_linux(Some(linux));
    Ok(())
}

/// Returns a bind mount entry for the given source and destination.
pub fn bind_mount(source: impl AsRef<Path>, destination: impl AsRef<Path>) -> Mount {
    MountBuilder::default()
        .source(source.as_ref())
        .destination(destination.as_ref())
        .typ("bind")
        .options(vec!["bind".to_string()])
        .build()
        .expect("static bind mount")
}

/// Creates a minimal spec for the given rootfs that runs `cmd` as container
/// process. The spec starts from the crate default (runc default config)
/// and is primarily used by tests and `lxcri config`.
pub fn default_spec(rootfs: &Path, cmd: &str) -> Result<Spec> {
    let mut spec = Spec::default();
    spec.set_root(Some(
        RootBuilder::default().path(rootfs).readonly(false).build()?,
    ));
    spec.set_process(Some(
        ProcessBuilder::default()
            .args(vec![cmd.to_string()])
            .cwd("/")
            .env(vec![
                "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            ])
            .build()?,
    ));
    Ok(spec)
}

/// Sets `kv` in env unless the key is already defined. With overwrite the
/// last definition wins instead. Returns true if the key already existed.
pub fn setenv(env: &mut Vec<String>, kv: &str, overwrite: bool) -> bool {
    let key = kv.split('=').next().unwrap_or(kv);
    for entry in env.iter_mut() {
        if entry.split('=').next() == Some(key) {
            if overwrite {
                *entry = kv.to_string();
            }
            return true;
        }
    }
    env.push(kv.to_string());
    false
}

/// Removes duplicate environment variables from `spec.process.env`.
/// The first definition wins unless overwrite is set.
pub fn clean_env(spec: &mut Spec, overwrite: bool) {
    let Some(process) = spec.process().clone() else {
        return;
    };
    let Some(env) = process.env().clone() else {
        return;
    };
    if env.len() < 2 {
        return;
    }

    let mut clean: Vec<String> = Vec::with_capacity(env.len());
    for kv in &env {
        if setenv(&mut clean, kv, overwrite) {
            tracing::warn!(
                var = kv.split('=').next().unwrap_or(kv),
                overwrite,
                "duplicate environment variable"
            );
        }
    }

    let mut process = process;
    process.set_env(Some(clean));
    spec.set_process(Some(process));
}

/// Returns the namespaces of the spec, or an empty slice.
pub fn namespaces(linux: &Linux) -> &[oci_spec::runtime::LinuxNamespace] {
    linux.namespaces().as_deref().unwrap_or(&[])
}

/// Looks up the spec namespace entry of the given type.
pub fn get_namespace(
    spec: &Spec,
    typ: oci_spec::runtime::LinuxNamespaceType,
) -> Option<&oci_spec::runtime::LinuxNamespace> {
    spec.linux()
        .as_ref()
        .and_then(|linux| linux.namespaces().as_ref())
        .and_then(|ns| ns.iter().find(|n| n.typ() == typ))
}

/// Compares two namespace files by device and inode.
pub fn namespaces_equal(a: &Path, b: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::MetadataExt;
    let a = std::fs::metadata(a)?;
    let b = std::fs::metadata(b)?;
    Ok(a.dev() == b.dev() && a.ino() == b.ino())
}

/// Returns true if the given namespace entry refers to a namespace the
/// runtime process itself is a member of.
pub fn is_namespace_shared_with_runtime(
    ns: Option<&oci_spec::runtime::LinuxNamespace>,
    proc_name: &str,
) -> Result<bool> {
    match ns {
        // no entry for the namespace type: inherited from the runtime
        None => Ok(true),
        Some(ns) => match ns.path() {
            None => Ok(false),
            Some(path) => {
                let own = format!("/proc/self/ns/{proc_name}");
                namespaces_equal(path, Path::new(&own)).map_err(LxcriError::Io)
            }
        },
    }
}
