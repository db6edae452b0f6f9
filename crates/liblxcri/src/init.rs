//! Wiring for the in-container init process (lxcri-init).
//!
//! The runtime directory is bind-mounted read-only at `/.lxcri` and the
//! init helper at `/.lxcri/lxcri-init`. Init blocks on the sync fifo until
//! start writes to it, then execs the container process as PID 1.

use std::path::Path;

use nix::sys::stat::{self, Mode};
use nix::unistd::{mkfifo, Uid};
use oci_spec::runtime::{Mount, MountBuilder, Spec};

use crate::container::Container;
use crate::engine::EngineConfig;
use crate::runtime::Runtime;
use crate::specutil;
use crate::{LxcriError, Result, EXEC_INIT};

const INIT_DIR: &str = "/.lxcri";

fn create_fifo(path: &Path, mode: u32) -> Result<()> {
    let mode = Mode::from_bits_truncate(mode);
    mkfifo(path, mode)?;
    // umask affects mkfifo, so a separate chmod is required
    stat::fchmodat(None, path, mode, stat::FchmodatFlags::FollowSymlink)?;
    Ok(())
}

/// Returns true if the container process runs as the runtime user, after
/// reversing the uid mappings.
fn run_as_runtime_user(spec: &Spec) -> bool {
    let uid = spec.process().as_ref().map(|p| p.user().uid()).unwrap_or(0);
    let mappings = spec
        .linux()
        .as_ref()
        .and_then(|l| l.uid_mappings().clone())
        .unwrap_or_default();
    specutil::unmap_container_id(uid, &mappings) == Uid::current().as_raw()
}

fn ro_bind_mount(source: &Path, destination: &str, extra: &[&str]) -> Result<Mount> {
    let mut options = vec!["bind".to_string(), "ro".to_string(), "nosuid".to_string()];
    options.extend(extra.iter().map(|o| o.to_string()));
    Ok(MountBuilder::default()
        .source(source)
        // the mount destination is relative to the rootfs
        .destination(destination.trim_start_matches('/'))
        .typ("bind")
        .options(options)
        .build()?)
}

/// Emits idmap entries and the init uid/gid configuration.
fn configure_init_user(rt: &Runtime, c: &Container, config: &mut EngineConfig) -> Result<()> {
    let spec = c.spec();
    // the runtime already runs inside the configured user namespace, the
    // engine must not map ids again
    if !rt.userns_configured() {
        if let Some(linux) = spec.linux() {
            for m in linux.uid_mappings().as_deref().unwrap_or(&[]) {
                config.set(
                    "lxc.idmap",
                    format!("u {} {} {}", m.container_id(), m.host_id(), m.size()),
                );
            }
            for m in linux.gid_mappings().as_deref().unwrap_or(&[]) {
                config.set(
                    "lxc.idmap",
                    format!("g {} {} {}", m.container_id(), m.host_id(), m.size()),
                );
            }
        }
    }

    let user = spec
        .process()
        .as_ref()
        .map(|p| p.user().clone())
        .unwrap_or_default();
    config.set("lxc.init.uid", format!("{}", user.uid()));
    config.set("lxc.init.gid", format!("{}", user.gid()));

    let gids = user.additional_gids().clone().unwrap_or_default();
    if !gids.is_empty() {
        if rt.supports_init_groups() {
            let groups = gids
                .iter()
                .map(|gid| gid.to_string())
                .collect::<Vec<_>>()
                .join(",");
            config.set("lxc.init.groups", groups);
        } else {
            tracing::warn!("additional gids ignored, engine does not support lxc.init.groups");
        }
    }
    Ok(())
}

/// Configures the init process: bind mounts for the runtime directory and
/// the init binary, the sync fifo, and the engine init keys.
pub(crate) fn configure_init(
    rt: &Runtime,
    c: &Container,
    spec: &mut Spec,
    config: &mut EngineConfig,
) -> Result<()> {
    let mut mounts = spec.mounts().clone().unwrap_or_default();
    mounts.push(ro_bind_mount(
        c.runtime_dir(),
        INIT_DIR,
        &["nodev", "create=dir"],
    )?);

    config.set("lxc.init.cwd", INIT_DIR);

    // Init may run with a different uid than the runtime due to id
    // mappings, then the fifo must be writable for everyone. Access is
    // protected by the runtime directory (mode 0700).
    let fifo_mode = if run_as_runtime_user(spec) { 0o600 } else { 0o666 };
    create_fifo(&c.sync_fifo_path(), fifo_mode)
        .map_err(|err| LxcriError::Engine(format!("failed to create sync fifo: {err}")))?;

    configure_init_user(rt, c, config)?;

    // zero-byte anchor for the init binary bind mount
    let init_anchor = c.runtime_path(EXEC_INIT);
    crate::utils::touch(&init_anchor, 0o0)?;
    let init_cmd = format!("{INIT_DIR}/{EXEC_INIT}");
    mounts.push(ro_bind_mount(&rt.libexec(EXEC_INIT), &init_cmd, &[])?);
    spec.set_mounts(Some(mounts));

    config.set("lxc.init.cmd", init_cmd);
    Ok(())
}
