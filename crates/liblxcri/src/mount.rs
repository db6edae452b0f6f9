//! Mount translation and symlink-safe destination resolution.
//!
//! Symlinks in mount destination paths are not allowed by the engine,
//! see CVE-2015-1335 (protect container mounts against symlinks).
//! Mount destinations that contain symlinks are resolved relative to the
//! container rootfs before they are handed to the engine. E.g k8s service
//! account tokens are mounted to /var/run/secrets/kubernetes.io, but
//! /var/run is usually a symlink to /run.

use std::fs;
use std::path::{Component, Path, PathBuf};

use oci_spec::runtime::{Mount, Spec};

use crate::engine::EngineConfig;
use crate::{LxcriError, Result};

/// Outcome of resolving a single mount destination.
#[derive(Debug, PartialEq, Eq)]
pub struct ResolvedDestination {
    /// Absolute host-side path, beginning with the rootfs.
    pub path: PathBuf,
    /// The path (or an intermediate component) does not exist. The engine
    /// is instructed to create it with a `create=dir|file` mount option.
    pub not_found: bool,
}

fn clean_join(base: &Path, rel: &Path) -> PathBuf {
    let mut out = base.to_path_buf();
    for component in rel.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::RootDir | Component::Prefix(_) => {}
            Component::Normal(c) => out.push(c),
        }
    }
    out
}

/// Resolves a single path segment below `current`, dereferencing at most
/// one level of symlink. Absolute link targets are re-anchored below the
/// rootfs unless they already carry the rootfs prefix.
fn resolve_segment(
    rootfs: &Path,
    current: &Path,
    segment: &str,
) -> std::result::Result<PathBuf, PathBuf> {
    let candidate = current.join(segment);

    let metadata = match candidate.symlink_metadata() {
        Ok(metadata) => metadata,
        // resolution ends here, the remaining path does not exist
        Err(_) => return Err(candidate),
    };

    if !metadata.file_type().is_symlink() {
        return Ok(candidate);
    }

    let target = match fs::read_link(&candidate) {
        Ok(target) => target,
        Err(_) => return Err(candidate),
    };

    if target.is_absolute() {
        if target.starts_with(rootfs) {
            return Ok(candidate);
        }
        return Ok(clean_join(rootfs, &target));
    }

    // relative link targets resolve against the current directory
    Ok(clean_join(current, &target))
}

/// Resolves a mount destination inside the rootfs to an absolute host path.
///
/// Non-existent paths are not an error: the already resolved prefix is
/// concatenated with the remaining segments and `not_found` is set, the
/// engine creates the missing part. The caller must verify that the result
/// still begins with the rootfs.
pub fn resolve_mount_destination(rootfs: &Path, destination: &Path) -> ResolvedDestination {
    let mut current = rootfs.to_path_buf();

    let segments: Vec<&str> = destination
        .iter()
        .filter_map(|s| s.to_str())
        .filter(|s| *s != "/")
        .collect();

    for (i, segment) in segments.iter().enumerate() {
        match resolve_segment(rootfs, &current, segment) {
            Ok(resolved) => current = resolved,
            Err(partial) => {
                let mut path = partial;
                for rest in &segments[i + 1..] {
                    path.push(rest);
                }
                return ResolvedDestination {
                    path,
                    not_found: true,
                };
            }
        }
    }

    ResolvedDestination {
        path: current,
        not_found: false,
    }
}

/// Mount options the engine does not support for the given filesystem.
fn filter_mount_options(fs_type: &str, options: Vec<String>) -> Vec<String> {
    match fs_type {
        // see doTmpfsCopyUp in runc, not supported here
        "tmpfs" => options
            .into_iter()
            .filter(|opt| {
                if opt == "tmpcopyup" {
                    tracing::info!(fs = fs_type, option = %opt, "removed mount option");
                    return false;
                }
                true
            })
            .collect(),
        _ => options,
    }
}

/// Creates non-existent mount destination paths.
///
/// This is required if rootfs is mounted readonly, otherwise the engine
/// creates them through the `create=dir|file` option. The option is always
/// added because the destination may be shadowed by a previous mount.
fn create_mount_destination(spec: &Spec, source: Option<&Path>, typ: &str, destination: &Path, options: &mut Vec<String>) -> Result<()> {
    let readonly_rootfs = spec
        .root()
        .as_ref()
        .and_then(|r| r.readonly())
        .unwrap_or(false);

    let source_info = source.map(fs::metadata);

    let source_is_file = match &source_info {
        Some(Ok(info)) => !info.is_dir(),
        // source for a bind mount must exist
        Some(Err(err)) if typ == "bind" => {
            if options.iter().any(|o| o == "optional") {
                return Ok(());
            }
            return Err(LxcriError::InvalidSpec(format!(
                "failed to access bind mount source {:?}: {err}",
                source
            )));
        }
        _ => false,
    };

    if source_is_file {
        options.push("create=file".to_string());
        if readonly_rootfs {
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)?;
            }
            crate::utils::touch(destination, 0o755)?;
        }
    } else {
        options.push("create=dir".to_string());
        if readonly_rootfs {
            fs::create_dir_all(destination)?;
        }
    }
    Ok(())
}

/// Emits one `lxc.mount.entry` per spec mount, sorted by destination so
/// nested mounts are created outer-first.
pub(crate) fn configure_mounts(spec: &mut Spec, config: &mut EngineConfig) -> Result<()> {
    // the runtime manages mounts explicitly
    config.set("lxc.mount.auto", "");

    let rootfs = spec
        .root()
        .as_ref()
        .map(|r| r.path().clone())
        .unwrap_or_default();

    let mut mounts: Vec<Mount> = spec.mounts().clone().unwrap_or_default();
    mounts.sort_by(|a, b| a.destination().cmp(b.destination()));
    spec.set_mounts(Some(mounts.clone()));

    for mount in &mounts {
        let mut typ = mount.typ().clone().unwrap_or_default();
        let mut source = mount.source().clone();
        let mut options = mount.options().clone().unwrap_or_default();

        if typ == "cgroup" || typ == "cgroup2" {
            // unified hierarchy only; the mount must be optional since the
            // container may not be permitted to mount it
            typ = "cgroup2".to_string();
            source = Some(PathBuf::from("cgroup2"));
            options.push("optional".to_string());
        }

        let resolved = resolve_mount_destination(&rootfs, mount.destination());
        tracing::trace!(
            file = ?mount.destination(),
            target = ?resolved.path,
            not_found = resolved.not_found,
            "resolved mount destination"
        );

        if !resolved.path.starts_with(&rootfs) {
            return Err(LxcriError::EscapesRoot {
                destination: mount.destination().clone(),
                resolved: resolved.path,
            });
        }

        create_mount_destination(spec, source.as_deref(), &typ, &resolved.path, &mut options)?;

        let options = filter_mount_options(&typ, options);

        let entry = format!(
            "{} {} {} {}",
            source.as_deref().unwrap_or(Path::new("none")).display(),
            resolved.path.display(),
            typ,
            options.join(",")
        );
        config.set("lxc.mount.entry", entry);
    }
    Ok(())
}

/// Readonly paths are emitted as optional read-only bind mounts.
pub(crate) fn configure_readonly_paths(spec: &Spec, config: &mut EngineConfig) -> Result<()> {
    let rootmnt = config
        .get("lxc.rootfs.mount")
        .ok_or_else(|| LxcriError::Engine("lxc.rootfs.mount unavailable".to_string()))?
        .to_string();

    let paths = spec
        .linux()
        .as_ref()
        .and_then(|l| l.readonly_paths().clone())
        .unwrap_or_default();

    for p in paths {
        let rel = p.trim_start_matches('/');
        let entry = format!("{rootmnt}/{rel} {rel} bind bind,ro,optional");
        config.set("lxc.mount.entry", entry);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn test_resolve_plain_path() {
        let tmp = tempfile::tempdir().unwrap();
        let rootfs = tmp.path();
        fs::create_dir_all(rootfs.join("etc")).unwrap();
        fs::write(rootfs.join("etc/hosts"), "").unwrap();

        let r = resolve_mount_destination(rootfs, Path::new("/etc/hosts"));
        assert_eq!(r.path, rootfs.join("etc/hosts"));
        assert!(!r.not_found);
    }

    #[test]
    fn test_resolve_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let rootfs = tmp.path();

        let r = resolve_mount_destination(rootfs, Path::new("/var/lib/secret/token"));
        assert_eq!(r.path, rootfs.join("var/lib/secret/token"));
        assert!(r.not_found);
    }

    #[test]
    fn test_resolve_relative_symlink() {
        // /etc/resolv.conf -> ../run/resolv.conf resolves below the rootfs
        let tmp = tempfile::tempdir().unwrap();
        let rootfs = tmp.path();
        fs::create_dir_all(rootfs.join("etc")).unwrap();
        fs::create_dir_all(rootfs.join("run")).unwrap();
        symlink("../run/resolv.conf", rootfs.join("etc/resolv.conf")).unwrap();

        let r = resolve_mount_destination(rootfs, Path::new("/etc/resolv.conf"));
        assert_eq!(r.path, rootfs.join("run/resolv.conf"));
        assert!(r.not_found);
    }

    #[test]
    fn test_resolve_absolute_symlink_reanchored() {
        // an absolute link target is prefixed with the rootfs
        let tmp = tempfile::tempdir().unwrap();
        let rootfs = tmp.path();
        fs::create_dir_all(rootfs.join("etc")).unwrap();
        fs::create_dir_all(rootfs.join("run")).unwrap();
        fs::write(rootfs.join("run/resolv.conf"), "").unwrap();
        symlink("/run/resolv.conf", rootfs.join("etc/resolv.conf")).unwrap();

        let r = resolve_mount_destination(rootfs, Path::new("/etc/resolv.conf"));
        assert_eq!(r.path, rootfs.join("run/resolv.conf"));
        assert!(!r.not_found);
    }

    #[test]
    fn test_resolve_absolute_symlink_with_rootfs_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let rootfs = tmp.path();
        fs::create_dir_all(rootfs.join("run")).unwrap();
        symlink(rootfs.join("run"), rootfs.join("var")).unwrap();

        let r = resolve_mount_destination(rootfs, Path::new("/var/log"));
        assert_eq!(r.path, rootfs.join("var/log"));
        assert!(r.not_found);
    }

    #[test]
    fn test_resolve_escape_detected() {
        // a symlink pointing outside the rootfs via .. must not escape
        let tmp = tempfile::tempdir().unwrap();
        let rootfs = tmp.path().join("rootfs");
        fs::create_dir_all(&rootfs).unwrap();
        symlink("../../../../../../tmp", rootfs.join("escape")).unwrap();

        let r = resolve_mount_destination(&rootfs, Path::new("/escape/x"));
        assert!(
            !r.path.starts_with(&rootfs),
            "resolved to {:?}, escape must be detectable by prefix check",
            r.path
        );
    }

    #[test]
    fn test_configure_mounts_sorted_and_rewritten() {
        use oci_spec::runtime::{MountBuilder, RootBuilder};

        let tmp = tempfile::tempdir().unwrap();
        let rootfs = tmp.path().join("rootfs");
        fs::create_dir_all(&rootfs).unwrap();

        let mut spec = Spec::default();
        spec.set_root(Some(
            RootBuilder::default()
                .path(&rootfs)
                .readonly(false)
                .build()
                .unwrap(),
        ));
        spec.set_mounts(Some(vec![
            MountBuilder::default()
                .destination("/sys/fs/cgroup")
                .typ("cgroup")
                .source("cgroup")
                .options(vec!["nosuid".to_string()])
                .build()
                .unwrap(),
            MountBuilder::default()
                .destination("/dev")
                .typ("tmpfs")
                .source("tmpfs")
                .options(vec!["nosuid".to_string(), "tmpcopyup".to_string()])
                .build()
                .unwrap(),
        ]));

        let mut config = EngineConfig::new();
        configure_mounts(&mut spec, &mut config).unwrap();

        let entries: Vec<&str> = config.get_all("lxc.mount.entry").collect();
        assert_eq!(entries.len(), 2);
        // sorted by destination: /dev before /sys/fs/cgroup
        assert!(entries[0].contains("tmpfs"));
        assert!(!entries[0].contains("tmpcopyup"), "{}", entries[0]);
        assert!(entries[1].starts_with("cgroup2 "));
        assert!(entries[1].contains("cgroup2"));
        assert!(entries[1].contains("optional"));
        assert_eq!(config.get("lxc.mount.auto"), Some(""));
    }

    #[test]
    fn test_configure_mounts_escape_fails() {
        use oci_spec::runtime::{MountBuilder, RootBuilder};

        let tmp = tempfile::tempdir().unwrap();
        let rootfs = tmp.path().join("rootfs");
        fs::create_dir_all(&rootfs).unwrap();
        symlink("/", rootfs.join("host")).unwrap();

        let mut spec = Spec::default();
        spec.set_root(Some(
            RootBuilder::default().path(&rootfs).build().unwrap(),
        ));
        spec.set_mounts(Some(vec![MountBuilder::default()
            .destination("/host/etc/passwd")
            .typ("bind")
            .source("/etc/passwd")
            .options(vec!["bind".to_string()])
            .build()
            .unwrap()]));

        let mut config = EngineConfig::new();
        // "/" keeps the rootfs prefix after re-anchoring, so this resolves
        // inside the rootfs rather than escaping
        let res = configure_mounts(&mut spec, &mut config);
        assert!(res.is_ok());
        let entry = config.get("lxc.mount.entry").unwrap();
        assert!(entry.contains(rootfs.to_str().unwrap()));
    }

    #[test]
    fn test_missing_bind_source_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = Spec::default();
        let mut options = vec!["bind".to_string()];
        let err = create_mount_destination(
            &spec,
            Some(Path::new("/does/not/exist")),
            "bind",
            &tmp.path().join("dst"),
            &mut options,
        )
        .unwrap_err();
        assert!(matches!(err, LxcriError::InvalidSpec(_)));

        // optional bind mounts with a missing source are skipped
        let mut options = vec!["bind".to_string(), "optional".to_string()];
        create_mount_destination(
            &spec,
            Some(Path::new("/does/not/exist")),
            "bind",
            &tmp.path().join("dst"),
            &mut options,
        )
        .unwrap();
        assert!(!options.iter().any(|o| o.starts_with("create=")));
    }

    #[test]
    fn test_create_destination_readonly_rootfs() {
        use oci_spec::runtime::RootBuilder;

        let tmp = tempfile::tempdir().unwrap();
        let rootfs = tmp.path().join("rootfs");
        fs::create_dir_all(&rootfs).unwrap();
        let src_file = tmp.path().join("token");
        fs::write(&src_file, "secret").unwrap();

        let mut spec = Spec::default();
        spec.set_root(Some(
            RootBuilder::default()
                .path(&rootfs)
                .readonly(true)
                .build()
                .unwrap(),
        ));

        let dst = rootfs.join("var/run/secret/token");
        let mut options = vec!["bind".to_string()];
        create_mount_destination(&spec, Some(&src_file), "bind", &dst, &mut options).unwrap();
        assert!(options.contains(&"create=file".to_string()));
        assert!(dst.exists());

        let dirdst = rootfs.join("data");
        let mut options = vec![];
        create_mount_destination(&spec, Some(tmp.path()), "bind", &dirdst, &mut options).unwrap();
        assert!(options.contains(&"create=dir".to_string()));
        assert!(dirdst.is_dir());
    }

    #[test]
    fn test_readonly_paths() {
        use oci_spec::runtime::{LinuxBuilder, RootBuilder};

        let mut spec = Spec::default();
        spec.set_root(Some(
            RootBuilder::default().path("/tmp/rootfs").build().unwrap(),
        ));
        let linux = LinuxBuilder::default()
            .readonly_paths(vec!["/proc/sys".to_string()])
            .build()
            .unwrap();
        spec.set_linux(Some(linux));

        let mut config = EngineConfig::new();
        config.set("lxc.rootfs.mount", "/tmp/rootfs");
        configure_readonly_paths(&spec, &mut config).unwrap();
        assert_eq!(
            config.get("lxc.mount.entry"),
            Some("/tmp/rootfs/proc/sys proc/sys bind bind,ro,optional")
        );
    }

    #[test]
    fn test_filter_mount_options() {
        let opts = filter_mount_options(
            "tmpfs",
            vec!["nosuid".to_string(), "tmpcopyup".to_string()],
        );
        assert_eq!(opts, vec!["nosuid"]);
        let opts = filter_mount_options("proc", vec!["tmpcopyup".to_string()]);
        assert_eq!(opts, vec!["tmpcopyup"]);
    }

    #[test]
    fn test_relative_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let rootfs = tmp.path();
        let r = resolve_mount_destination(rootfs, Path::new("etc"));
        assert_eq!(r.path, rootfs.join("etc"));
        assert!(r.not_found);
    }
}
