//! Renders an OCI seccomp policy into the engine's text profile format.
//!
//! Profile layout (version 2):
//!
//! ```text
//! 2
//! denylist
//! [x86_64]
//! keyctl errno 1
//! ```

use std::fmt::Write as _;
use std::path::Path;

use oci_spec::runtime::{Arch, LinuxSeccomp, LinuxSeccompAction, LinuxSyscall};

use crate::{store, LxcriError, Result};

/// EPERM, returned for errno rules without an explicit errno.
const DEFAULT_ERRNO: u32 = 1;

fn action_text(action: LinuxSeccompAction, errno_ret: Option<u32>) -> Result<String> {
    let text = match action {
        LinuxSeccompAction::ScmpActAllow => "allow".to_string(),
        LinuxSeccompAction::ScmpActTrap => "trap".to_string(),
        LinuxSeccompAction::ScmpActLog => "log".to_string(),
        LinuxSeccompAction::ScmpActKill | LinuxSeccompAction::ScmpActKillProcess => {
            "kill".to_string()
        }
        LinuxSeccompAction::ScmpActErrno => {
            format!("errno {}", errno_ret.unwrap_or(DEFAULT_ERRNO))
        }
        action => {
            return Err(LxcriError::InvalidSpec(format!(
                "seccomp action {action:?} is not supported by the engine profile format"
            )))
        }
    };
    Ok(text)
}

/// The default policy line. A profile that denies by default lists the
/// allowed syscalls (allowlist) and vice versa.
fn default_policy(seccomp: &LinuxSeccomp) -> &'static str {
    match seccomp.default_action() {
        LinuxSeccompAction::ScmpActAllow | LinuxSeccompAction::ScmpActLog => "denylist",
        _ => "allowlist",
    }
}

fn arch_section(arch: Arch) -> Option<&'static str> {
    let name = match arch {
        Arch::ScmpArchNative => "all",
        Arch::ScmpArchX86 => "x86",
        Arch::ScmpArchX86_64 => "x86_64",
        Arch::ScmpArchX32 => "x32",
        Arch::ScmpArchArm => "arm",
        Arch::ScmpArchAarch64 => "aarch64",
        Arch::ScmpArchMips => "mips",
        Arch::ScmpArchMips64 => "mips64",
        Arch::ScmpArchMips64n32 => "mips64n32",
        Arch::ScmpArchMipsel => "mipsel",
        Arch::ScmpArchMipsel64 => "mipsel64",
        Arch::ScmpArchMipsel64n32 => "mipsel64n32",
        Arch::ScmpArchPpc => "ppc",
        Arch::ScmpArchPpc64 => "ppc64",
        Arch::ScmpArchPpc64le => "ppc64le",
        Arch::ScmpArchS390 => "s390",
        Arch::ScmpArchS390x => "s390x",
        _ => return None,
    };
    Some(name)
}

fn write_syscall(out: &mut String, syscall: &LinuxSyscall) -> Result<()> {
    let action = action_text(syscall.action(), syscall.errno_ret())?;
    for name in syscall.names() {
        let _ = writeln!(out, "{name} {action}");
    }
    Ok(())
}

/// Renders the profile text for the given policy.
pub fn render_profile(seccomp: &LinuxSeccomp) -> Result<String> {
    let mut out = String::new();
    out.push_str("2\n");
    out.push_str(default_policy(seccomp));
    out.push('\n');

    let sections: Vec<&'static str> = match seccomp.architectures() {
        Some(archs) if !archs.is_empty() => {
            let mut sections = Vec::with_capacity(archs.len());
            for arch in archs {
                match arch_section(*arch) {
                    Some(name) => sections.push(name),
                    None => tracing::warn!(?arch, "skipping unsupported seccomp architecture"),
                }
            }
            sections
        }
        _ => vec!["all"],
    };

    let syscalls = seccomp.syscalls().as_deref().unwrap_or(&[]);
    for section in sections {
        let _ = writeln!(out, "[{section}]");
        for syscall in syscalls {
            write_syscall(&mut out, syscall)?;
        }
    }
    Ok(out)
}

/// Renders the policy and writes it to the runtime directory with `O_EXCL`.
pub fn write_profile(path: &Path, seccomp: &LinuxSeccomp) -> Result<()> {
    let profile = render_profile(seccomp)?;
    store::write_excl(path, profile.as_bytes(), 0o440)?;
    tracing::debug!(file = ?path, "created seccomp profile");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::runtime::{LinuxSeccompBuilder, LinuxSyscallBuilder};

    fn policy(
        default_action: LinuxSeccompAction,
        archs: Option<Vec<Arch>>,
        syscalls: Vec<LinuxSyscall>,
    ) -> LinuxSeccomp {
        let mut builder = LinuxSeccompBuilder::default()
            .default_action(default_action)
            .syscalls(syscalls);
        if let Some(archs) = archs {
            builder = builder.architectures(archs);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_render_denylist() {
        let seccomp = policy(
            LinuxSeccompAction::ScmpActAllow,
            Some(vec![Arch::ScmpArchX86_64]),
            vec![LinuxSyscallBuilder::default()
                .names(vec!["keyctl".to_string(), "kexec_load".to_string()])
                .action(LinuxSeccompAction::ScmpActErrno)
                .errno_ret(38u32)
                .build()
                .unwrap()],
        );

        let profile = render_profile(&seccomp).unwrap();
        assert_eq!(
            profile,
            "2\ndenylist\n[x86_64]\nkeyctl errno 38\nkexec_load errno 38\n"
        );
    }

    #[test]
    fn test_render_allowlist_default_arch() {
        let seccomp = policy(
            LinuxSeccompAction::ScmpActErrno,
            None,
            vec![LinuxSyscallBuilder::default()
                .names(vec!["read".to_string()])
                .action(LinuxSeccompAction::ScmpActAllow)
                .build()
                .unwrap()],
        );

        let profile = render_profile(&seccomp).unwrap();
        assert_eq!(profile, "2\nallowlist\n[all]\nread allow\n");
    }

    #[test]
    fn test_errno_defaults_to_eperm() {
        let seccomp = policy(
            LinuxSeccompAction::ScmpActAllow,
            None,
            vec![LinuxSyscallBuilder::default()
                .names(vec!["umount2".to_string()])
                .action(LinuxSeccompAction::ScmpActErrno)
                .build()
                .unwrap()],
        );
        let profile = render_profile(&seccomp).unwrap();
        assert!(profile.contains("umount2 errno 1"));
    }

    #[test]
    fn test_notify_action_rejected() {
        let seccomp = policy(
            LinuxSeccompAction::ScmpActAllow,
            None,
            vec![LinuxSyscallBuilder::default()
                .names(vec!["openat".to_string()])
                .action(LinuxSeccompAction::ScmpActNotify)
                .build()
                .unwrap()],
        );
        assert!(matches!(
            render_profile(&seccomp),
            Err(LxcriError::InvalidSpec(_))
        ));
    }

    #[test]
    fn test_write_profile_once() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("seccomp.conf");
        let seccomp = policy(LinuxSeccompAction::ScmpActAllow, None, vec![]);
        write_profile(&path, &seccomp).unwrap();
        assert!(write_profile(&path, &seccomp).is_err());
        // rendering is reproducible
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            render_profile(&seccomp).unwrap()
        );
    }
}
