//! Execute an additional process inside a running container.
//!
//! The engine monitor owns the container, so attach works by joining the
//! namespaces of the container init process and forking the new process
//! inside them.

use std::ffi::CString;
use std::fs::File;
use std::os::fd::{AsFd, AsRawFd};

use nix::sched::{setns, CloneFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, execvpe, fork, setgid, setgroups, setuid, ForkResult, Gid, Pid, Uid};
use oci_spec::runtime::{LinuxNamespaceType, Process};

use crate::container::{Container, ContainerStatus};
use crate::runtime::Runtime;
use crate::{LxcriError, Result};

/// Exit codes the engine uses for exec failures, reported with a
/// descriptive message by the CLI.
pub const EXIT_CMD_NOT_EXECUTABLE: i32 = 126;
pub const EXIT_CMD_NOT_FOUND: i32 = 127;

/// Options for exec.
#[derive(Debug, Default, Clone)]
pub struct ExecOptions {
    /// Namespaces to attach to. An empty list attaches to all namespaces
    /// of the container.
    pub namespaces: Vec<LinuxNamespaceType>,
}

/// Join order matters: the user namespace grants the privileges required
/// to enter the others, the mount namespace comes last because it changes
/// the /proc the remaining ns files are opened from.
const ATTACH_ORDER: [(LinuxNamespaceType, &str, CloneFlags); 7] = [
    (LinuxNamespaceType::User, "user", CloneFlags::CLONE_NEWUSER),
    (LinuxNamespaceType::Ipc, "ipc", CloneFlags::CLONE_NEWIPC),
    (LinuxNamespaceType::Uts, "uts", CloneFlags::CLONE_NEWUTS),
    (
        LinuxNamespaceType::Network,
        "net",
        CloneFlags::CLONE_NEWNET,
    ),
    (LinuxNamespaceType::Pid, "pid", CloneFlags::CLONE_NEWPID),
    (
        LinuxNamespaceType::Cgroup,
        "cgroup",
        CloneFlags::CLONE_NEWCGROUP,
    ),
    (LinuxNamespaceType::Mount, "mnt", CloneFlags::CLONE_NEWNS),
];

fn attach_namespaces(init_pid: Pid, opts: &ExecOptions) -> Result<()> {
    for (typ, name, flag) in ATTACH_ORDER {
        if !opts.namespaces.is_empty() && !opts.namespaces.contains(&typ) {
            continue;
        }
        let path = format!("/proc/{init_pid}/ns/{name}");
        let file = match File::open(&path) {
            Ok(file) => file,
            // namespace not used by the container
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        };
        setns(file.as_fd(), flag)
            .map_err(|err| LxcriError::Engine(format!("failed to join {name} namespace: {err}")))?;
    }
    Ok(())
}

fn into_cstrings(values: &[String]) -> Result<Vec<CString>> {
    values
        .iter()
        .map(|v| {
            CString::new(v.as_bytes())
                .map_err(|_| LxcriError::InvalidSpec(format!("invalid process value {v:?}")))
        })
        .collect()
}

fn exit_status(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        _ => 1,
    }
}

fn spawn_attached(
    container: &Container,
    process: &Process,
    opts: &ExecOptions,
) -> Result<(Pid, i32)> {
    // the attached pid is reported through a pipe because the process is
    // forked twice (the pid namespace requires it)
    let (rx, tx) = nix::unistd::pipe()?;

    match unsafe { fork() }? {
        ForkResult::Parent { child } => {
            drop(tx);
            let mut buf = [0u8; 16];
            let n = nix::unistd::read(rx.as_raw_fd(), &mut buf).unwrap_or(0);
            drop(rx);
            let attached_pid = std::str::from_utf8(&buf[..n])
                .ok()
                .and_then(|s| s.trim().parse::<i32>().ok())
                .unwrap_or(-1);
            Ok((child, attached_pid))
        }
        ForkResult::Child => {
            drop(rx);
            let result = (|| -> Result<()> {
                let init_pid = container.init_pid().ok_or_else(|| {
                    LxcriError::Engine("container init process not found".to_string())
                })?;
                attach_namespaces(init_pid, opts)?;
                match unsafe { fork() }? {
                    ForkResult::Parent { child } => {
                        let _ = nix::unistd::write(tx.as_raw_fd(), child.to_string().as_bytes());
                        drop(tx);
                        let status = waitpid(child, None)?;
                        std::process::exit(exit_status(status));
                    }
                    ForkResult::Child => exec_process(process),
                }
            })();
            if let Err(err) = result {
                eprintln!("exec failed: {err}");
            }
            std::process::exit(1);
        }
    }
}

/// Sets up credentials and execs the process. Never returns on success.
fn exec_process(process: &Process) -> Result<()> {
    chdir(process.cwd().as_path())?;
    let user = process.user();
    let gids: Vec<Gid> = user
        .additional_gids()
        .clone()
        .unwrap_or_default()
        .iter()
        .map(|gid| Gid::from_raw(*gid))
        .collect();
    if !gids.is_empty() {
        setgroups(&gids).unwrap_or_else(|err| tracing::debug!(%err, "setgroups failed"));
    }
    setgid(Gid::from_raw(user.gid()))?;
    setuid(Uid::from_raw(user.uid()))?;

    let args = process.args().clone().unwrap_or_default();
    if args.is_empty() {
        return Err(LxcriError::InvalidSpec("process args are empty".to_string()));
    }
    let argv = into_cstrings(&args)?;
    let envp = into_cstrings(&process.env().clone().unwrap_or_default())?;

    let err = execvpe(&argv[0], &argv, &envp).unwrap_err();
    let code = match err {
        nix::errno::Errno::ENOENT => EXIT_CMD_NOT_FOUND,
        nix::errno::Errno::EACCES | nix::errno::Errno::ENOEXEC => EXIT_CMD_NOT_EXECUTABLE,
        _ => 1,
    };
    std::process::exit(code);
}

impl Runtime {
    /// Executes a new process in a running container and waits for it.
    /// Returns the process exit status.
    pub fn exec(
        &self,
        container: &Container,
        process: &Process,
        opts: &ExecOptions,
    ) -> Result<i32> {
        self.check_exec(container)?;
        let (intermediate, _) = spawn_attached(container, process, opts)?;
        let status = waitpid(intermediate, None)?;
        Ok(exit_status(status))
    }

    /// Executes a new process in a running container without waiting for
    /// it. Returns the PID of the attached process.
    pub fn exec_detached(
        &self,
        container: &Container,
        process: &Process,
        opts: &ExecOptions,
    ) -> Result<i32> {
        self.check_exec(container)?;
        let (_, attached_pid) = spawn_attached(container, process, opts)?;
        if attached_pid < 0 {
            return Err(LxcriError::Engine(
                "failed to determine attached process pid".to_string(),
            ));
        }
        Ok(attached_pid)
    }

    fn check_exec(&self, container: &Container) -> Result<()> {
        let status = container.status();
        if status != ContainerStatus::Running {
            return Err(LxcriError::InvalidState {
                state: status.to_string(),
                expected: ContainerStatus::Running.to_string(),
            });
        }
        Ok(())
    }
}
