use anyhow::{bail, Context, Result};
use liblxcri::exec::{ExecOptions, EXIT_CMD_NOT_EXECUTABLE, EXIT_CMD_NOT_FOUND};
use liblxcri::runtime::Runtime;
use liblxcri::utils;
use lxcri_cli::Exec;
use oci_spec::runtime::{LinuxNamespaceType, Process, ProcessBuilder};

/// Exit status of the executed command, passed through as the exit status
/// of the `lxcri exec` invocation.
#[derive(Debug)]
pub struct ExecStatus(pub i32);

impl std::fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // the engine remaps execvp errors to shell exit codes
        match self.0 {
            EXIT_CMD_NOT_EXECUTABLE => write!(f, "can not execute file: file header not recognized"),
            EXIT_CMD_NOT_FOUND => write!(f, "executable file not found in $PATH"),
            code => write!(f, "cmd execution failed with exit status {code}"),
        }
    }
}

impl std::error::Error for ExecStatus {}

/// Loads the process spec from the given JSON file, or builds one from
/// the command line arguments.
fn load_process(args: &Exec) -> Result<Process> {
    if let Some(path) = &args.process {
        let data = std::fs::read(path)
            .with_context(|| format!("failed to read process spec {}", path.display()))?;
        let process = serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse process spec {}", path.display()))?;
        return Ok(process);
    }
    if args.command.is_empty() {
        bail!("process spec path and command are empty");
    }
    Ok(ProcessBuilder::default()
        .cwd("/")
        .args(args.command.clone())
        .build()?)
}

fn namespaces(args: &Exec) -> Vec<LinuxNamespaceType> {
    let flags = [
        (args.cgroup, LinuxNamespaceType::Cgroup),
        (args.ipc, LinuxNamespaceType::Ipc),
        (args.mnt, LinuxNamespaceType::Mount),
        (args.net, LinuxNamespaceType::Network),
        (args.pid, LinuxNamespaceType::Pid),
        (args.user, LinuxNamespaceType::User),
        (args.uts, LinuxNamespaceType::Uts),
    ];
    flags
        .into_iter()
        .filter_map(|(enabled, typ)| enabled.then_some(typ))
        .collect()
}

pub fn exec(args: Exec, rt: &Runtime) -> Result<()> {
    if args.detach && args.pid_file.is_none() {
        tracing::warn!("detaching process but pid-file is unset");
    }

    let process = load_process(&args)?;
    let container = super::load_container(rt, &args.container_id)?;
    let opts = ExecOptions {
        namespaces: namespaces(&args),
    };

    tracing::info!(
        cmd = ?process.args().as_ref().and_then(|a| a.first()),
        uid = process.user().uid(),
        gid = process.user().gid(),
        "execute cmd"
    );

    if args.detach {
        let pid = rt.exec_detached(&container, &process, &opts)?;
        if let Some(pid_file) = &args.pid_file {
            utils::create_pid_file(pid_file, pid)
                .with_context(|| format!("failed to write pid file {}", pid_file.display()))?;
        }
    } else {
        let status = rt.exec(&container, &process, &opts)?;
        if status != 0 {
            return Err(ExecStatus(status).into());
        }
    }
    Ok(())
}
