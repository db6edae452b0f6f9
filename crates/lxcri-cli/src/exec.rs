use std::path::PathBuf;

use clap::Parser;

/// Execute a new process in a running container
#[derive(Parser, Debug)]
pub struct Exec {
    /// Path to a process spec JSON, command and args are ignored if set
    #[clap(short, long)]
    pub process: Option<PathBuf>,
    /// File to write the process id to
    #[clap(long)]
    pub pid_file: Option<PathBuf>,
    /// Detach from the executed process
    #[clap(short, long)]
    pub detach: bool,

    /// Run in the container cgroup namespace
    #[clap(long)]
    pub cgroup: bool,
    /// Run in the container IPC namespace
    #[clap(long)]
    pub ipc: bool,
    /// Run in the container mount namespace
    #[clap(long)]
    pub mnt: bool,
    /// Run in the container network namespace
    #[clap(long)]
    pub net: bool,
    /// Run in the container PID namespace
    #[clap(long)]
    pub pid: bool,
    /// Run in the container user namespace
    #[clap(long)]
    pub user: bool,
    /// Run in the container UTS namespace
    #[clap(long)]
    pub uts: bool,

    #[clap(value_parser = clap::builder::NonEmptyStringValueParser::new(), required = true)]
    pub container_id: String,
    /// Command to execute, with arguments
    #[clap(trailing_var_arg = true)]
    pub command: Vec<String>,
}
