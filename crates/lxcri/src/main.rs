//! lxcri is an OCI compliant runtime wrapper for lxc.
//!
//! The binary parses global flags and the config file into a
//! [liblxcri::runtime::Runtime] value, configures logging and dispatches
//! to the requested lifecycle verb.

mod commands;
mod logger;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use liblxcri::runtime::Runtime;
use lxcri_cli::{CommonCmd, StandardCmd};

#[derive(Parser, Debug)]
#[clap(version, about = "lxcri is an OCI compliant runtime wrapper for lxc")]
struct Opts {
    #[clap(flatten)]
    global: GlobalOpts,

    #[clap(subcommand)]
    subcmd: SubCommand,
}

/// Global options, each mirrored by an LXCRI_* environment variable.
/// Unset options keep the value from the configuration file or the
/// built-in default.
#[derive(Parser, Debug)]
struct GlobalOpts {
    /// Root directory for storage of container runtime state
    /// (tmpfs is recommended)
    #[clap(long, env = "LXCRI_ROOT")]
    root: Option<PathBuf>,
    /// Path to the directory that contains the runtime executables
    #[clap(long, env = "LXCRI_LIBEXEC")]
    libexec: Option<PathBuf>,
    /// Cgroup for the engine monitor process
    #[clap(long, env = "LXCRI_MONITOR_CGROUP")]
    monitor_cgroup: Option<PathBuf>,
    /// The cgroup path in the container spec is systemd encoded and must
    /// be expanded
    #[clap(long)]
    systemd_cgroup: bool,
    /// Runtime log file path
    #[clap(long, env = "LXCRI_LOG_FILE")]
    log_file: Option<PathBuf>,
    /// Runtime log level (trace|debug|info|warn|error)
    #[clap(long, env = "LXCRI_LOG_LEVEL")]
    log_level: Option<String>,
    /// Container (engine) log file path
    #[clap(long, env = "LXCRI_CONTAINER_LOG_FILE")]
    container_log_file: Option<PathBuf>,
    /// Container (engine) log level
    #[clap(long, env = "LXCRI_CONTAINER_LOG_LEVEL")]
    container_log_level: Option<String>,
    /// Log to stderr instead of the log file
    #[clap(long)]
    log_console: bool,
    /// Generate and apply a seccomp profile from the container spec
    #[clap(long, env = "LXCRI_SECCOMP", action = clap::ArgAction::Set, num_args = 1)]
    seccomp: Option<bool>,
    /// Keep only the capabilities defined in the container spec
    #[clap(long, env = "LXCRI_CAPABILITIES", action = clap::ArgAction::Set, num_args = 1)]
    capabilities: Option<bool>,
    /// Set the apparmor profile defined in the container spec
    #[clap(long, env = "LXCRI_APPARMOR", action = clap::ArgAction::Set, num_args = 1)]
    apparmor: Option<bool>,
    /// Allow only the devices permitted by the container spec
    #[clap(long, env = "LXCRI_CGROUP_DEVICES", action = clap::ArgAction::Set, num_args = 1)]
    cgroup_devices: Option<bool>,
}

#[derive(Parser, Debug)]
enum SubCommand {
    #[clap(flatten)]
    Standard(Box<StandardCmd>),
    #[clap(flatten)]
    Common(Box<CommonCmd>),
}

impl GlobalOpts {
    /// Applies the options that were explicitly set on the command line
    /// or through the environment.
    fn apply(&self, rt: &mut Runtime) {
        if let Some(root) = &self.root {
            rt.root = root.clone();
        }
        if let Some(libexec) = &self.libexec {
            rt.libexec_dir = libexec.clone();
        }
        if let Some(monitor_cgroup) = &self.monitor_cgroup {
            rt.monitor_cgroup = monitor_cgroup.clone();
        }
        if let Some(log_file) = &self.log_file {
            rt.log.log_file = Some(log_file.clone());
        }
        if let Some(log_level) = &self.log_level {
            rt.log.log_level = Some(log_level.clone());
        }
        if let Some(file) = &self.container_log_file {
            rt.log.container_log_file = Some(file.clone());
        }
        if let Some(level) = &self.container_log_level {
            rt.log.container_log_level = Some(level.clone());
        }
        if let Some(seccomp) = self.seccomp {
            rt.features.seccomp = seccomp;
        }
        if let Some(capabilities) = self.capabilities {
            rt.features.capabilities = capabilities;
        }
        if let Some(apparmor) = self.apparmor {
            rt.features.apparmor = apparmor;
        }
        if let Some(cgroup_devices) = self.cgroup_devices {
            rt.features.cgroup_devices = cgroup_devices;
        }
    }
}

fn main() {
    let opts = Opts::parse();

    let mut rt = Runtime::new(!nix::unistd::Uid::effective().is_root());
    if let Err(err) = rt.load_config(None) {
        eprintln!("lxcri: failed to load config file: {err}");
        std::process::exit(1);
    }
    opts.global.apply(&mut rt);

    if let Err(err) = logger::init(&rt.log, opts.global.log_console) {
        eprintln!("lxcri: log init failed: {err}");
    }

    let result = run(opts, &mut rt);
    if let Err(err) = result {
        tracing::error!(%err, "command failed");
        // diagnostics for the calling runtime (crio / kubelet)
        eprintln!("lxcri: {err:#}");
        // pass through the exit status of an executed command
        if let Some(commands::exec::ExecStatus(code)) =
            err.downcast_ref::<commands::exec::ExecStatus>()
        {
            std::process::exit(*code);
        }
        std::process::exit(1);
    }
}

fn run(opts: Opts, rt: &mut Runtime) -> Result<()> {
    match opts.subcmd {
        SubCommand::Standard(cmd) => match *cmd {
            StandardCmd::Create(args) => {
                rt.init()?;
                commands::create::create(args, rt, opts.global.systemd_cgroup)
            }
            StandardCmd::Start(args) => {
                rt.init()?;
                commands::start::start(args, rt)
            }
            StandardCmd::State(args) => {
                rt.init()?;
                commands::state::state(args, rt)
            }
            StandardCmd::Kill(args) => {
                rt.init()?;
                commands::kill::kill(args, rt)
            }
            StandardCmd::Delete(args) => {
                rt.init()?;
                commands::delete::delete(args, rt)
            }
        },
        SubCommand::Common(cmd) => match *cmd {
            CommonCmd::Config(args) => commands::config::config(args, rt),
            CommonCmd::Exec(args) => {
                rt.init()?;
                commands::exec::exec(args, rt)
            }
            CommonCmd::Inspect(args) => {
                rt.init()?;
                commands::inspect::inspect(args, rt)
            }
            CommonCmd::List(args) => {
                rt.init()?;
                commands::list::list(args, rt)
            }
        },
    }
}
