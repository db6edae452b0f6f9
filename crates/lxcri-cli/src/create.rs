use std::path::PathBuf;

use clap::Parser;

/// Create a container from a bundle directory
#[derive(Parser, Debug)]
pub struct Create {
    /// Path to the bundle directory, containing config.json and root filesystem
    #[clap(short, long, default_value = ".")]
    pub bundle: PathBuf,
    /// Unix socket (file) path that receives the pty master fd of the container
    #[clap(long)]
    pub console_socket: Option<PathBuf>,
    /// File to write the PID of the monitor process to
    #[clap(long)]
    pub pid_file: Option<PathBuf>,
    /// Unused, accepted for buildah compatibility
    #[clap(long)]
    pub no_new_keyring: bool,
    /// Maximum duration in seconds for create to complete
    #[clap(long, env = "LXCRI_CREATE_TIMEOUT")]
    pub timeout: Option<u64>,

    #[clap(value_parser = clap::builder::NonEmptyStringValueParser::new(), required = true)]
    pub container_id: String,
}
