use clap::Parser;

/// Send a signal to the container init process
#[derive(Parser, Debug)]
pub struct Kill {
    /// Timeout for killing all processes in the container cgroup
    #[clap(long, env = "LXCRI_KILL_TIMEOUT")]
    pub timeout: Option<u64>,

    #[clap(value_parser = clap::builder::NonEmptyStringValueParser::new(), required = true)]
    pub container_id: String,
    /// Signal name or number (e.g 9, kill, KILL, SIGKILL)
    #[clap(default_value = "SIGTERM")]
    pub signal: String,
}
