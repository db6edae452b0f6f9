use clap::Parser;

/// Release all resources held by a stopped container
#[derive(Parser, Debug)]
pub struct Delete {
    /// Kill a container that is not yet stopped (using SIGKILL)
    #[clap(short, long)]
    pub force: bool,
    /// Maximum duration in seconds for delete to complete
    #[clap(long, env = "LXCRI_DELETE_TIMEOUT")]
    pub timeout: Option<u64>,

    #[clap(value_parser = clap::builder::NonEmptyStringValueParser::new(), required = true)]
    pub container_id: String,
}
