use clap::Parser;

/// Start a previously created container
#[derive(Parser, Debug)]
pub struct Start {
    /// Maximum duration in seconds for start to complete
    #[clap(long, env = "LXCRI_START_TIMEOUT")]
    pub timeout: Option<u64>,

    #[clap(value_parser = clap::builder::NonEmptyStringValueParser::new(), required = true)]
    pub container_id: String,
}
