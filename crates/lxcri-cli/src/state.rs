use clap::Parser;

/// Show the OCI state of a container
#[derive(Parser, Debug)]
pub struct State {
    #[clap(value_parser = clap::builder::NonEmptyStringValueParser::new(), required = true)]
    pub container_id: String,
}
