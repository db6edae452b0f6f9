use clap::Parser;

/// Display the runtime state of one or more containers
#[derive(Parser, Debug)]
pub struct Inspect {
    #[clap(value_parser = clap::builder::NonEmptyStringValueParser::new(), required = true)]
    pub container_ids: Vec<String>,
}
