use std::path::PathBuf;

use clap::Parser;

/// Print the effective runtime configuration as YAML.
/// Global options modify the output.
#[derive(Parser, Debug)]
pub struct Config {
    /// Write the configuration to a file
    #[clap(long)]
    pub out: Option<PathBuf>,
    /// Update the loaded configuration file (--out is ignored)
    #[clap(long)]
    pub update: bool,
    /// Print the default configuration instead of the effective one
    #[clap(long)]
    pub default: bool,
    /// Do not print the configuration to stdout
    #[clap(short, long)]
    pub quiet: bool,
}
