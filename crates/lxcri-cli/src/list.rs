use clap::Parser;

/// List all containers in the runtime root
#[derive(Parser, Debug)]
pub struct List {
    /// Only print the container IDs
    #[clap(short, long)]
    pub quiet: bool,
}
