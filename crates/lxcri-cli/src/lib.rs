use clap::Parser;

// Subcommands specified in the OCI runtime command line interface:
// https://github.com/opencontainers/runtime-tools/blob/master/docs/command-line-interface.md

mod create;
mod delete;
mod kill;
mod start;
mod state;

pub use create::Create;
pub use delete::Delete;
pub use kill::Kill;
pub use start::Start;
pub use state::State;

// lxcri specific subcommands

mod config;
mod exec;
mod inspect;
mod list;

pub use config::Config;
pub use exec::Exec;
pub use inspect::Inspect;
pub use list::List;

/// Subcommands required by the OCI runtime command line interface.
#[derive(Parser, Debug)]
pub enum StandardCmd {
    Create(Create),
    Start(Start),
    State(State),
    Kill(Kill),
    Delete(Delete),
}

/// Additional subcommands not covered by the OCI command line interface.
#[derive(Parser, Debug)]
pub enum CommonCmd {
    Config(Config),
    Exec(Exec),
    Inspect(Inspect),
    List(List),
}
