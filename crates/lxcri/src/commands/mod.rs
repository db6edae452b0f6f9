use anyhow::{Context, Result};
use liblxcri::container::Container;
use liblxcri::runtime::Runtime;
use liblxcri::utils::Deadline;

pub mod config;
pub mod create;
pub mod delete;
pub mod exec;
pub mod inspect;
pub mod kill;
pub mod list;
pub mod start;
pub mod state;

fn load_container(rt: &Runtime, container_id: &str) -> Result<Container> {
    rt.load(container_id)
        .with_context(|| format!("failed to load container {container_id}"))
}

/// Builds the verb deadline: the command line timeout wins over the
/// runtime configuration.
fn deadline(timeout: Option<u64>, default_secs: u64, op: &'static str) -> Deadline {
    Deadline::seconds(timeout.unwrap_or(default_secs), op)
}
