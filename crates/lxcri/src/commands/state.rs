use std::io::Write;

use anyhow::Result;
use liblxcri::runtime::Runtime;
use lxcri_cli::State;

pub fn state(args: State, rt: &Runtime) -> Result<()> {
    let container = super::load_container(rt, &args.container_id)?;
    let state = container.state();
    let json = serde_json::to_string(&state)?;
    tracing::trace!(%json, "container state");
    std::io::stdout().write_all(json.as_bytes())?;
    Ok(())
}
