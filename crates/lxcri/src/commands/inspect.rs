use std::io::Write;

use anyhow::Result;
use liblxcri::runtime::Runtime;
use lxcri_cli::Inspect;
use serde_json::json;

pub fn inspect(args: Inspect, rt: &Runtime) -> Result<()> {
    let mut stdout = std::io::stdout();
    for id in &args.container_ids {
        let container = super::load_container(rt, id)?;
        let info = json!({
            "container": &container,
            "state": container.state(),
        });
        let json = serde_json::to_string_pretty(&info)?;
        writeln!(stdout, "{json}")?;
    }
    Ok(())
}
