use anyhow::Result;
use liblxcri::runtime::Runtime;
use lxcri_cli::Start;

pub fn start(args: Start, rt: &Runtime) -> Result<()> {
    let mut container = super::load_container(rt, &args.container_id)?;
    let deadline = super::deadline(args.timeout, rt.timeouts.start, "start");
    rt.start(&mut container, &deadline)?;
    Ok(())
}
