use anyhow::Result;
use liblxcri::runtime::Runtime;
use liblxcri::signal::parse_signal;
use lxcri_cli::Kill;

pub fn kill(args: Kill, rt: &Runtime) -> Result<()> {
    let signal = parse_signal(&args.signal)?;
    let container = super::load_container(rt, &args.container_id)?;
    rt.kill(&container, signal)?;
    Ok(())
}
