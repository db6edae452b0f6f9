use std::io::Write;

use anyhow::Result;
use chrono::{DateTime, Local};
use liblxcri::runtime::Runtime;
use lxcri_cli::List;
use tabwriter::TabWriter;

pub fn list(args: List, rt: &Runtime) -> Result<()> {
    let ids = rt.list()?;

    if args.quiet {
        for id in ids {
            println!("{id}");
        }
        return Ok(());
    }

    let mut tab_writer = TabWriter::new(std::io::stdout());
    writeln!(tab_writer, "ID\tPID\tSTATUS\tBUNDLE\tCREATED")?;
    for id in ids {
        // containers may disappear while listing
        let Ok(container) = rt.load(&id) else {
            continue;
        };
        let state = container.state();
        let pid = state.pid.map(|pid| pid.to_string()).unwrap_or_default();
        let created = container
            .created_at
            .map(|utc| {
                let local: DateTime<Local> = DateTime::from(utc);
                local.to_rfc3339_opts(chrono::SecondsFormat::Secs, false)
            })
            .unwrap_or_default();
        writeln!(
            tab_writer,
            "{}\t{}\t{}\t{}\t{}",
            container.id(),
            pid,
            state.status,
            container.config.bundle_path.display(),
            created
        )?;
    }
    tab_writer.flush()?;
    Ok(())
}
