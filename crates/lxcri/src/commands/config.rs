use std::path::PathBuf;

use anyhow::{Context, Result};
use liblxcri::runtime::Runtime;
use lxcri_cli::Config;

pub fn config(args: Config, rt: &Runtime) -> Result<()> {
    let rt_default;
    let rt = if args.default {
        rt_default = Runtime::new(!nix::unistd::Uid::effective().is_root());
        &rt_default
    } else {
        rt
    };

    let yaml = serde_yaml::to_string(rt)?;
    if !args.quiet {
        println!("---\n{yaml}---");
    }

    let out: Option<PathBuf> = if args.update {
        Some(
            rt.config_path()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(Runtime::default_config_path),
        )
    } else {
        args.out
    };

    let Some(out) = out else {
        return Ok(());
    };
    if let Some(dir) = out.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config file directory {}", dir.display()))?;
    }
    println!("writing config to {}", out.display());
    std::fs::write(&out, yaml)
        .with_context(|| format!("failed to write config file {}", out.display()))?;
    Ok(())
}
