//! Runtime logger setup.

use std::fs::OpenOptions;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use liblxcri::runtime::LogConfig;
use tracing::Level;

const DEFAULT_LOG_LEVEL: &str = "info";

/// Initializes the global tracing subscriber. Output goes to the
/// configured log file, or to stderr if console logging is requested or
/// no log file is set.
pub fn init(config: &LogConfig, console: bool) -> Result<()> {
    let level = config.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL);
    let level = Level::from_str(level).with_context(|| format!("invalid log level {level:?}"))?;

    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false);

    match &config.log_file {
        Some(path) if !console => {
            let file = open_log_file(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            builder
                .with_writer(std::sync::Arc::new(file))
                .with_ansi(false)
                .init();
        }
        _ => {
            builder.with_writer(std::io::stderr).init();
        }
    }
    Ok(())
}

fn open_log_file(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}
