//! Signal name parsing for the kill verb.

use std::str::FromStr;

use nix::sys::signal::Signal;

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("invalid signal {0:?}")]
    Invalid(String),
}

/// Parses a signal given as number or name, with or without SIG prefix,
/// case insensitive (e.g `9`, `kill`, `KILL`, `sigkill`, `SIGKILL`).
pub fn parse_signal(s: &str) -> Result<Signal, SignalError> {
    if let Ok(num) = s.parse::<i32>() {
        return Signal::try_from(num).map_err(|_| SignalError::Invalid(s.to_string()));
    }

    let upper = s.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&name).map_err(|_| SignalError::Invalid(s.to_string()))
}
