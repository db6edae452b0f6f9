//! Driver for the engine (liblxc) configuration surface.
//!
//! The engine is never linked into the runtime. All configuration is
//! expressed as an ordered list of `key = value` entries written to the
//! `config` file in the runtime directory, which the monitor process loads
//! before starting the container.

use std::fmt::Write as _;
use std::path::Path;
use std::process::Command;

use crate::{store, Result};

/// Keys that accumulate values. All other keys are scalar, assigning them
/// again replaces the previous value like liblxc does on config reload.
const LIST_KEYS: [&str; 8] = [
    "lxc.mount.entry",
    "lxc.idmap",
    "lxc.cgroup2.devices.allow",
    "lxc.cgroup2.devices.deny",
    "lxc.cgroup.devices.allow",
    "lxc.cgroup.devices.deny",
    "lxc.environment",
    "lxc.sysctl",
];

fn is_list_key(key: &str) -> bool {
    LIST_KEYS.contains(&key) || key.starts_with("lxc.sysctl.") || key.starts_with("lxc.prlimit.")
}

/// Ordered engine key/value configuration.
///
/// Entries are emitted in the order they are set so that the rendered
/// config file is reproducible for identical specs.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    entries: Vec<(String, String)>,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a config item. Scalar keys are overwritten in place, list keys
    /// append a new entry.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        tracing::debug!(key, %value, "set config item");
        if !is_list_key(key) {
            if let Some(entry) = self.entries.iter_mut().find(|(k, _)| k == key) {
                entry.1 = value;
                return;
            }
        }
        self.entries.push((key.to_owned(), value));
    }

    /// Returns the last value set for the given key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns all values set for the given key, in insertion order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            let _ = writeln!(out, "{key} = {value}");
        }
        out
    }

    /// Writes the config file. The file must not exist yet.
    pub fn save(&self, path: &Path) -> Result<()> {
        store::write_excl(path, self.render().as_bytes(), 0o640)?;
        tracing::debug!(file = ?path, "created engine config file");
        Ok(())
    }

    /// Parses a config file written by [EngineConfig::save].
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(Self::parse(&data))
    }

    pub fn parse(data: &str) -> Self {
        let mut config = Self::new();
        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                config
                    .entries
                    .push((key.trim().to_owned(), value.trim().to_owned()));
            }
        }
        config
    }
}

/// Version of the engine library, probed through the monitor binary.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EngineVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl EngineVersion {
    pub fn at_least(&self, major: u32, minor: u32, patch: u32) -> bool {
        (self.major, self.minor, self.patch) >= (major, minor, patch)
    }

    /// Parses version output such as `5.0.3` or `lxc version: 4.0.12`.
    pub fn parse(s: &str) -> Option<Self> {
        let token = s
            .split_whitespace()
            .find(|t| t.chars().next().is_some_and(|c| c.is_ascii_digit()))?;
        let mut parts = token.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let patch = parts
            .next()
            .and_then(|p| {
                // tolerate suffixes like `0-devel`
                p.split(|c: char| !c.is_ascii_digit()).next()?.parse().ok()
            })
            .unwrap_or(0);
        Some(Self {
            major,
            minor,
            patch,
        })
    }

    /// Runs `<monitor> --version` and parses the reported engine version.
    pub fn probe(monitor: &Path) -> std::io::Result<Option<Self>> {
        let output = Command::new(monitor).arg("--version").output()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(Self::parse(stdout.trim()))
    }
}

impl std::fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_keys_overwrite() {
        let mut config = EngineConfig::new();
        config.set("lxc.console.path", "/dev/pts/3");
        config.set("lxc.console.path", "none");
        assert_eq!(config.get("lxc.console.path"), Some("none"));
        assert_eq!(config.len(), 1);
    }

    #[test]
    fn test_list_keys_accumulate() {
        let mut config = EngineConfig::new();
        config.set("lxc.mount.entry", "proc proc proc defaults");
        config.set("lxc.mount.entry", "tmpfs dev tmpfs nosuid");
        config.set("lxc.idmap", "u 0 100000 65536");
        assert_eq!(config.get_all("lxc.mount.entry").count(), 2);
        assert_eq!(
            config.get("lxc.mount.entry"),
            Some("tmpfs dev tmpfs nosuid")
        );
    }

    #[test]
    fn test_render_parse_roundtrip() {
        let mut config = EngineConfig::new();
        config.set("lxc.uts.name", "host1");
        config.set("lxc.rootfs.managed", "0");
        config.set("lxc.mount.entry", "a b c d");
        config.set("lxc.mount.entry", "e f g h");

        let rendered = config.render();
        let parsed = EngineConfig::parse(&rendered);
        assert_eq!(parsed, config);
        // rendering is reproducible
        assert_eq!(parsed.render(), rendered);
    }

    #[test]
    fn test_save_is_exclusive() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config");
        let mut config = EngineConfig::new();
        config.set("lxc.autodev", "0");
        config.save(&path).unwrap();
        assert!(config.save(&path).is_err());
        assert_eq!(EngineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_parse_skips_comments() {
        let config = EngineConfig::parse("# comment\n\nlxc.autodev = 0\n");
        assert_eq!(config.len(), 1);
        assert_eq!(config.get("lxc.autodev"), Some("0"));
    }

    #[test]
    fn test_version_parse() {
        let v = EngineVersion::parse("5.0.3").unwrap();
        assert!(v.at_least(4, 0, 9));
        assert!(v.at_least(5, 0, 3));
        assert!(!v.at_least(5, 1, 0));

        let v = EngineVersion::parse("lxc version: 4.0.12").unwrap();
        assert_eq!((v.major, v.minor, v.patch), (4, 0, 12));

        let v = EngineVersion::parse("3.1").unwrap();
        assert!(v.at_least(3, 1, 0));

        let v = EngineVersion::parse("5.0.0-devel").unwrap();
        assert_eq!(v.to_string(), "5.0.0");

        assert!(EngineVersion::parse("no version here").is_none());
    }
}
