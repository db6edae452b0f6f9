//! On-disk runtime store.
//!
//! The runtime exclusively owns `<root>/<id>`. Every file in it is written
//! exactly once with `O_EXCL`, so a second `create` with the same id or a
//! repeated write of runtime state fails loudly instead of silently
//! overwriting prior state.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("container runtime directory {0:?} already exists")]
    Exists(PathBuf),
    #[error("failed to create runtime directory {path:?}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {path:?}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode {path:?}")]
    Encode {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to read {path:?}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path:?}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

type Result<T> = std::result::Result<T, StoreError>;

/// Creates `<root>/<id>` with mode 0700. Fails if the directory exists.
pub fn create_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        return Err(StoreError::Exists(dir.to_owned()));
    }
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .map_err(|err| StoreError::CreateDir {
            path: dir.to_owned(),
            source: err,
        })
}

/// Writes `data` to a new file created with `O_EXCL` and the given mode.
pub fn write_excl(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)
        .map_err(|err| StoreError::Write {
            path: path.to_owned(),
            source: err,
        })?;
    file.write_all(data).map_err(|err| StoreError::Write {
        path: path.to_owned(),
        source: err,
    })
}

/// JSON-encodes `value` into a new file created with `O_EXCL`.
pub fn write_json_excl<T: Serialize>(path: &Path, value: &T, mode: u32) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)
        .map_err(|err| StoreError::Write {
            path: path.to_owned(),
            source: err,
        })?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, value).map_err(|err| StoreError::Encode {
        path: path.to_owned(),
        source: err,
    })?;
    writer.flush().map_err(|err| StoreError::Write {
        path: path.to_owned(),
        source: err,
    })
}

/// Reads and decodes a JSON file from the store.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read(path).map_err(|err| StoreError::Read {
        path: path.to_owned(),
        source: err,
    })?;
    serde_json::from_slice(&data).map_err(|err| StoreError::Parse {
        path: path.to_owned(),
        source: err,
    })
}

/// Removes the runtime directory recursively. A missing directory is not
/// an error, delete must be idempotent.
pub fn remove(dir: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
