//! Container status and the OCI state reported to callers.

use std::collections::HashMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::OCI_VERSION;

/// Runtime status of the container, as defined by the OCI runtime spec
/// lifecycle.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    // the create operation has started but init is not yet blocked at the
    // sync fifo
    #[default]
    Creating,
    // init is blocked at the sync fifo, the container process has not run
    Created,
    // the container process has executed the user-specified program
    Running,
    // the container process has exited
    Stopped,
}

impl ContainerStatus {
    pub fn can_start(&self) -> bool {
        matches!(self, ContainerStatus::Created)
    }

    pub fn can_kill(&self) -> bool {
        matches!(self, ContainerStatus::Created | ContainerStatus::Running)
    }

    pub fn can_delete(&self) -> bool {
        matches!(self, ContainerStatus::Stopped)
    }
}

impl Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// The state JSON document defined by the OCI runtime spec. This is what
/// `lxcri state` prints and what hooks receive on stdin.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OciState {
    pub oci_version: String,
    pub id: String,
    pub status: ContainerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    pub bundle: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

impl OciState {
    pub fn new(
        id: &str,
        status: ContainerStatus,
        pid: Option<i32>,
        bundle: impl AsRef<Path>,
    ) -> Self {
        Self {
            oci_version: OCI_VERSION.to_string(),
            id: id.to_string(),
            status,
            pid,
            bundle: bundle.as_ref().to_path_buf(),
            annotations: None,
        }
    }
}
