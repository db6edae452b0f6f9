//! liblxcri provides an OCI specific runtime interface for lxc.
//!
//! The [Runtime](runtime::Runtime) translates an OCI runtime spec into the
//! native liblxc configuration, materializes the per-container runtime
//! directory and supervises the monitor process that owns the container.
//! The engine itself (namespace setup, pivot_root, seccomp installation)
//! is driven exclusively through its config file and the `lxcri-start`
//! monitor binary.

pub mod cgroup;
pub mod container;
pub mod create;
pub mod engine;
pub mod exec;
pub mod hooks;
pub mod init;
pub mod monitor;
pub mod mount;
pub mod runtime;
pub mod seccomp;
pub mod signal;
pub mod specutil;
pub mod store;
pub mod utils;

use std::path::PathBuf;

/// Monitor binary, starts the liblxc monitor process (similar to lxc-start).
pub const EXEC_START: &str = "lxcri-start";
/// Hook binary, run by the engine for the configured OCI hook phases.
pub const EXEC_HOOK: &str = "lxcri-hook";
/// Built-in hook binary, creates additional devices and remounts masked paths.
pub const EXEC_HOOK_BUILTIN: &str = "lxcri-hook-builtin";
/// The container init process that execs the container process.
pub const EXEC_INIT: &str = "lxcri-init";

/// Name of the OCI container bundle config file.
pub const BUNDLE_CONFIG_FILE: &str = "config.json";

/// OCI runtime spec version reported in container state.
pub const OCI_VERSION: &str = "1.0.2";

pub type Result<T> = std::result::Result<T, LxcriError>;

/// Error surface of the runtime. The variants mirror the failure classes
/// that are meaningful to a runtime caller (crio / conmon / kubelet).
#[derive(Debug, thiserror::Error)]
pub enum LxcriError {
    #[error("container does not exist")]
    NotExist,
    #[error("container already exists")]
    AlreadyExists,
    #[error("invalid spec: {0}")]
    InvalidSpec(String),
    #[error("invalid container state {state}, expected {expected}")]
    InvalidState { state: String, expected: String },
    #[error("mount destination {destination:?} resolves to {resolved:?} which escapes the rootfs")]
    EscapesRoot {
        destination: PathBuf,
        resolved: PathBuf,
    },
    #[error("{op} timed out")]
    Timeout { op: &'static str },
    #[error("{phase} hook failed")]
    HookFailed {
        phase: hooks::HookPhase,
        #[source]
        source: hooks::HookError,
    },
    #[error("engine error: {0}")]
    Engine(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("os error: {0}")]
    Errno(#[from] nix::errno::Errno),
    #[error(transparent)]
    Spec(#[from] oci_spec::OciSpecError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] store::StoreError),
    #[error(transparent)]
    Cgroup(#[from] cgroup::CgroupError),
    #[error(transparent)]
    Signal(#[from] signal::SignalError),
    #[error("failed to inspect process state: {0}")]
    Procfs(#[from] procfs::ProcError),
}
