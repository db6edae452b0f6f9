//! Container management
#[allow(clippy::module_inception)]
mod container;
mod state;

pub use container::{
    Container, ContainerConfig, CONTAINER_FILE, ENGINE_CONFIG_FILE, INIT_STATE_ENV, SYNC_FIFO_FILE,
};
pub use state::{ContainerStatus, OciState};
