use std::time::Duration;

use csi_plugin::{ClientError, PathError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("plugin container '{0}' did not become ready within {1:?}")]
    ReadyTimeout(String, Duration),

    #[error("plugin container '{container_id}' exited during startup ({status})")]
    ExitedDuringStartup { container_id: String, status: String },

    #[error("failed to spawn plugin container '{container_id}': {source}")]
    Spawn {
        container_id: String,
        source: std::io::Error,
    },

    #[error("no running container serves {0}")]
    NoEndpoint(&'static str),

    #[error("resource discovery did not finish within {0:?}")]
    DiscoveryTimeout(Duration),

    #[error("plugin call failed: {0}")]
    Discovery(#[from] ClientError),

    #[error("CSI path error: {0}")]
    Path(#[from] PathError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LifecycleError>;
