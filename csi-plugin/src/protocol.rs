//! Messages exchanged between the agent and a plugin over its endpoint.
//!
//! Each request and each response is a single JSON object terminated by a
//! newline. A connection may carry any number of request/response pairs.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Environment variable through which a plugin learns its endpoint.
pub const ENDPOINT_ENV: &str = "CSI_ENDPOINT";

const UNIX_SCHEME: &str = "unix://";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum PluginRequest {
    Probe,
    GetPluginInfo,
    GetCapacity,
    ListVolumes,
}

impl PluginRequest {
    pub fn name(&self) -> &'static str {
        match self {
            PluginRequest::Probe => "probe",
            PluginRequest::GetPluginInfo => "get_plugin_info",
            PluginRequest::GetCapacity => "get_capacity",
            PluginRequest::ListVolumes => "list_volumes",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PluginResponse {
    Probe { ready: bool },
    PluginInfo(PluginInfo),
    Capacity { available_capacity: u64 },
    Volumes { volumes: Vec<Volume> },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub vendor_version: String,
}

/// A pre-provisioned volume; `capacity` is in bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub capacity: u64,
}

/// Endpoint URL handed to a plugin for the given socket path.
pub fn endpoint_url(socket: &Path) -> String {
    format!("{}{}", UNIX_SCHEME, socket.display())
}

/// Socket path from an endpoint URL. Bare paths are accepted as well.
pub fn parse_endpoint(endpoint: &str) -> Option<PathBuf> {
    let path = endpoint.strip_prefix(UNIX_SCHEME).unwrap_or(endpoint);
    if path.is_empty() {
        None
    } else {
        Some(PathBuf::from(path))
    }
}
