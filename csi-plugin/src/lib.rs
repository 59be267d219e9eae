//! CSI plugin support library
//!
//! Shared between the storage agent and the plugin processes it launches:
//! - `paths`: on-disk layout of plugin containers under the CSI root directory
//! - `protocol`: request/response messages exchanged over the plugin endpoint
//! - `client`: async client used by the agent to talk to a plugin
//! - `server`: endpoint server loop used by plugin implementations
//! - `bytes`: human readable byte sizes (`4GB`, `512MB`)

pub mod bytes;
pub mod client;
pub mod paths;
pub mod protocol;
pub mod server;

pub use bytes::Bytes;
pub use client::{ClientError, PluginClient};
pub use paths::{ContainerPath, PathError};
pub use protocol::{ENDPOINT_ENV, PluginInfo, PluginRequest, PluginResponse, Volume};
pub use server::PluginService;
