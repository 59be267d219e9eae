//! Agent-side client for a plugin endpoint.

use std::path::Path;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::trace;

use crate::protocol::{PluginInfo, PluginRequest, PluginResponse, Volume};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("plugin closed the connection")]
    Closed,

    #[error("plugin error: {0}")]
    Plugin(String),

    #[error("unexpected response to {request}: {response:?}")]
    UnexpectedResponse {
        request: &'static str,
        response: PluginResponse,
    },
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// A connection to one plugin endpoint. Calls are sequential.
#[derive(Debug)]
pub struct PluginClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl PluginClient {
    pub async fn connect(socket: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket).await?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer: write,
        })
    }

    /// Send one request and wait for its response.
    ///
    /// `Error` responses from the plugin are turned into `ClientError::Plugin`.
    pub async fn call(&mut self, request: PluginRequest) -> Result<PluginResponse> {
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;

        let mut buf = String::new();
        if self.reader.read_line(&mut buf).await? == 0 {
            return Err(ClientError::Closed);
        }
        trace!(method = request.name(), response = buf.trim_end(), "Plugin call");

        match serde_json::from_str(&buf)? {
            PluginResponse::Error { message } => Err(ClientError::Plugin(message)),
            response => Ok(response),
        }
    }

    pub async fn probe(&mut self) -> Result<bool> {
        match self.call(PluginRequest::Probe).await? {
            PluginResponse::Probe { ready } => Ok(ready),
            response => Err(unexpected(PluginRequest::Probe, response)),
        }
    }

    pub async fn get_plugin_info(&mut self) -> Result<PluginInfo> {
        match self.call(PluginRequest::GetPluginInfo).await? {
            PluginResponse::PluginInfo(info) => Ok(info),
            response => Err(unexpected(PluginRequest::GetPluginInfo, response)),
        }
    }

    /// Remaining capacity of the storage pool, in bytes.
    pub async fn get_capacity(&mut self) -> Result<u64> {
        match self.call(PluginRequest::GetCapacity).await? {
            PluginResponse::Capacity { available_capacity } => Ok(available_capacity),
            response => Err(unexpected(PluginRequest::GetCapacity, response)),
        }
    }

    pub async fn list_volumes(&mut self) -> Result<Vec<Volume>> {
        match self.call(PluginRequest::ListVolumes).await? {
            PluginResponse::Volumes { volumes } => Ok(volumes),
            response => Err(unexpected(PluginRequest::ListVolumes, response)),
        }
    }
}

fn unexpected(request: PluginRequest, response: PluginResponse) -> ClientError {
    ClientError::UnexpectedResponse {
        request: request.name(),
        response,
    }
}
