//! Endpoint server loop for plugin implementations.

use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::protocol::{PluginRequest, PluginResponse};

/// Implemented by plugins to answer endpoint requests.
pub trait PluginService: Send + Sync + 'static {
    fn handle(&self, request: PluginRequest) -> PluginResponse;
}

/// Bind a listener on `socket`, replacing a stale socket file if present.
pub fn bind(socket: &Path) -> io::Result<UnixListener> {
    match std::fs::remove_file(socket) {
        Ok(()) => debug!(socket = %socket.display(), "Removed stale socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    UnixListener::bind(socket)
}

/// Accept connections until `shutdown` resolves. Each connection is served on
/// its own task.
pub async fn serve<S, F>(listener: UnixListener, service: Arc<S>, shutdown: F) -> io::Result<()>
where
    S: PluginService,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Plugin endpoint shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, service).await {
                        warn!(error = %e, "Plugin connection failed");
                    }
                });
            }
        }
    }
}

async fn serve_connection<S: PluginService>(stream: UnixStream, service: Arc<S>) -> io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<PluginRequest>(&line) {
            Ok(request) => {
                debug!(method = request.name(), "Handling plugin request");
                service.handle(request)
            }
            Err(e) => PluginResponse::Error {
                message: format!("malformed request: {}", e),
            },
        };

        let mut out = serde_json::to_vec(&response).map_err(io::Error::other)?;
        out.push(b'\n');
        write.write_all(&out).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientError, PluginClient};
    use crate::protocol::{PluginInfo, Volume};
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    struct FixedPlugin;

    impl PluginService for FixedPlugin {
        fn handle(&self, request: PluginRequest) -> PluginResponse {
            match request {
                PluginRequest::Probe => PluginResponse::Probe { ready: true },
                PluginRequest::GetPluginInfo => PluginResponse::PluginInfo(PluginInfo {
                    name: "fixed".to_string(),
                    vendor_version: "1".to_string(),
                }),
                PluginRequest::GetCapacity => PluginResponse::Error {
                    message: "no pool".to_string(),
                },
                PluginRequest::ListVolumes => PluginResponse::Volumes {
                    volumes: vec![Volume {
                        id: "volume1".to_string(),
                        capacity: 4096,
                    }],
                },
            }
        }
    }

    #[tokio::test]
    async fn test_client_server_exchange() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("endpoint.sock");
        let listener = bind(&socket).unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, Arc::new(FixedPlugin), async {
            let _ = stop_rx.await;
        }));

        let mut client = PluginClient::connect(&socket).await.unwrap();
        assert!(client.probe().await.unwrap());
        assert_eq!(client.get_plugin_info().await.unwrap().name, "fixed");
        assert_eq!(client.list_volumes().await.unwrap().len(), 1);
        match client.get_capacity().await {
            Err(ClientError::Plugin(message)) => assert_eq!(message, "no pool"),
            other => panic!("expected plugin error, got {:?}", other),
        }

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_malformed_request_gets_error_response() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("endpoint.sock");
        let listener = bind(&socket).unwrap();
        tokio::spawn(serve(listener, Arc::new(FixedPlugin), std::future::pending()));

        let stream = UnixStream::connect(&socket).await.unwrap();
        let (read, mut write) = stream.into_split();
        write.write_all(b"{\"method\":\"format_disk\"}\n").await.unwrap();

        let mut lines = BufReader::new(read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let response: PluginResponse = serde_json::from_str(&line).unwrap();
        assert!(matches!(response, PluginResponse::Error { .. }));
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("endpoint.sock");
        std::fs::write(&socket, "stale").unwrap();
        assert!(bind(&socket).is_ok());
    }
}
