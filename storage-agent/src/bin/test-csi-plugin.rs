//! Fake CSI plugin serving a fixed set of volumes and a fixed pool capacity.
//!
//! Launched by the agent as a plugin container in tests and local runs.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use csi_plugin::protocol::parse_endpoint;
use csi_plugin::{Bytes, PluginInfo, PluginRequest, PluginResponse, PluginService, Volume};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "test-csi-plugin")]
#[command(about = "CSI plugin with preconfigured volumes, for testing")]
struct Args {
    /// Endpoint to serve on (unix://<path>)
    #[arg(long, env = "CSI_ENDPOINT")]
    endpoint: String,

    /// Capacity of the storage pool, e.g. 8GB
    #[arg(long = "available_capacity", default_value = "0B")]
    available_capacity: Bytes,

    /// Pre-existing volumes, e.g. "volume1:4GB;volume2:2GB"
    #[arg(long, default_value = "")]
    volumes: String,

    /// Directory in which a directory per volume is created
    #[arg(long = "work_dir")]
    work_dir: Option<PathBuf>,

    /// Plugin name reported by GetPluginInfo
    #[arg(long, default_value = "org.apache.mesos.csi.test")]
    name: String,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn parse_volumes(spec: &str) -> Result<Vec<Volume>, String> {
    spec.split(';')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|volume| {
            let (id, capacity) = volume
                .split_once(':')
                .ok_or_else(|| format!("invalid volume '{}': expected <id>:<size>", volume))?;
            let capacity: Bytes = capacity.parse().map_err(|e| format!("{}", e))?;
            Ok(Volume {
                id: id.trim().to_string(),
                capacity: capacity.bytes(),
            })
        })
        .collect()
}

struct TestPlugin {
    info: PluginInfo,
    available_capacity: Bytes,
    volumes: Vec<Volume>,
}

impl PluginService for TestPlugin {
    fn handle(&self, request: PluginRequest) -> PluginResponse {
        match request {
            PluginRequest::Probe => PluginResponse::Probe { ready: true },
            PluginRequest::GetPluginInfo => PluginResponse::PluginInfo(self.info.clone()),
            PluginRequest::GetCapacity => PluginResponse::Capacity {
                available_capacity: self.available_capacity.bytes(),
            },
            PluginRequest::ListVolumes => PluginResponse::Volumes {
                volumes: self.volumes.clone(),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let socket = parse_endpoint(&args.endpoint)
        .ok_or_else(|| format!("Invalid endpoint '{}'", args.endpoint))?;
    let volumes = parse_volumes(&args.volumes)?;

    if let Some(work_dir) = &args.work_dir {
        for volume in &volumes {
            std::fs::create_dir_all(work_dir.join(&volume.id))?;
        }
    }

    let plugin = TestPlugin {
        info: PluginInfo {
            name: args.name.clone(),
            vendor_version: env!("CARGO_PKG_VERSION").to_string(),
        },
        available_capacity: args.available_capacity,
        volumes,
    };

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let listener = csi_plugin::server::bind(&socket)?;
    info!(
        endpoint = %socket.display(),
        volumes = plugin.volumes.len(),
        capacity = %plugin.available_capacity,
        "Test CSI plugin serving"
    );

    csi_plugin::server::serve(listener, Arc::new(plugin), async {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    })
    .await?;

    let _ = std::fs::remove_file(&socket);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_volumes() {
        let volumes = parse_volumes("volume1:4GB; volume2:512MB;").unwrap();
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[0].id, "volume1");
        assert_eq!(volumes[0].capacity, 4 * 1024 * 1024 * 1024u64);
        assert_eq!(volumes[1].capacity, 512 * 1024 * 1024);

        assert!(parse_volumes("").unwrap().is_empty());
        assert!(parse_volumes("volume1").is_err());
        assert!(parse_volumes("volume1:lots").is_err());
    }
}
