//! A single plugin container: its identity, its process and its endpoint.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use csi_plugin::paths;
use csi_plugin::protocol::{ENDPOINT_ENV, endpoint_url};
use csi_plugin::PluginClient;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use super::error::{LifecycleError, Result};
use crate::provider::{CommandInfo, CsiPluginContainerInfo, CsiPluginInfo, ProviderKey, Service};

/// Interval between readiness probes.
const PROBE_INTERVAL: Duration = Duration::from_millis(50);

const STDOUT_FILE: &str = "stdout";
const STDERR_FILE: &str = "stderr";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

/// Externally visible state of one container.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerStatus {
    pub container_id: String,
    pub services: Vec<&'static str>,
    pub state: ContainerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What to run for one container of a plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub plugin_type: String,
    pub plugin_name: String,
    pub id: String,
    pub services: Vec<Service>,
    pub command: CommandInfo,
}

impl ContainerSpec {
    /// Specs for every container of `plugin`, in config order.
    pub fn from_plugin(key: &ProviderKey, plugin: &CsiPluginInfo) -> Vec<ContainerSpec> {
        plugin
            .containers
            .iter()
            .map(|container| ContainerSpec {
                plugin_type: plugin.r#type.clone(),
                plugin_name: plugin.name.clone(),
                id: container_id(key, plugin, container),
                services: container
                    .services
                    .iter()
                    .filter_map(|&s| Service::try_from(s).ok())
                    .collect(),
                command: container.command.clone().unwrap_or_default(),
            })
            .collect()
    }

    pub fn serves(&self, service: Service) -> bool {
        self.services.contains(&service)
    }

    pub fn service_names(&self) -> Vec<&'static str> {
        self.services.iter().map(|s| s.as_str_name()).collect()
    }
}

/// Deterministic, path-safe container id:
/// `<sanitized provider name>--<SERVICES>--<8 hex digits>`.
///
/// The digest covers the provider identity, the plugin identity, the
/// services and the command, so any change to where the container is
/// registered or how it runs yields a new id.
pub fn container_id(
    key: &ProviderKey,
    plugin: &CsiPluginInfo,
    container: &CsiPluginContainerInfo,
) -> String {
    let sanitized: String = key
        .name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();

    let services: Vec<&str> = container
        .services
        .iter()
        .map(|&s| {
            Service::try_from(s)
                .map(|s| s.as_str_name())
                .unwrap_or("UNKNOWN")
        })
        .collect();

    let mut hasher = Sha256::new();
    for part in [
        key.provider_type.as_str(),
        key.name.as_str(),
        plugin.r#type.as_str(),
        plugin.name.as_str(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    for service in &services {
        hasher.update(service.as_bytes());
        hasher.update([0u8]);
    }
    if let Some(command) = &container.command {
        hasher.update([u8::from(command.shell())]);
        hasher.update(command.value.as_bytes());
        hasher.update([0u8]);
        for argument in &command.arguments {
            hasher.update(argument.as_bytes());
            hasher.update([0u8]);
        }
    }
    let digest = hasher.finalize();

    format!(
        "{}--{}--{}",
        sanitized,
        services.join("-"),
        hex::encode(&digest[..4])
    )
}

/// A spawned plugin process with its endpoint.
#[derive(Debug)]
pub struct PluginProcess {
    container_id: String,
    child: Child,
    pid: Option<u32>,
    socket: PathBuf,
}

impl PluginProcess {
    /// Lay out the container directory and endpoint, then spawn the command.
    ///
    /// The process leads its own process group so that a shell wrapper and
    /// the plugin it starts are signalled together.
    pub fn spawn(csi_root: &Path, tmp_base: &Path, spec: &ContainerSpec) -> Result<Self> {
        let endpoint_dir = paths::prepare_endpoint_dir(
            csi_root,
            &spec.plugin_type,
            &spec.plugin_name,
            &spec.id,
            tmp_base,
        )?;
        let socket = paths::endpoint_socket_path(&endpoint_dir);
        let container_dir =
            paths::container_path(csi_root, &spec.plugin_type, &spec.plugin_name, &spec.id)?;

        let stdout = File::create(container_dir.join(STDOUT_FILE))?;
        let stderr = File::create(container_dir.join(STDERR_FILE))?;

        let mut command = if spec.command.shell() {
            let mut command = Command::new("sh");
            command.arg("-c").arg(&spec.command.value);
            command
        } else {
            let mut command = Command::new(&spec.command.value);
            if let Some((argv0, rest)) = spec.command.arguments.split_first() {
                command.arg0(argv0).args(rest);
            }
            command
        };

        command
            .env(ENDPOINT_ENV, endpoint_url(&socket))
            .current_dir(&container_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .kill_on_drop(true);

        let child = command.spawn().map_err(|source| LifecycleError::Spawn {
            container_id: spec.id.clone(),
            source,
        })?;
        let pid = child.id();

        if let Some(pid) = pid {
            paths::write_pid(csi_root, &spec.plugin_type, &spec.plugin_name, &spec.id, pid)?;
        }

        info!(
            container_id = %spec.id,
            pid = ?pid,
            endpoint = %socket.display(),
            "Spawned plugin container"
        );

        Ok(Self {
            container_id: spec.id.clone(),
            child,
            pid,
            socket,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Exit status if the process has exited.
    pub fn exited(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("unknown ({})", e)),
        }
    }

    /// Probe the endpoint until the plugin reports ready.
    pub async fn wait_ready(&mut self, ready_timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + ready_timeout;

        loop {
            if let Some(status) = self.exited() {
                return Err(LifecycleError::ExitedDuringStartup {
                    container_id: self.container_id.clone(),
                    status,
                });
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(LifecycleError::ReadyTimeout(
                    self.container_id.clone(),
                    ready_timeout,
                ));
            }

            match timeout(remaining, probe(&self.socket)).await {
                Ok(Ok(true)) => {
                    debug!(container_id = %self.container_id, "Plugin container is ready");
                    return Ok(());
                }
                Ok(Ok(false)) => debug!(container_id = %self.container_id, "Plugin not ready yet"),
                Ok(Err(e)) => debug!(container_id = %self.container_id, error = %e, "Probe failed"),
                Err(_) => {}
            }

            sleep(PROBE_INTERVAL).await;
        }
    }

    /// SIGTERM the process group, wait up to `stop_timeout`, then SIGKILL.
    pub async fn terminate(mut self, stop_timeout: Duration) -> Result<()> {
        if self.exited().is_some() {
            return Ok(());
        }

        if let Some(pid) = self.pid {
            signal_group(pid, Signal::SIGTERM);
        }

        match timeout(stop_timeout, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!(container_id = %self.container_id, %status, "Plugin container exited");
            }
            Err(_) => {
                warn!(
                    container_id = %self.container_id,
                    timeout = ?stop_timeout,
                    "Plugin container did not exit after SIGTERM, sending SIGKILL"
                );
                if let Some(pid) = self.pid {
                    signal_group(pid, Signal::SIGKILL);
                }
                self.child.kill().await?;
            }
        }

        Ok(())
    }
}

async fn probe(socket: &Path) -> std::result::Result<bool, csi_plugin::ClientError> {
    let mut client = PluginClient::connect(socket).await?;
    client.probe().await
}

/// Send `signal` to the process group led by `pid`. A group that is already
/// gone is not an error.
pub fn signal_group(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, ?signal, error = %e, "Failed to signal plugin process group"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::info::tests::storage_provider;
    use tempfile::TempDir;

    fn first_container_id(info: &crate::provider::ResourceProviderInfo) -> String {
        let plugin = info.plugin().unwrap();
        container_id(&info.key(), plugin, &plugin.containers[0])
    }

    #[test]
    fn test_container_id_format() {
        let info = storage_provider("test", "/bin/plugin", "volume1:4GB");
        let id = first_container_id(&info);

        let parts: Vec<&str> = id.split("--").collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "test");
        assert_eq!(parts[1], "CONTROLLER_SERVICE-NODE_SERVICE");
        assert_eq!(parts[2].len(), 8);
        assert!(!id.contains('/'));
    }

    #[test]
    fn test_container_id_tracks_command() {
        let info = storage_provider("test", "/bin/plugin", "volume1:4GB");
        let same = storage_provider("test", "/bin/plugin", "volume1:4GB");
        let changed = storage_provider("test", "/bin/plugin", "volume1:2GB");

        let id = first_container_id(&info);
        assert_eq!(id, first_container_id(&same));
        assert_ne!(id, first_container_id(&changed));
    }

    #[test]
    fn test_container_id_tracks_plugin_identity() {
        let info = storage_provider("test", "/bin/plugin", "volume1:4GB");
        let mut renamed = info.clone();
        renamed.storage.as_mut().unwrap().plugin.as_mut().unwrap().name = "new_plugin".to_string();
        let mut retyped = info.clone();
        retyped.storage.as_mut().unwrap().plugin.as_mut().unwrap().r#type =
            "org.example.other".to_string();

        let id = first_container_id(&info);
        assert_ne!(id, first_container_id(&renamed));
        assert_ne!(id, first_container_id(&retyped));
    }

    #[tokio::test]
    async fn test_spawn_shell_command_and_terminate() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("csi");
        let tmp = temp.path().join("tmp");
        let spec = ContainerSpec {
            plugin_type: "org.example.csi".to_string(),
            plugin_name: "sleepy".to_string(),
            id: "sleepy--CONTROLLER_SERVICE--00000000".to_string(),
            services: vec![Service::ControllerService],
            command: CommandInfo {
                shell: Some(true),
                value: "echo \"$CSI_ENDPOINT\" > endpoint.txt; exec sleep 30".to_string(),
                arguments: vec![],
            },
        };

        let mut process = PluginProcess::spawn(&root, &tmp, &spec).unwrap();
        let pid = process.pid().unwrap();
        assert_eq!(
            paths::read_pid(&root, &spec.plugin_type, &spec.plugin_name, &spec.id).unwrap(),
            Some(pid)
        );

        // Nothing listens on the endpoint, so readiness times out.
        let err = process.wait_ready(Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, LifecycleError::ReadyTimeout(..)));

        let container_dir =
            paths::container_path(&root, &spec.plugin_type, &spec.plugin_name, &spec.id).unwrap();
        let endpoint = std::fs::read_to_string(container_dir.join("endpoint.txt")).unwrap();
        assert!(endpoint.trim().starts_with("unix://"));
        assert!(endpoint.trim().ends_with("/endpoint.sock"));

        process.terminate(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_during_startup() {
        let temp = TempDir::new().unwrap();
        let spec = ContainerSpec {
            plugin_type: "org.example.csi".to_string(),
            plugin_name: "broken".to_string(),
            id: "broken--NODE_SERVICE--00000000".to_string(),
            services: vec![Service::NodeService],
            command: CommandInfo {
                shell: Some(true),
                value: "exit 3".to_string(),
                arguments: vec![],
            },
        };

        let mut process =
            PluginProcess::spawn(&temp.path().join("csi"), &temp.path().join("tmp"), &spec).unwrap();
        let err = process.wait_ready(Duration::from_secs(10)).await.unwrap_err();
        assert!(matches!(err, LifecycleError::ExitedDuringStartup { .. }));
    }
}
