//! Plugin container lifecycle.
//!
//! [`LifecycleManager`] holds no per-provider state. Each provider's
//! containers live in a [`PluginSet`] owned by whoever serializes work for
//! that provider, so starting and stopping never needs a shared lock.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use csi_plugin::paths;
use nix::sys::signal::Signal;
use tracing::{debug, error, info, instrument, warn};

use super::container::{
    ContainerSpec, ContainerState, ContainerStatus, PluginProcess, signal_group,
};
use super::error::Result;
use crate::metrics;
use crate::provider::{CsiPluginInfo, ProviderKey, Service};

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Root of the CSI path registry.
    pub csi_root: PathBuf,
    /// Where real endpoint directories are created.
    pub endpoint_tmp_dir: PathBuf,
    pub ready_timeout: Duration,
    pub stop_timeout: Duration,
}

#[derive(Debug)]
struct ManagedContainer {
    spec: ContainerSpec,
    state: ContainerState,
    process: Option<PluginProcess>,
    error: Option<String>,
}

impl ManagedContainer {
    fn new(spec: ContainerSpec) -> Self {
        Self {
            spec,
            state: ContainerState::Stopped,
            process: None,
            error: None,
        }
    }

    fn transition(&mut self, state: ContainerState) {
        debug!(
            container_id = %self.spec.id,
            from = ?self.state,
            to = ?state,
            "Plugin container state change"
        );
        self.state = state;
    }

    fn status(&self) -> ContainerStatus {
        ContainerStatus {
            container_id: self.spec.id.clone(),
            services: self.spec.service_names(),
            state: self.state,
            pid: self.process.as_ref().and_then(|p| p.pid()),
            error: self.error.clone(),
        }
    }
}

/// The containers of one provider's plugin, keyed by container id.
#[derive(Debug, Default)]
pub struct PluginSet {
    containers: BTreeMap<String, ManagedContainer>,
}

impl PluginSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    pub fn statuses(&self) -> Vec<ContainerStatus> {
        self.containers.values().map(ManagedContainer::status).collect()
    }

    /// Whether any container, running or not, is meant to serve `service`.
    pub fn declares(&self, service: Service) -> bool {
        self.containers.values().any(|c| c.spec.serves(service))
    }

    /// Endpoint socket of a running container serving `service`.
    pub fn endpoint_for(&self, service: Service) -> Option<&Path> {
        self.containers
            .values()
            .filter(|c| c.state == ContainerState::Running && c.spec.serves(service))
            .find_map(|c| c.process.as_ref().map(|p| p.socket()))
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleManager {
    config: Arc<LifecycleConfig>,
}

impl LifecycleManager {
    pub fn new(config: LifecycleConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Bring `set` in line with `plugin`.
    ///
    /// Running containers whose spec is unchanged are kept. Everything else is
    /// stopped first, then the missing containers are started. All containers
    /// are attempted; the first start failure is returned and the failed
    /// containers stay in the set as `Failed`.
    #[instrument(skip(self, set, plugin), fields(key = %key))]
    pub async fn apply(
        &self,
        key: &ProviderKey,
        set: &mut PluginSet,
        plugin: &CsiPluginInfo,
    ) -> Result<()> {
        let desired = ContainerSpec::from_plugin(key, plugin);
        let desired_by_id: HashMap<&str, &ContainerSpec> =
            desired.iter().map(|s| (s.id.as_str(), s)).collect();

        let stale: Vec<String> = set
            .containers
            .iter()
            .filter(|(id, c)| {
                desired_by_id.get(id.as_str()) != Some(&&c.spec)
                    || c.state != ContainerState::Running
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            if let Some(container) = set.containers.remove(&id) {
                self.stop_container(container).await;
            }
        }

        let mut first_error = None;
        for spec in desired {
            if set.containers.contains_key(&spec.id) {
                debug!(container_id = %spec.id, "Reusing running plugin container");
                continue;
            }

            let id = spec.id.clone();
            let mut container = ManagedContainer::new(spec);
            container.transition(ContainerState::Starting);

            match self.start_container(&container.spec).await {
                Ok(process) => {
                    container.process = Some(process);
                    container.transition(ContainerState::Running);
                    metrics::record_plugin_launch("success");
                }
                Err(e) => {
                    error!(container_id = %id, error = %e, "Failed to start plugin container");
                    container.error = Some(e.to_string());
                    container.transition(ContainerState::Failed);
                    metrics::record_plugin_launch("failure");
                    first_error.get_or_insert(e);
                }
            }
            set.containers.insert(id, container);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop every container in `set` and remove its registry entries.
    #[instrument(skip(self, set))]
    pub async fn stop_all(&self, set: &mut PluginSet) {
        let containers = std::mem::take(&mut set.containers);
        for (_, container) in containers {
            self.stop_container(container).await;
        }
    }

    /// Mark containers whose process exited on its own as `Failed`. Returns
    /// the ids of newly failed containers.
    pub fn check(&self, set: &mut PluginSet) -> Vec<String> {
        let mut failed = Vec::new();
        for (id, container) in set.containers.iter_mut() {
            if container.state != ContainerState::Running {
                continue;
            }
            let Some(status) = container.process.as_mut().and_then(|p| p.exited()) else {
                continue;
            };

            warn!(container_id = %id, %status, "Plugin container exited unexpectedly");
            metrics::record_plugin_exit();
            container.process = None;
            container.error = Some(format!("exited: {}", status));
            container.transition(ContainerState::Failed);
            if let Err(e) = paths::remove_container(
                &self.config.csi_root,
                &container.spec.plugin_type,
                &container.spec.plugin_name,
                &container.spec.id,
            ) {
                warn!(container_id = %id, error = %e, "Failed to clean up container paths");
            }
            failed.push(id.clone());
        }
        failed
    }

    /// Tear down every container found under the CSI root: kill the recorded
    /// process group and remove the registry entries. Used at startup, when
    /// no container can be owned by this process yet.
    #[instrument(skip(self))]
    pub fn cleanup_orphans(&self) -> Result<usize> {
        let root = &self.config.csi_root;
        let mut removed = 0;

        for path in paths::list_container_paths(root, "*", "*")? {
            let container = match paths::parse_container_path(root, &path) {
                Ok(container) => container,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring foreign path");
                    continue;
                }
            };

            let endpoint = paths::resolve_endpoint_dir(
                root,
                &container.plugin_type,
                &container.plugin_name,
                &container.container_id,
            )
            .ok()
            .flatten();
            debug!(container = %container, endpoint = ?endpoint, "Found orphaned plugin container");

            match paths::read_pid(
                root,
                &container.plugin_type,
                &container.plugin_name,
                &container.container_id,
            ) {
                Ok(Some(pid)) => {
                    info!(container = %container, pid, "Killing orphaned plugin container");
                    signal_group(pid, Signal::SIGKILL);
                }
                Ok(None) => {}
                Err(e) => warn!(container = %container, error = %e, "Unreadable pid file"),
            }

            paths::remove_container(
                root,
                &container.plugin_type,
                &container.plugin_name,
                &container.container_id,
            )?;
            removed += 1;
        }

        if removed > 0 {
            info!(count = removed, "Removed orphaned plugin containers");
        }
        Ok(removed)
    }

    async fn start_container(&self, spec: &ContainerSpec) -> Result<PluginProcess> {
        let spawned = PluginProcess::spawn(
            &self.config.csi_root,
            &self.config.endpoint_tmp_dir,
            spec,
        );
        let mut process = match spawned {
            Ok(process) => process,
            Err(e) => {
                self.remove_paths(spec);
                return Err(e);
            }
        };

        if let Err(e) = process.wait_ready(self.config.ready_timeout).await {
            if let Err(stop_err) = process.terminate(self.config.stop_timeout).await {
                warn!(container_id = %spec.id, error = %stop_err, "Failed to stop plugin container");
            }
            self.remove_paths(spec);
            return Err(e);
        }

        info!(container_id = %spec.id, "Plugin container is running");
        Ok(process)
    }

    async fn stop_container(&self, mut container: ManagedContainer) {
        container.transition(ContainerState::Stopping);
        if let Some(process) = container.process.take() {
            if let Err(e) = process.terminate(self.config.stop_timeout).await {
                warn!(container_id = %container.spec.id, error = %e, "Failed to stop plugin container");
            }
        }
        self.remove_paths(&container.spec);
        container.transition(ContainerState::Stopped);
        info!(container_id = %container.spec.id, "Plugin container stopped");
    }

    fn remove_paths(&self, spec: &ContainerSpec) {
        if let Err(e) = paths::remove_container(
            &self.config.csi_root,
            &spec.plugin_type,
            &spec.plugin_name,
            &spec.id,
        ) {
            warn!(container_id = %spec.id, error = %e, "Failed to clean up container paths");
        }
    }
}
