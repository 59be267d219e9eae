//! Resource provider config API.
//!
//! Every provider identity gets its own worker task. Calls for one identity
//! queue up behind each other on that worker; calls for different identities
//! run concurrently. A worker owns its provider's plugin containers, so no
//! lock is held across a store mutation or a plugin launch. A worker that
//! holds no provider and has nothing queued deregisters and exits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::call::{
    CallType, ConfigCall, GetResourceProviders, ProviderStatus, ResourceProvider, Response,
};
use super::error::ApiError;
use crate::config::{AgentCapability, AgentConfig};
use crate::manager::{ManagerHandle, ProviderState};
use crate::metrics::{self, OperationTimer};
use crate::plugin::{
    ContainerState, ContainerStatus, LifecycleError, LifecycleManager, PluginSet,
    discover_resources,
};
use crate::provider::{self, ConfigStore, ProviderKey, ResourceProviderInfo, ValidationError};
use crate::resources::Resources;

/// Health of one provider as last reported by its worker.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    #[serde(rename = "type")]
    pub provider_type: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(flatten)]
    pub state: ProviderState,
    pub containers: Vec<ContainerStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub agent_id: String,
    pub isolation: String,
    pub capabilities: Vec<String>,
    pub total_resources: Resources,
    pub providers: Vec<ProviderHealth>,
}

type Reply<T> = oneshot::Sender<Result<T, ApiError>>;

enum Job {
    Add {
        info: ResourceProviderInfo,
        reply: Reply<()>,
    },
    Update {
        info: ResourceProviderInfo,
        reply: Reply<()>,
    },
    Remove {
        reply: Reply<()>,
    },
    /// Launch a stored config without touching the store.
    Launch {
        info: ResourceProviderInfo,
        reply: Reply<()>,
    },
    CheckHealth {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct Inner {
    config: AgentConfig,
    store: ConfigStore,
    lifecycle: LifecycleManager,
    manager: ManagerHandle,
    workers: Mutex<HashMap<ProviderKey, mpsc::UnboundedSender<Job>>>,
    health: Mutex<HashMap<ProviderKey, ProviderHealth>>,
    shutting_down: AtomicBool,
}

impl Inner {
    fn workers(&self) -> MutexGuard<'_, HashMap<ProviderKey, mpsc::UnboundedSender<Job>>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn health(&self) -> MutexGuard<'_, HashMap<ProviderKey, ProviderHealth>> {
        self.health.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone)]
pub struct ConfigApi {
    inner: Arc<Inner>,
}

impl ConfigApi {
    pub fn new(config: AgentConfig, store: ConfigStore, manager: ManagerHandle) -> Self {
        let lifecycle = LifecycleManager::new(config.lifecycle());
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                lifecycle,
                manager,
                workers: Mutex::new(HashMap::new()),
                health: Mutex::new(HashMap::new()),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &ConfigStore {
        &self.inner.store
    }

    /// Tear down plugin containers left behind by a previous agent, then
    /// launch every stored config. Returns how many providers became active.
    ///
    /// Launch failures leave the provider degraded and are only logged.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize, LifecycleError> {
        self.inner.lifecycle.cleanup_orphans()?;

        let configs = self.inner.store.list();
        info!(count = configs.len(), "Launching stored resource providers");

        let mut pending = Vec::with_capacity(configs.len());
        for info in configs {
            let key = info.key();
            let (reply, rx) = oneshot::channel();
            if self.send(&key, Job::Launch { info, reply }).is_ok() {
                pending.push((key, rx));
            }
        }

        let mut launched = 0;
        for (key, rx) in pending {
            match rx.await {
                Ok(Ok(())) => launched += 1,
                Ok(Err(e)) => warn!(key = %key, error = %e, "Resource provider is degraded"),
                Err(_) => warn!(key = %key, "Resource provider worker stopped"),
            }
        }

        self.refresh_gauges();
        Ok(launched)
    }

    /// Execute a control call. Returns a response body for read calls.
    #[instrument(skip(self, call), fields(call = call.name()))]
    pub async fn call(&self, call: ConfigCall) -> Result<Option<Response>, ApiError> {
        let timer = OperationTimer::new(call.name());

        let result = match call {
            ConfigCall::Add(info) => self.add(info).await.map(|_| None),
            ConfigCall::Update(info) => self.update(info).await.map(|_| None),
            ConfigCall::Remove(key) => self.remove(key).await.map(|_| None),
            ConfigCall::GetResourceProviders => self.get_resource_providers().await.map(Some),
        };

        match &result {
            Ok(_) => timer.success(),
            Err(e) => {
                match e {
                    ApiError::Store(_) | ApiError::PluginLaunch { .. } => {
                        error!(error = %e, "Control call failed")
                    }
                    _ => info!(error = %e, "Control call rejected"),
                }
                timer.failure(e.code());
            }
        }
        self.refresh_gauges();
        result
    }

    pub async fn add(&self, info: ResourceProviderInfo) -> Result<(), ApiError> {
        self.check_mutation(&info)?;
        let key = info.key();
        self.dispatch(&key, |reply| Job::Add { info, reply }).await?
    }

    pub async fn update(&self, info: ResourceProviderInfo) -> Result<(), ApiError> {
        self.check_mutation(&info)?;
        let key = info.key();
        self.dispatch(&key, |reply| Job::Update { info, reply }).await?
    }

    pub async fn remove(&self, key: ProviderKey) -> Result<(), ApiError> {
        self.check_running()?;
        self.check_capability()?;
        self.dispatch(&key, |reply| Job::Remove { reply }).await?
    }

    /// Every stored config with its current state and resources.
    pub async fn get_resource_providers(&self) -> Result<Response, ApiError> {
        let snapshot = self
            .inner
            .manager
            .snapshot()
            .await
            .map_err(|_| ApiError::Unavailable)?;
        let mut entries: HashMap<ProviderKey, _> = snapshot
            .providers
            .into_iter()
            .map(|entry| (entry.key.clone(), entry))
            .collect();

        let resource_providers = self
            .inner
            .store
            .list()
            .into_iter()
            .map(|info| {
                let entry = entries.remove(&info.key());
                let (state, reason) = match entry.as_ref().map(|e| &e.state) {
                    Some(ProviderState::Active) => (ProviderStatus::Active, None),
                    Some(ProviderState::Degraded { reason }) => {
                        (ProviderStatus::Degraded, Some(reason.clone()))
                    }
                    None => (ProviderStatus::Unknown, None),
                };
                ResourceProvider {
                    resource_provider_info: Some(info),
                    total_resources: entry
                        .as_ref()
                        .map(|e| e.resources.as_slice().to_vec())
                        .unwrap_or_default(),
                    provider_id: entry.map(|e| e.provider_id).unwrap_or_default(),
                    state: state as i32,
                    reason,
                }
            })
            .collect();

        Ok(Response {
            r#type: CallType::GetResourceProviders as i32,
            get_resource_providers: Some(GetResourceProviders { resource_providers }),
        })
    }

    /// Agent, provider and plugin container health. Never waits on workers.
    pub async fn health(&self) -> HealthReport {
        let total_resources = match self.inner.manager.snapshot().await {
            Ok(snapshot) => snapshot.total,
            Err(_) => Resources::new(),
        };
        let mut providers: Vec<ProviderHealth> = self.inner.health().values().cloned().collect();
        providers.sort_by(|a, b| (&a.provider_type, &a.name).cmp(&(&b.provider_type, &b.name)));

        let mut capabilities: Vec<String> = self
            .inner
            .config
            .capabilities
            .iter()
            .map(|c| c.to_string())
            .collect();
        capabilities.sort();

        HealthReport {
            agent_id: self.inner.config.agent_id.clone(),
            isolation: self.inner.config.isolation.to_string(),
            capabilities,
            total_resources,
            providers,
        }
    }

    /// Ask every worker to look for plugin containers that exited.
    pub async fn check_health(&self) {
        let senders: Vec<_> = self.inner.workers().values().cloned().collect();
        let mut pending = Vec::with_capacity(senders.len());
        for tx in senders {
            let (reply, rx) = oneshot::channel();
            if tx.send(Job::CheckHealth { reply }).is_ok() {
                pending.push(rx);
            }
        }
        for rx in pending {
            let _ = rx.await;
        }
        self.refresh_gauges();
    }

    /// Run `check_health` every `interval` until the API shuts down.
    pub fn spawn_health_checker(&self, interval: Duration) -> JoinHandle<()> {
        let api = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if api.inner.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                api.check_health().await;
            }
        })
    }

    /// Stop accepting calls and stop every plugin container. Stored configs
    /// are kept and relaunched on the next start.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);

        let senders: Vec<_> = self.inner.workers().drain().map(|(_, tx)| tx).collect();
        let mut pending = Vec::with_capacity(senders.len());
        for tx in senders {
            let (reply, rx) = oneshot::channel();
            if tx.send(Job::Shutdown { reply }).is_ok() {
                pending.push(rx);
            }
        }
        for rx in pending {
            let _ = rx.await;
        }
        info!("Resource provider config API stopped");
    }

    fn check_running(&self) -> Result<(), ApiError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(ApiError::Unavailable);
        }
        Ok(())
    }

    fn check_capability(&self) -> Result<(), ApiError> {
        if !self
            .inner
            .config
            .has_capability(AgentCapability::ResourceProvider)
        {
            return Err(ApiError::CapabilityMissing);
        }
        Ok(())
    }

    fn check_mutation(&self, info: &ResourceProviderInfo) -> Result<(), ApiError> {
        self.check_running()?;
        provider::validate(info)?;
        self.check_capability()
    }

    async fn dispatch<T>(
        &self,
        key: &ProviderKey,
        job: impl FnOnce(Reply<T>) -> Job,
    ) -> Result<Result<T, ApiError>, ApiError> {
        let (reply, rx) = oneshot::channel();
        self.send(key, job(reply))?;
        rx.await.map_err(|_| ApiError::Unavailable)
    }

    /// Queue `job` on the worker for `key`, starting one if needed.
    ///
    /// The send happens under the workers lock, which a retiring worker
    /// also takes before it checks its queue.
    fn send(&self, key: &ProviderKey, job: Job) -> Result<(), ApiError> {
        let mut workers = self.inner.workers();
        let tx = match workers.get(key).filter(|tx| !tx.is_closed()) {
            Some(tx) => tx.clone(),
            None => {
                debug!(key = %key, "Starting resource provider worker");
                let (tx, rx) = mpsc::unbounded_channel();
                let worker = Worker {
                    key: key.clone(),
                    inner: Arc::clone(&self.inner),
                    provider_id: None,
                    state: None,
                    plugins: PluginSet::new(),
                };
                tokio::spawn(worker.run(rx));
                workers.insert(key.clone(), tx.clone());
                tx
            }
        };
        tx.send(job).map_err(|_| ApiError::Unavailable)
    }

    fn refresh_gauges(&self) {
        let health = self.inner.health();
        let active = health.values().filter(|p| p.state.is_active()).count();
        metrics::set_providers_count("active", active);
        metrics::set_providers_count("degraded", health.len() - active);

        let containers: Vec<ContainerState> = health
            .values()
            .flat_map(|p| p.containers.iter().map(|c| c.state))
            .collect();
        for (state, label) in [
            (ContainerState::Running, "running"),
            (ContainerState::Failed, "failed"),
        ] {
            let count = containers.iter().filter(|&&s| s == state).count();
            metrics::set_plugin_containers_count(label, count);
        }
    }
}

/// Serializes all work for one provider identity.
struct Worker {
    key: ProviderKey,
    inner: Arc<Inner>,
    /// Assigned on first launch, kept across updates.
    provider_id: Option<String>,
    state: Option<ProviderState>,
    plugins: PluginSet,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = rx.recv().await {
            let done = match job {
                Job::Add { info, reply } => {
                    let result = self.add(info).await;
                    self.finish(&rx, reply, result)
                }
                Job::Update { info, reply } => {
                    let result = self.update(info).await;
                    self.finish(&rx, reply, result)
                }
                Job::Remove { reply } => {
                    let result = self.remove().await;
                    self.finish(&rx, reply, result)
                }
                Job::Launch { info, reply } => {
                    let result = self.launch(&info).await;
                    self.finish(&rx, reply, result)
                }
                Job::CheckHealth { reply } => {
                    self.check_health().await;
                    self.finish(&rx, reply, ())
                }
                Job::Shutdown { reply } => {
                    self.inner.lifecycle.stop_all(&mut self.plugins).await;
                    self.publish_health();
                    let _ = reply.send(());
                    true
                }
            };
            if done {
                break;
            }
        }
        debug!(key = %self.key, "Resource provider worker stopped");
    }

    /// Retire if idle, then reply. Returns true when the worker retired, so
    /// a caller that sees the reply also sees the deregistration.
    fn finish<T>(
        &self,
        rx: &mpsc::UnboundedReceiver<Job>,
        reply: oneshot::Sender<T>,
        value: T,
    ) -> bool {
        let retired = self.retire_if_idle(rx);
        let _ = reply.send(value);
        retired
    }

    /// Deregister when no provider is held and nothing is queued.
    fn retire_if_idle(&self, rx: &mpsc::UnboundedReceiver<Job>) -> bool {
        if self.state.is_some() || !self.plugins.is_empty() {
            return false;
        }
        let mut workers = self.inner.workers();
        if !rx.is_empty() {
            return false;
        }
        workers.remove(&self.key);
        true
    }

    #[instrument(skip(self, info), fields(key = %self.key))]
    async fn add(&mut self, info: ResourceProviderInfo) -> Result<(), ApiError> {
        let path = self.inner.store.create(&info)?;
        info!(path = %path.display(), "Added resource provider config");
        self.launch(&info).await
    }

    #[instrument(skip(self, info), fields(key = %self.key))]
    async fn update(&mut self, info: ResourceProviderInfo) -> Result<(), ApiError> {
        let path = self.inner.store.replace(&info)?;
        info!(path = %path.display(), "Updated resource provider config");
        self.launch(&info).await
    }

    #[instrument(skip(self), fields(key = %self.key))]
    async fn remove(&mut self) -> Result<(), ApiError> {
        self.inner.store.delete(&self.key)?;

        self.inner.lifecycle.stop_all(&mut self.plugins).await;
        self.inner
            .manager
            .remove_provider(self.key.clone())
            .await
            .map_err(|_| ApiError::Unavailable)?;

        self.provider_id = None;
        self.state = None;
        self.inner.health().remove(&self.key);
        info!("Removed resource provider config");
        Ok(())
    }

    /// Bring the plugin in line with `info`, rediscover resources and hand
    /// them to the manager. On failure the provider is degraded.
    async fn launch(&mut self, info: &ResourceProviderInfo) -> Result<(), ApiError> {
        let provider_id = self
            .provider_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        let plugin = info.plugin().ok_or(ValidationError::MissingPlugin)?;
        let lifecycle = &self.inner.lifecycle;

        let discovered = match lifecycle.apply(&self.key, &mut self.plugins, plugin).await {
            Ok(()) => {
                discover_resources(
                    &self.plugins,
                    info,
                    &provider_id,
                    lifecycle.config().ready_timeout,
                )
                .await
            }
            Err(e) => Err(e),
        };

        let (state, resources, result) = match discovered {
            Ok(resources) => (ProviderState::Active, resources, Ok(())),
            Err(source) => {
                error!(key = %self.key, error = %source, "Resource provider degraded");
                (
                    ProviderState::Degraded {
                        reason: source.to_string(),
                    },
                    Resources::new(),
                    Err(ApiError::PluginLaunch {
                        key: self.key.clone(),
                        source,
                    }),
                )
            }
        };

        self.inner
            .manager
            .set_provider(self.key.clone(), provider_id, state.clone(), resources)
            .await
            .map_err(|_| ApiError::Unavailable)?;
        self.state = Some(state);
        self.publish_health();
        result
    }

    async fn check_health(&mut self) {
        let failed = self.inner.lifecycle.check(&mut self.plugins);
        if failed.is_empty() || !self.state.as_ref().is_some_and(ProviderState::is_active) {
            self.publish_health();
            return;
        }

        let state = ProviderState::Degraded {
            reason: format!("plugin container(s) exited: {}", failed.join(", ")),
        };
        warn!(key = %self.key, containers = ?failed, "Withdrawing resources of failed provider");

        if let Some(provider_id) = self.provider_id.clone() {
            if let Err(e) = self
                .inner
                .manager
                .set_provider(self.key.clone(), provider_id, state.clone(), Resources::new())
                .await
            {
                warn!(key = %self.key, error = %e, "Failed to degrade provider");
            }
        }
        self.state = Some(state);
        self.publish_health();
    }

    fn publish_health(&self) {
        let Some(state) = self.state.clone() else {
            return;
        };
        let report = ProviderHealth {
            provider_type: self.key.provider_type.clone(),
            name: self.key.name.clone(),
            provider_id: self.provider_id.clone(),
            state,
            containers: self.plugins.statuses(),
        };
        self.inner.health().insert(self.key.clone(), report);
    }
}
