//! Agent assembly: config store, provider manager, control API and the
//! link to the master.

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use crate::api::{ApiServer, ConfigApi};
use crate::config::AgentConfig;
use crate::manager::{ManagerError, ManagerHandle, spawn_manager};
use crate::master::MasterHandle;
use crate::plugin::LifecycleError;
use crate::provider::{ConfigStore, StoreError};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to open resource provider config store: {0}")]
    Store(#[from] StoreError),

    #[error("failed to recover plugin containers: {0}")]
    Recovery(#[from] LifecycleError),

    #[error("resource provider manager stopped: {0}")]
    Manager(#[from] ManagerError),
}

pub struct Agent {
    api: ConfigApi,
    manager: ManagerHandle,
    health_checker: Option<JoinHandle<()>>,
}

impl Agent {
    /// Open the config store, register with `master`, then relaunch every
    /// stored provider.
    ///
    /// A store that holds an unreadable or duplicate config fails startup.
    /// Providers whose plugin fails to launch start out degraded.
    #[instrument(skip_all, fields(agent_id = %config.agent_id))]
    pub async fn start(config: AgentConfig, master: MasterHandle) -> Result<Self, AgentError> {
        let store = ConfigStore::open(&config.config_dir)?;
        info!(
            dir = %config.config_dir.display(),
            count = store.list().len(),
            "Opened resource provider config store"
        );

        let manager = spawn_manager(config.agent_id.clone(), config.default_resources.clone());
        manager.register(master).await?;

        let health_check_interval = config.health_check_interval;
        let api = ConfigApi::new(config, store, manager.clone());
        let active = api.recover().await?;
        info!(active, "Recovered resource providers");

        let health_checker = health_check_interval.map(|interval| api.spawn_health_checker(interval));

        Ok(Self {
            api,
            manager,
            health_checker,
        })
    }

    pub fn api(&self) -> &ConfigApi {
        &self.api
    }

    pub fn manager(&self) -> &ManagerHandle {
        &self.manager
    }

    /// HTTP front end for the control API.
    pub fn server(&self) -> ApiServer {
        ApiServer::new(self.api.clone())
    }

    /// Stop every plugin container. Configs stay on disk.
    pub async fn shutdown(mut self) {
        if let Some(checker) = self.health_checker.take() {
            checker.abort();
        }
        self.api.shutdown().await;
        info!("Agent stopped");
    }
}
