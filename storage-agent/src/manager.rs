//! Resource provider manager.
//!
//! Owns the agent's advertised resource set: the agent's own resources plus
//! those of every active provider. Each change is followed by a full-set
//! update to the master; the master never sees deltas.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::master::MasterHandle;
use crate::provider::ProviderKey;
use crate::resources::Resources;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("resource provider manager is not running")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderState {
    Active,
    Degraded { reason: String },
}

impl ProviderState {
    pub fn is_active(&self) -> bool {
        matches!(self, ProviderState::Active)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProviderState::Active => "active",
            ProviderState::Degraded { .. } => "degraded",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderEntry {
    pub key: ProviderKey,
    pub provider_id: String,
    #[serde(flatten)]
    pub state: ProviderState,
    /// Empty unless active.
    pub resources: Resources,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerSnapshot {
    pub agent_id: String,
    pub total: Resources,
    pub providers: Vec<ProviderEntry>,
}

#[derive(Debug)]
enum ManagerCommand {
    SetProvider {
        entry: ProviderEntry,
        reply: oneshot::Sender<()>,
    },
    RemoveProvider {
        key: ProviderKey,
        reply: oneshot::Sender<Option<ProviderEntry>>,
    },
    Register {
        master: MasterHandle,
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<ManagerSnapshot>,
    },
}

struct Manager {
    agent_id: String,
    default_resources: Resources,
    providers: BTreeMap<ProviderKey, ProviderEntry>,
    master: Option<MasterHandle>,
}

impl Manager {
    fn total(&self) -> Resources {
        self.providers
            .values()
            .filter(|p| p.state.is_active())
            .fold(self.default_resources.clone(), |acc, p| acc.plus(&p.resources))
    }

    fn snapshot(&self) -> ManagerSnapshot {
        ManagerSnapshot {
            agent_id: self.agent_id.clone(),
            total: self.total(),
            providers: self.providers.values().cloned().collect(),
        }
    }

    fn notify_master(&self) {
        let Some(master) = &self.master else {
            debug!("No master link, skipping resource update");
            return;
        };
        let total = self.total();
        debug!(resources = %total, "Sending agent resources to master");
        if let Err(e) = master.update_agent_resources(&self.agent_id, total) {
            warn!(error = %e, "Failed to update agent resources on master");
        }
    }

    fn handle(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::SetProvider { mut entry, reply } => {
                if !entry.state.is_active() {
                    entry.resources = Resources::new();
                }
                info!(
                    key = %entry.key,
                    provider_id = %entry.provider_id,
                    state = entry.state.label(),
                    resources = %entry.resources,
                    "Resource provider updated"
                );
                self.providers.insert(entry.key.clone(), entry);
                self.notify_master();
                let _ = reply.send(());
            }
            ManagerCommand::RemoveProvider { key, reply } => {
                let removed = self.providers.remove(&key);
                if removed.is_some() {
                    info!(key = %key, "Resource provider removed");
                    self.notify_master();
                }
                let _ = reply.send(removed);
            }
            ManagerCommand::Register { master, reply } => {
                let total = self.total();
                info!(agent_id = %self.agent_id, resources = %total, "Registering with master");
                if let Err(e) = master.register_agent(&self.agent_id, total) {
                    warn!(error = %e, "Failed to register with master");
                }
                self.master = Some(master);
                let _ = reply.send(());
            }
            ManagerCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerHandle {
    tx: mpsc::UnboundedSender<ManagerCommand>,
}

/// Start the manager actor. It stops when every handle is dropped.
pub fn spawn_manager(agent_id: impl Into<String>, default_resources: Resources) -> ManagerHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut manager = Manager {
        agent_id: agent_id.into(),
        default_resources,
        providers: BTreeMap::new(),
        master: None,
    };

    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            manager.handle(command);
        }
        debug!("Resource provider manager stopped");
    });

    ManagerHandle { tx }
}

impl ManagerHandle {
    /// Record a provider's state and resources. Degraded providers contribute
    /// nothing.
    pub async fn set_provider(
        &self,
        key: ProviderKey,
        provider_id: String,
        state: ProviderState,
        resources: Resources,
    ) -> Result<(), ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.send(ManagerCommand::SetProvider {
            entry: ProviderEntry {
                key,
                provider_id,
                state,
                resources,
            },
            reply,
        })?;
        rx.await.map_err(|_| ManagerError::Closed)
    }

    pub async fn remove_provider(
        &self,
        key: ProviderKey,
    ) -> Result<Option<ProviderEntry>, ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.send(ManagerCommand::RemoveProvider { key, reply })?;
        rx.await.map_err(|_| ManagerError::Closed)
    }

    /// Link to a master and register with the full resource set. Calling it
    /// again re-registers, which heals any lost update.
    pub async fn register(&self, master: MasterHandle) -> Result<(), ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.send(ManagerCommand::Register { master, reply })?;
        rx.await.map_err(|_| ManagerError::Closed)
    }

    pub async fn snapshot(&self) -> Result<ManagerSnapshot, ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.send(ManagerCommand::Snapshot { reply })?;
        rx.await.map_err(|_| ManagerError::Closed)
    }

    fn send(&self, command: ManagerCommand) -> Result<(), ManagerError> {
        self.tx.send(command).map_err(|_| ManagerError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::{OfferEvent, spawn_master};
    use crate::resources::Resource;

    fn key() -> ProviderKey {
        ProviderKey::new("org.apache.mesos.rp.local.storage", "test")
    }

    fn volume(mb: f64) -> Resources {
        vec![
            Resource::new("disk", mb)
                .with_role("storage")
                .with_provider_id("rp-1")
                .with_volume_id("volume1"),
        ]
        .into()
    }

    #[tokio::test]
    async fn test_total_tracks_active_providers() {
        let base: Resources = "cpus:2".parse().unwrap();
        let manager = spawn_manager("agent-1", base.clone());

        manager
            .set_provider(key(), "rp-1".to_string(), ProviderState::Active, volume(4096.0))
            .await
            .unwrap();
        assert_eq!(manager.snapshot().await.unwrap().total, base.plus(&volume(4096.0)));

        manager
            .set_provider(
                key(),
                "rp-1".to_string(),
                ProviderState::Degraded {
                    reason: "plugin exited".to_string(),
                },
                volume(4096.0),
            )
            .await
            .unwrap();
        let snapshot = manager.snapshot().await.unwrap();
        assert_eq!(snapshot.total, base);
        assert!(snapshot.providers[0].resources.is_empty());

        assert!(manager.remove_provider(key()).await.unwrap().is_some());
        assert!(manager.remove_provider(key()).await.unwrap().is_none());
        assert!(manager.snapshot().await.unwrap().providers.is_empty());
    }

    #[tokio::test]
    async fn test_changes_reach_master() {
        let base: Resources = "cpus:2".parse().unwrap();
        let manager = spawn_manager("agent-1", base.clone());
        let master = spawn_master();
        let mut events = master.subscribe();

        manager.register(master.clone()).await.unwrap();
        let first = match events.recv().await.unwrap() {
            OfferEvent::Offered(offer) => offer,
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(first.resources, base);

        manager
            .set_provider(key(), "rp-1".to_string(), ProviderState::Active, volume(4096.0))
            .await
            .unwrap();
        match events.recv().await.unwrap() {
            OfferEvent::Offered(offer) => assert_eq!(offer.resources, volume(4096.0)),
            other => panic!("unexpected event {:?}", other),
        }

        manager.remove_provider(key()).await.unwrap();
        match events.recv().await.unwrap() {
            OfferEvent::Rescinded { agent_id, .. } => assert_eq!(agent_id, "agent-1"),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(master.agent_resources("agent-1").await.unwrap(), Some(base));
    }
}
