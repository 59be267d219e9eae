//! In-process master: keeps each agent's advertised resources and the offers
//! made from them, rescinding offers that the agent can no longer back.
//!
//! Runs as an actor. Agents talk to it through a [`MasterHandle`]; observers
//! (schedulers, tests, the agent binary's log) subscribe to [`OfferEvent`]s.

pub mod offers;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info};

pub use offers::{MasterState, Offer, OfferEvent};

use crate::metrics;
use crate::resources::Resources;

/// Capacity of the offer event channel. Slow subscribers lag, they do not
/// block the master.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum MasterError {
    #[error("master is not running")]
    Closed,
}

#[derive(Debug)]
enum MasterCommand {
    RegisterAgent {
        agent_id: String,
        resources: Resources,
    },
    UpdateAgentResources {
        agent_id: String,
        resources: Resources,
    },
    Accept {
        offer_id: String,
        reply: oneshot::Sender<Option<Offer>>,
    },
    Decline {
        offer_id: String,
        reply: oneshot::Sender<bool>,
    },
    Rescind {
        offer_id: String,
        reply: oneshot::Sender<bool>,
    },
    Offers {
        reply: oneshot::Sender<Vec<Offer>>,
    },
    AgentResources {
        agent_id: String,
        reply: oneshot::Sender<Option<Resources>>,
    },
}

#[derive(Debug, Clone)]
pub struct MasterHandle {
    tx: mpsc::UnboundedSender<MasterCommand>,
    events: broadcast::Sender<OfferEvent>,
}

/// Start the master actor. It stops when every handle is dropped.
pub fn spawn_master() -> MasterHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    tokio::spawn(run(rx, events.clone()));
    MasterHandle { tx, events }
}

async fn run(mut rx: mpsc::UnboundedReceiver<MasterCommand>, events: broadcast::Sender<OfferEvent>) {
    let mut state = MasterState::new();
    let publish = |event: OfferEvent| {
        match &event {
            OfferEvent::Offered(_) => metrics::record_offer_made(),
            OfferEvent::Rescinded { .. } => metrics::record_offers_rescinded(1),
        }
        // No subscribers is fine.
        let _ = events.send(event);
    };

    while let Some(command) = rx.recv().await {
        match command {
            MasterCommand::RegisterAgent {
                agent_id,
                resources,
            } => {
                info!(agent_id = %agent_id, "Agent registered");
                state.update_agent(&agent_id, resources).into_iter().for_each(&publish);
            }
            MasterCommand::UpdateAgentResources {
                agent_id,
                resources,
            } => {
                state.update_agent(&agent_id, resources).into_iter().for_each(&publish);
            }
            MasterCommand::Accept { offer_id, reply } => {
                let _ = reply.send(state.accept(&offer_id));
            }
            MasterCommand::Decline { offer_id, reply } => {
                let _ = reply.send(state.decline(&offer_id));
            }
            MasterCommand::Rescind { offer_id, reply } => {
                let event = state.rescind(&offer_id);
                let rescinded = event.is_some();
                event.into_iter().for_each(&publish);
                let _ = reply.send(rescinded);
            }
            MasterCommand::Offers { reply } => {
                let _ = reply.send(state.offers());
            }
            MasterCommand::AgentResources { agent_id, reply } => {
                let _ = reply.send(state.agent_total(&agent_id).cloned());
            }
        }
    }

    debug!("Master stopped");
}

impl MasterHandle {
    /// Register (or re-register) an agent with its full resource set.
    pub fn register_agent(&self, agent_id: &str, resources: Resources) -> Result<(), MasterError> {
        self.send(MasterCommand::RegisterAgent {
            agent_id: agent_id.to_string(),
            resources,
        })
    }

    /// Replace an agent's full resource set.
    pub fn update_agent_resources(
        &self,
        agent_id: &str,
        resources: Resources,
    ) -> Result<(), MasterError> {
        self.send(MasterCommand::UpdateAgentResources {
            agent_id: agent_id.to_string(),
            resources,
        })
    }

    pub async fn accept(&self, offer_id: &str) -> Result<Option<Offer>, MasterError> {
        let (reply, rx) = oneshot::channel();
        self.send(MasterCommand::Accept {
            offer_id: offer_id.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| MasterError::Closed)
    }

    pub async fn decline(&self, offer_id: &str) -> Result<bool, MasterError> {
        let (reply, rx) = oneshot::channel();
        self.send(MasterCommand::Decline {
            offer_id: offer_id.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| MasterError::Closed)
    }

    pub async fn rescind(&self, offer_id: &str) -> Result<bool, MasterError> {
        let (reply, rx) = oneshot::channel();
        self.send(MasterCommand::Rescind {
            offer_id: offer_id.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| MasterError::Closed)
    }

    /// Outstanding offers.
    pub async fn offers(&self) -> Result<Vec<Offer>, MasterError> {
        let (reply, rx) = oneshot::channel();
        self.send(MasterCommand::Offers { reply })?;
        rx.await.map_err(|_| MasterError::Closed)
    }

    pub async fn agent_resources(&self, agent_id: &str) -> Result<Option<Resources>, MasterError> {
        let (reply, rx) = oneshot::channel();
        self.send(MasterCommand::AgentResources {
            agent_id: agent_id.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| MasterError::Closed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OfferEvent> {
        self.events.subscribe()
    }

    fn send(&self, command: MasterCommand) -> Result<(), MasterError> {
        self.tx.send(command).map_err(|_| MasterError::Closed)
    }
}
