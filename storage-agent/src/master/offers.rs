//! Offer bookkeeping of the master.
//!
//! Pure state: every method returns the events it caused, the actor in
//! `master` publishes them.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::resources::Resources;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Offer {
    pub id: String,
    pub agent_id: String,
    pub resources: Resources,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OfferEvent {
    Offered(Offer),
    Rescinded { offer_id: String, agent_id: String },
}

#[derive(Debug, Default)]
struct AgentEntry {
    total: Resources,
    /// Resources of accepted offers.
    used: Resources,
}

#[derive(Debug, Default)]
pub struct MasterState {
    agents: BTreeMap<String, AgentEntry>,
    offers: BTreeMap<String, Offer>,
}

impl MasterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the agent's total resources.
    ///
    /// Outstanding offers on the agent that no longer fit are rescinded, then
    /// whatever is neither used nor offered is offered as one new offer.
    ///
    /// Fit is cumulative: offers are kept in id order while they fit, together
    /// with used resources and the offers kept before them, into the new
    /// total. An offer that fits on its own can still be rescinded.
    pub fn update_agent(&mut self, agent_id: &str, total: Resources) -> Vec<OfferEvent> {
        let entry = self.agents.entry(agent_id.to_string()).or_default();
        info!(agent_id, resources = %total, "Agent resources updated");

        // Accepted resources that disappeared from the agent are gone for good.
        entry.used = entry
            .used
            .iter()
            .filter(|r| total.contains(&Resources::from(vec![(*r).clone()])))
            .cloned()
            .collect();
        entry.total = total;

        let mut remaining = entry.total.minus(&entry.used);
        let mut stale = Vec::new();
        for offer in self.offers.values().filter(|o| o.agent_id == agent_id) {
            if remaining.contains(&offer.resources) {
                remaining = remaining.minus(&offer.resources);
            } else {
                stale.push(offer.id.clone());
            }
        }

        let mut events: Vec<OfferEvent> = stale
            .iter()
            .filter_map(|offer_id| self.rescind(offer_id))
            .collect();
        events.extend(self.allocate(agent_id));
        events
    }

    /// Offer the agent's unused, unoffered resources, if any.
    pub fn allocate(&mut self, agent_id: &str) -> Option<OfferEvent> {
        let entry = self.agents.get(agent_id)?;
        let offered = self
            .offers
            .values()
            .filter(|o| o.agent_id == agent_id)
            .fold(Resources::new(), |acc, o| acc.plus(&o.resources));
        let available = entry.total.minus(&entry.used).minus(&offered);
        if available.is_empty() {
            return None;
        }

        let offer = Offer {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            resources: available,
        };
        info!(offer_id = %offer.id, agent_id, resources = %offer.resources, "Offering resources");
        self.offers.insert(offer.id.clone(), offer.clone());
        Some(OfferEvent::Offered(offer))
    }

    /// Withdraw an outstanding offer. Unknown ids are ignored.
    pub fn rescind(&mut self, offer_id: &str) -> Option<OfferEvent> {
        let offer = self.offers.remove(offer_id)?;
        info!(offer_id, agent_id = %offer.agent_id, "Rescinding offer");
        Some(OfferEvent::Rescinded {
            offer_id: offer.id,
            agent_id: offer.agent_id,
        })
    }

    /// Consume an offer; its resources become used. Unknown ids are ignored.
    pub fn accept(&mut self, offer_id: &str) -> Option<Offer> {
        let offer = self.offers.remove(offer_id)?;
        if let Some(entry) = self.agents.get_mut(&offer.agent_id) {
            entry.used = entry.used.plus(&offer.resources);
        }
        debug!(offer_id, "Offer accepted");
        Some(offer)
    }

    /// Drop an offer without using it. The resources are offered again on
    /// the agent's next allocation pass.
    pub fn decline(&mut self, offer_id: &str) -> bool {
        let declined = self.offers.remove(offer_id).is_some();
        if declined {
            debug!(offer_id, "Offer declined");
        }
        declined
    }

    pub fn offers(&self) -> Vec<Offer> {
        self.offers.values().cloned().collect()
    }

    pub fn agent_total(&self, agent_id: &str) -> Option<&Resources> {
        self.agents.get(agent_id).map(|e| &e.total)
    }
}
