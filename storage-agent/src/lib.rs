//! Storage resource provider agent
//!
//! Turns storage exposed by CSI plugins into agent resources at runtime:
//! - `provider`: resource provider configs, their validation and durable store
//! - `plugin`: plugin container lifecycle and resource discovery
//! - `manager`: the agent's advertised resource set
//! - `master`: in-process offer bookkeeping fed by agent updates
//! - `api`: control calls over HTTP in protobuf or JSON
//! - `metrics`: Prometheus metrics collection

#[macro_use]
mod macros;

pub mod agent;
pub mod api;
pub mod config;
pub mod manager;
pub mod master;
pub mod metrics;
pub mod plugin;
pub mod provider;
pub mod resources;

pub use agent::{Agent, AgentError};
pub use api::{ApiError, ApiServer, Call, ConfigApi, ContentType};
pub use config::{AgentCapability, AgentConfig, Isolation};
pub use master::{MasterHandle, OfferEvent, spawn_master};
pub use provider::{ProviderKey, ResourceProviderInfo};
pub use resources::{Resource, Resources};
