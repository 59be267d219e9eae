//! Plugin containers: identity, processes, lifecycle and resource discovery.

pub mod container;
pub mod discovery;
pub mod error;
pub mod manager;

pub use container::{ContainerSpec, ContainerState, ContainerStatus, container_id};
pub use discovery::discover_resources;
pub use error::LifecycleError;
pub use manager::{LifecycleConfig, LifecycleManager, PluginSet};
