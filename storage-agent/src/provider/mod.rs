//! Resource provider configuration: model, validation and durable storage.

pub mod info;
pub mod store;
pub mod validator;

pub use info::{
    CommandInfo, CsiPluginContainerInfo, CsiPluginInfo, ProviderKey, ReservationInfo,
    ReservationType, ResourceProviderInfo, STORAGE_PROVIDER_TYPE, Service, StorageInfo,
};
pub use store::{ConfigStore, StoreError};
pub use validator::{ValidationError, validate};
