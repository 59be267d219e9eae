//! Agent control API for resource provider configs.

pub mod call;
pub mod codec;
pub mod error;
pub mod http;
pub mod service;

pub use call::{Call, CallType, ConfigCall, ProviderStatus, Response};
pub use codec::ContentType;
pub use error::ApiError;
pub use http::{API_PATH, ApiServer, HEALTH_PATH};
pub use service::{ConfigApi, HealthReport, ProviderHealth};
