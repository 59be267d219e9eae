use hyper::StatusCode;
use thiserror::Error;

use crate::plugin::LifecycleError;
use crate::provider::{ProviderKey, StoreError, ValidationError};

use super::call::CallError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid call: {0}")]
    InvalidCall(#[from] CallError),

    #[error("invalid resource provider config: {0}")]
    Validation(#[from] ValidationError),

    #[error("resource provider config {0} already exists")]
    Conflict(ProviderKey),

    #[error("resource provider config {0} not found")]
    NotFound(ProviderKey),

    #[error("config store failure: {0}")]
    Store(StoreError),

    #[error("failed to launch plugin for {key}: {source}")]
    PluginLaunch {
        key: ProviderKey,
        source: LifecycleError,
    },

    #[error("agent does not have the RESOURCE_PROVIDER capability")]
    CapabilityMissing,

    #[error("agent is shutting down")]
    Unavailable,
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(key) => ApiError::Conflict(key),
            StoreError::NotFound(key) => ApiError::NotFound(key),
            other => ApiError::Store(other),
        }
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidCall(_) | ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Store(_) | ApiError::PluginLaunch { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::CapabilityMissing => StatusCode::FORBIDDEN,
            ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Status label for metrics.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidCall(_) => "invalid_call",
            ApiError::Validation(_) => "invalid_config",
            ApiError::Conflict(_) => "conflict",
            ApiError::NotFound(_) => "not_found",
            ApiError::Store(_) => "store_error",
            ApiError::PluginLaunch { .. } => "plugin_launch_error",
            ApiError::CapabilityMissing => "capability_missing",
            ApiError::Unavailable => "unavailable",
        }
    }
}
