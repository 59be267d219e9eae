//! Resource provider configuration model.
//!
//! These messages are carried by control calls in protobuf form and stored in
//! the config directory as JSON. Enumerations are `i32` on the prost side and
//! their upper-case names in JSON.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::resources::UNRESERVED_ROLE;

/// Provider type of storage resource providers.
pub const STORAGE_PROVIDER_TYPE: &str = "org.apache.mesos.rp.local.storage";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ReservationType {
    Unknown = 0,
    Static = 1,
    Dynamic = 2,
}

impl ReservationType {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            ReservationType::Unknown => "UNKNOWN",
            ReservationType::Static => "STATIC",
            ReservationType::Dynamic => "DYNAMIC",
        }
    }

    pub fn from_str_name(value: &str) -> Option<Self> {
        match value {
            "UNKNOWN" => Some(Self::Unknown),
            "STATIC" => Some(Self::Static),
            "DYNAMIC" => Some(Self::Dynamic),
            _ => None,
        }
    }
}

enum_name_serde!(reservation_type, ReservationType);

/// Service roles a plugin container can serve.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Service {
    Unknown = 0,
    ControllerService = 1,
    NodeService = 2,
}

impl Service {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            Service::Unknown => "UNKNOWN",
            Service::ControllerService => "CONTROLLER_SERVICE",
            Service::NodeService => "NODE_SERVICE",
        }
    }

    pub fn from_str_name(value: &str) -> Option<Self> {
        match value {
            "UNKNOWN" => Some(Self::Unknown),
            "CONTROLLER_SERVICE" => Some(Self::ControllerService),
            "NODE_SERVICE" => Some(Self::NodeService),
            _ => None,
        }
    }
}

enum_name_serde!(service, Service);

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservationInfo {
    #[prost(enumeration = "ReservationType", tag = "1")]
    #[serde(with = "reservation_type")]
    pub r#type: i32,
    #[prost(string, tag = "2")]
    pub role: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandInfo {
    /// Run `value` through `sh -c`.
    #[prost(bool, optional, tag = "1", default = "true")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<bool>,
    #[prost(string, tag = "2")]
    pub value: String,
    #[prost(string, repeated, tag = "3")]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct CsiPluginContainerInfo {
    #[prost(enumeration = "Service", repeated, packed = "false", tag = "1")]
    #[serde(with = "service::repeated")]
    pub services: Vec<i32>,
    #[prost(message, optional, tag = "2")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandInfo>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct CsiPluginInfo {
    #[prost(string, tag = "1")]
    pub r#type: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(message, repeated, tag = "3")]
    pub containers: Vec<CsiPluginContainerInfo>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageInfo {
    #[prost(message, optional, tag = "1")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin: Option<CsiPluginInfo>,
    /// Accepted for compatibility; not acted upon.
    #[prost(double, optional, tag = "2")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconciliation_interval_seconds: Option<f64>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceProviderInfo {
    #[prost(string, tag = "1")]
    pub r#type: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(message, repeated, tag = "3")]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub default_reservations: Vec<ReservationInfo>,
    #[prost(message, optional, tag = "4")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageInfo>,
}

impl ResourceProviderInfo {
    pub fn key(&self) -> ProviderKey {
        ProviderKey::new(&self.r#type, &self.name)
    }

    pub fn plugin(&self) -> Option<&CsiPluginInfo> {
        self.storage.as_ref().and_then(|s| s.plugin.as_ref())
    }

    /// Role of the provider's resources: the innermost (last) default
    /// reservation, or unreserved.
    pub fn reservation_role(&self) -> &str {
        self.default_reservations
            .last()
            .map(|r| r.role.as_str())
            .unwrap_or(UNRESERVED_ROLE)
    }
}

/// Identity of a resource provider: the (type, name) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderKey {
    pub provider_type: String,
    pub name: String,
}

impl ProviderKey {
    pub fn new(provider_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            provider_type: provider_type.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider_type, self.name)
    }
}
