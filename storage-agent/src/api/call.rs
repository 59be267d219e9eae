//! Versioned control call and response messages.
//!
//! A [`Call`] carries its type and exactly one matching payload. The same
//! messages are accepted as protobuf and as JSON.

use serde::{Deserialize, Serialize};

use crate::provider::{ProviderKey, ResourceProviderInfo};
use crate::resources::Resource;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum CallType {
    Unknown = 0,
    AddResourceProviderConfig = 1,
    UpdateResourceProviderConfig = 2,
    RemoveResourceProviderConfig = 3,
    GetResourceProviders = 4,
}

impl CallType {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            CallType::Unknown => "UNKNOWN",
            CallType::AddResourceProviderConfig => "ADD_RESOURCE_PROVIDER_CONFIG",
            CallType::UpdateResourceProviderConfig => "UPDATE_RESOURCE_PROVIDER_CONFIG",
            CallType::RemoveResourceProviderConfig => "REMOVE_RESOURCE_PROVIDER_CONFIG",
            CallType::GetResourceProviders => "GET_RESOURCE_PROVIDERS",
        }
    }

    pub fn from_str_name(value: &str) -> Option<Self> {
        match value {
            "UNKNOWN" => Some(Self::Unknown),
            "ADD_RESOURCE_PROVIDER_CONFIG" => Some(Self::AddResourceProviderConfig),
            "UPDATE_RESOURCE_PROVIDER_CONFIG" => Some(Self::UpdateResourceProviderConfig),
            "REMOVE_RESOURCE_PROVIDER_CONFIG" => Some(Self::RemoveResourceProviderConfig),
            "GET_RESOURCE_PROVIDERS" => Some(Self::GetResourceProviders),
            _ => None,
        }
    }
}

enum_name_serde!(call_type, CallType);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ProviderStatus {
    Unknown = 0,
    Active = 1,
    Degraded = 2,
}

impl ProviderStatus {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            ProviderStatus::Unknown => "UNKNOWN",
            ProviderStatus::Active => "ACTIVE",
            ProviderStatus::Degraded => "DEGRADED",
        }
    }

    pub fn from_str_name(value: &str) -> Option<Self> {
        match value {
            "UNKNOWN" => Some(Self::Unknown),
            "ACTIVE" => Some(Self::Active),
            "DEGRADED" => Some(Self::Degraded),
            _ => None,
        }
    }
}

enum_name_serde!(provider_status, ProviderStatus);

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct AddResourceProviderConfig {
    #[prost(message, optional, tag = "1")]
    pub info: Option<ResourceProviderInfo>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateResourceProviderConfig {
    #[prost(message, optional, tag = "1")]
    pub info: Option<ResourceProviderInfo>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoveResourceProviderConfig {
    #[prost(string, tag = "1")]
    pub r#type: String,
    #[prost(string, tag = "2")]
    pub name: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Call {
    #[prost(enumeration = "CallType", tag = "1")]
    #[serde(with = "call_type")]
    pub r#type: i32,
    #[prost(message, optional, tag = "2")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub add_resource_provider_config: Option<AddResourceProviderConfig>,
    #[prost(message, optional, tag = "3")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_resource_provider_config: Option<UpdateResourceProviderConfig>,
    #[prost(message, optional, tag = "4")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove_resource_provider_config: Option<RemoveResourceProviderConfig>,
}

impl Call {
    pub fn add(info: ResourceProviderInfo) -> Self {
        Self {
            r#type: CallType::AddResourceProviderConfig as i32,
            add_resource_provider_config: Some(AddResourceProviderConfig { info: Some(info) }),
            ..Default::default()
        }
    }

    pub fn update(info: ResourceProviderInfo) -> Self {
        Self {
            r#type: CallType::UpdateResourceProviderConfig as i32,
            update_resource_provider_config: Some(UpdateResourceProviderConfig {
                info: Some(info),
            }),
            ..Default::default()
        }
    }

    pub fn remove(provider_type: &str, name: &str) -> Self {
        Self {
            r#type: CallType::RemoveResourceProviderConfig as i32,
            remove_resource_provider_config: Some(RemoveResourceProviderConfig {
                r#type: provider_type.to_string(),
                name: name.to_string(),
            }),
            ..Default::default()
        }
    }

    pub fn get_resource_providers() -> Self {
        Self {
            r#type: CallType::GetResourceProviders as i32,
            ..Default::default()
        }
    }
}

/// A call after its type and payload have been checked against each other.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigCall {
    Add(ResourceProviderInfo),
    Update(ResourceProviderInfo),
    Remove(ProviderKey),
    GetResourceProviders,
}

impl ConfigCall {
    /// Name used in logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            ConfigCall::Add(_) => "add_resource_provider_config",
            ConfigCall::Update(_) => "update_resource_provider_config",
            ConfigCall::Remove(_) => "remove_resource_provider_config",
            ConfigCall::GetResourceProviders => "get_resource_providers",
        }
    }
}

/// Why a decoded [`Call`] is not a usable [`ConfigCall`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("unknown call type {0}")]
    UnknownType(i32),

    #[error("call {0} is missing its '{1}' payload")]
    MissingPayload(&'static str, &'static str),
}

impl TryFrom<Call> for ConfigCall {
    type Error = CallError;

    fn try_from(call: Call) -> Result<Self, Self::Error> {
        let call_type = match CallType::try_from(call.r#type) {
            Ok(CallType::Unknown) | Err(_) => return Err(CallError::UnknownType(call.r#type)),
            Ok(call_type) => call_type,
        };
        let missing =
            |field: &'static str| CallError::MissingPayload(call_type.as_str_name(), field);

        match call_type {
            CallType::AddResourceProviderConfig => call
                .add_resource_provider_config
                .and_then(|p| p.info)
                .map(ConfigCall::Add)
                .ok_or_else(|| missing("add_resource_provider_config.info")),
            CallType::UpdateResourceProviderConfig => call
                .update_resource_provider_config
                .and_then(|p| p.info)
                .map(ConfigCall::Update)
                .ok_or_else(|| missing("update_resource_provider_config.info")),
            CallType::RemoveResourceProviderConfig => call
                .remove_resource_provider_config
                .map(|p| ConfigCall::Remove(ProviderKey::new(p.r#type, p.name)))
                .ok_or_else(|| missing("remove_resource_provider_config")),
            CallType::GetResourceProviders => Ok(ConfigCall::GetResourceProviders),
            CallType::Unknown => Err(CallError::UnknownType(call.r#type)),
        }
    }
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceProvider {
    #[prost(message, optional, tag = "1")]
    pub resource_provider_info: Option<ResourceProviderInfo>,
    #[prost(message, repeated, tag = "2")]
    pub total_resources: Vec<Resource>,
    #[prost(string, tag = "3")]
    pub provider_id: String,
    #[prost(enumeration = "ProviderStatus", tag = "4")]
    #[serde(with = "provider_status")]
    pub state: i32,
    #[prost(string, optional, tag = "5")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct GetResourceProviders {
    #[prost(message, repeated, tag = "1")]
    pub resource_providers: Vec<ResourceProvider>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Response {
    #[prost(enumeration = "CallType", tag = "1")]
    #[serde(with = "call_type")]
    pub r#type: i32,
    #[prost(message, optional, tag = "2")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub get_resource_providers: Option<GetResourceProviders>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::info::tests::storage_provider;

    #[test]
    fn test_call_json_shape() {
        let call = Call::remove("org.apache.mesos.rp.local.storage", "test");
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["type"], "REMOVE_RESOURCE_PROVIDER_CONFIG");
        assert_eq!(json["remove_resource_provider_config"]["name"], "test");
        assert!(json.get("add_resource_provider_config").is_none());
    }

    #[test]
    fn test_into_config_call() {
        let info = storage_provider("test", "/bin/plugin", "volume1:4GB");
        assert_eq!(
            ConfigCall::try_from(Call::add(info.clone())),
            Ok(ConfigCall::Add(info.clone()))
        );
        assert_eq!(
            ConfigCall::try_from(Call::update(info.clone())),
            Ok(ConfigCall::Update(info.clone()))
        );
        assert_eq!(
            ConfigCall::try_from(Call::remove("t", "n")),
            Ok(ConfigCall::Remove(ProviderKey::new("t", "n")))
        );
    }

    #[test]
    fn test_payload_must_match_type() {
        let info = storage_provider("test", "/bin/plugin", "volume1:4GB");
        let mut call = Call::add(info);
        call.r#type = CallType::UpdateResourceProviderConfig as i32;
        assert!(matches!(
            ConfigCall::try_from(call),
            Err(CallError::MissingPayload("UPDATE_RESOURCE_PROVIDER_CONFIG", _))
        ));

        assert_eq!(
            ConfigCall::try_from(Call::default()),
            Err(CallError::UnknownType(0))
        );
    }
}
