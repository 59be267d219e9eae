//! Resource discovery through a provider's controller service.

use std::time::Duration;

use csi_plugin::{Bytes, PluginClient};
use tokio::time::timeout;
use tracing::{debug, instrument};

use super::error::{LifecycleError, Result};
use super::manager::PluginSet;
use crate::provider::{ResourceProviderInfo, Service};
use crate::resources::{Resource, Resources, UNRESERVED_ROLE};

pub const DISK_RESOURCE: &str = "disk";

/// Profile of the storage pool resource.
pub const DEFAULT_PROFILE: &str = "default";

/// Ask the running controller service what the provider offers: one disk
/// resource per pre-existing volume plus one for the remaining pool capacity.
///
/// A plugin without a controller service has nothing to discover.
#[instrument(skip(set, info), fields(key = %info.key()))]
pub async fn discover_resources(
    set: &PluginSet,
    info: &ResourceProviderInfo,
    provider_id: &str,
    limit: Duration,
) -> Result<Resources> {
    if !set.declares(Service::ControllerService) {
        debug!("Plugin has no controller service, no resources discovered");
        return Ok(Resources::new());
    }

    let socket = set
        .endpoint_for(Service::ControllerService)
        .ok_or(LifecycleError::NoEndpoint(Service::ControllerService.as_str_name()))?;

    let query = async {
        let mut client = PluginClient::connect(socket).await?;
        let plugin = client.get_plugin_info().await?;
        let volumes = client.list_volumes().await?;
        let capacity = client.get_capacity().await?;
        debug!(
            plugin = %plugin.name,
            version = %plugin.vendor_version,
            volumes = volumes.len(),
            capacity,
            "Queried plugin"
        );
        Ok::<_, LifecycleError>((volumes, capacity))
    };
    let (volumes, capacity) = timeout(limit, query)
        .await
        .map_err(|_| LifecycleError::DiscoveryTimeout(limit))??;

    let role = info.reservation_role();
    let tag = |resource: Resource| {
        let resource = resource.with_provider_id(provider_id);
        if role == UNRESERVED_ROLE {
            resource
        } else {
            resource.with_role(role)
        }
    };

    let mut resources = Resources::new();
    for volume in volumes {
        let megabytes = Bytes::new(volume.capacity).megabytes();
        resources.add(tag(Resource::new(DISK_RESOURCE, megabytes).with_volume_id(volume.id)));
    }
    if capacity > 0 {
        let megabytes = Bytes::new(capacity).megabytes();
        resources.add(tag(
            Resource::new(DISK_RESOURCE, megabytes).with_profile(DEFAULT_PROFILE),
        ));
    }

    debug!(resources = %resources, "Discovered provider resources");
    Ok(resources)
}
