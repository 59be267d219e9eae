//! Structural validation of resource provider configs.
//!
//! Runs before any side effect; a config that passes can be stored and its
//! plugin containers laid out on disk.

use std::collections::HashSet;

use thiserror::Error;

use super::info::{ResourceProviderInfo, ReservationType, Service};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} must not be empty")]
    MissingField(&'static str),

    #[error("invalid {field} '{value}': only alphanumeric, underscore, hyphen, and period allowed")]
    InvalidName { field: &'static str, value: String },

    #[error("storage plugin is required")]
    MissingPlugin,

    #[error("plugin must have at least one container")]
    NoContainers,

    #[error("container {0} does not declare any service")]
    NoServices(usize),

    #[error("container {0} declares an unknown service")]
    UnknownService(usize),

    #[error("service {0} is served by more than one container")]
    DuplicateService(&'static str),

    #[error("container {0} has no command")]
    MissingCommand(usize),

    #[error("reservation {0} has no role or an unknown type")]
    InvalidReservation(usize),
}

pub type Result<T> = std::result::Result<T, ValidationError>;

/// Names end up as path components and file names.
fn validate_name(field: &'static str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    if name.contains("..")
        || !name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(ValidationError::InvalidName {
            field,
            value: name.to_string(),
        });
    }
    Ok(())
}

pub fn validate(info: &ResourceProviderInfo) -> Result<()> {
    validate_name("type", &info.r#type)?;
    validate_name("name", &info.name)?;

    for (index, reservation) in info.default_reservations.iter().enumerate() {
        let known = matches!(
            ReservationType::try_from(reservation.r#type),
            Ok(ReservationType::Static | ReservationType::Dynamic)
        );
        if !known || reservation.role.is_empty() {
            return Err(ValidationError::InvalidReservation(index));
        }
    }

    let plugin = info.plugin().ok_or(ValidationError::MissingPlugin)?;
    validate_name("plugin type", &plugin.r#type)?;
    validate_name("plugin name", &plugin.name)?;

    if plugin.containers.is_empty() {
        return Err(ValidationError::NoContainers);
    }

    let mut served = HashSet::new();
    for (index, container) in plugin.containers.iter().enumerate() {
        if container.services.is_empty() {
            return Err(ValidationError::NoServices(index));
        }
        for &value in &container.services {
            let service = match Service::try_from(value) {
                Ok(Service::Unknown) | Err(_) => {
                    return Err(ValidationError::UnknownService(index));
                }
                Ok(service) => service,
            };
            if !served.insert(service) {
                return Err(ValidationError::DuplicateService(service.as_str_name()));
            }
        }

        match &container.command {
            Some(command) if !command.value.is_empty() => {}
            _ => return Err(ValidationError::MissingCommand(index)),
        }
    }

    Ok(())
}
