//! Scalar resources advertised by an agent.
//!
//! A [`Resources`] value is a multiset: entries with the same identity (every
//! field except the scalar) are kept merged. Disk volumes, i.e. disk resources
//! carrying a `disk.id`, are indivisible.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Tolerance for scalar comparisons.
const EPSILON: f64 = 1e-6;

/// Role of resources that are not reserved.
pub const UNRESERVED_ROLE: &str = "*";

#[derive(Clone, PartialEq, Eq, Hash, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskInfo {
    /// Volume id for pre-existing volumes.
    #[prost(string, optional, tag = "1")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[prost(string, optional, tag = "2")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Resource {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(double, tag = "2")]
    pub scalar: f64,
    #[prost(string, optional, tag = "3")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[prost(string, optional, tag = "4")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[prost(message, optional, tag = "5")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskInfo>,
}

impl Resource {
    pub fn new(name: impl Into<String>, scalar: f64) -> Self {
        Self {
            name: name.into(),
            scalar,
            ..Default::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_provider_id(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = Some(provider_id.into());
        self
    }

    pub fn with_volume_id(mut self, id: impl Into<String>) -> Self {
        self.disk.get_or_insert_with(DiskInfo::default).id = Some(id.into());
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.disk.get_or_insert_with(DiskInfo::default).profile = Some(profile.into());
        self
    }

    /// Whether this is a pre-existing, indivisible disk volume.
    pub fn is_volume(&self) -> bool {
        self.disk.as_ref().is_some_and(|d| d.id.is_some())
    }

    fn same_identity(&self, other: &Resource) -> bool {
        self.name == other.name
            && self.role == other.role
            && self.provider_id == other.provider_id
            && self.disk == other.disk
    }
}

impl Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(role) = &self.role {
            write!(f, "({})", role)?;
        }
        if let Some(disk) = &self.disk {
            match (&disk.id, &disk.profile) {
                (Some(id), _) => write!(f, "[{}]", id)?,
                (None, Some(profile)) => write!(f, "[profile={}]", profile)?,
                (None, None) => {}
            }
        }
        write!(f, ":{}", self.scalar)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resources(Vec<Resource>);

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Resource> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Resource] {
        &self.0
    }

    /// Add a resource, merging it into an entry with the same identity.
    pub fn add(&mut self, resource: Resource) {
        if resource.scalar <= EPSILON {
            return;
        }
        match self.0.iter_mut().find(|r| r.same_identity(&resource)) {
            Some(existing) => existing.scalar += resource.scalar,
            None => self.0.push(resource),
        }
    }

    /// Remove up to `resource.scalar` from the entry with the same identity.
    pub fn subtract(&mut self, resource: &Resource) {
        if let Some(pos) = self.0.iter().position(|r| r.same_identity(resource)) {
            let remaining = self.0[pos].scalar - resource.scalar;
            if remaining <= EPSILON {
                self.0.remove(pos);
            } else {
                self.0[pos].scalar = remaining;
            }
        }
    }

    pub fn plus(&self, other: &Resources) -> Resources {
        let mut result = self.clone();
        for resource in other.iter() {
            result.add(resource.clone());
        }
        result
    }

    pub fn minus(&self, other: &Resources) -> Resources {
        let mut result = self.clone();
        for resource in other.iter() {
            result.subtract(resource);
        }
        result
    }

    /// Whether every resource in `other` is available in `self`.
    pub fn contains(&self, other: &Resources) -> bool {
        other.iter().all(|wanted| {
            self.0.iter().any(|have| {
                if !have.same_identity(wanted) {
                    return false;
                }
                if wanted.is_volume() {
                    (have.scalar - wanted.scalar).abs() <= EPSILON
                } else {
                    have.scalar + EPSILON >= wanted.scalar
                }
            })
        })
    }
}

impl FromIterator<Resource> for Resources {
    fn from_iter<I: IntoIterator<Item = Resource>>(iter: I) -> Self {
        let mut resources = Resources::new();
        for resource in iter {
            resources.add(resource);
        }
        resources
    }
}

impl From<Vec<Resource>> for Resources {
    fn from(resources: Vec<Resource>) -> Self {
        resources.into_iter().collect()
    }
}

impl<'a> IntoIterator for &'a Resources {
    type Item = &'a Resource;
    type IntoIter = std::slice::Iter<'a, Resource>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, resource) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", resource)?;
        }
        Ok(())
    }
}

/// Error returned when parsing a resource list.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid resource '{0}': expected name[(role)]:value")]
pub struct ResourcesParseError(String);

impl FromStr for Resources {
    type Err = ResourcesParseError;

    /// Parse `cpus:4;mem:1024;disk(storage):2048`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut resources = Resources::new();

        for entry in s.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let err = || ResourcesParseError(entry.to_string());
            let (head, value) = entry.split_once(':').ok_or_else(err)?;
            let scalar: f64 = value.trim().parse().map_err(|_| err())?;
            if !scalar.is_finite() || scalar < 0.0 {
                return Err(err());
            }

            let head = head.trim();
            let resource = match head.split_once('(') {
                Some((name, rest)) => {
                    let role = rest.strip_suffix(')').ok_or_else(err)?;
                    if name.is_empty() || role.is_empty() {
                        return Err(err());
                    }
                    Resource::new(name, scalar).with_role(role)
                }
                None if !head.is_empty() => Resource::new(head, scalar),
                None => return Err(err()),
            };
            resources.add(resource);
        }

        Ok(resources)
    }
}
