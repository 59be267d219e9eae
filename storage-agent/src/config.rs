//! Agent configuration.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::plugin::LifecycleConfig;
use crate::resources::Resources;

/// Capabilities an agent may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentCapability {
    /// Accepts resource provider configs at runtime.
    ResourceProvider,
}

impl FromStr for AgentCapability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RESOURCE_PROVIDER" => Ok(AgentCapability::ResourceProvider),
            other => Err(format!("unknown agent capability '{}'", other)),
        }
    }
}

impl fmt::Display for AgentCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentCapability::ResourceProvider => f.write_str("RESOURCE_PROVIDER"),
        }
    }
}

/// Isolation mode requested for the agent. Plugin containers run as plain
/// child processes in either mode; the setting is reported on `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    #[default]
    Posix,
    FilesystemLinux,
}

impl FromStr for Isolation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "posix" | "posix/cpu,posix/mem" => Ok(Isolation::Posix),
            "filesystem/linux" => Ok(Isolation::FilesystemLinux),
            other => Err(format!("unsupported isolation '{}'", other)),
        }
    }
}

impl fmt::Display for Isolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Isolation::Posix => f.write_str("posix"),
            Isolation::FilesystemLinux => f.write_str("filesystem/linux"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_id: String,
    /// Resource provider config directory.
    pub config_dir: PathBuf,
    /// Root of the CSI path registry.
    pub csi_root: PathBuf,
    /// Base directory for real plugin endpoint directories. Kept short so
    /// socket paths fit `sun_path`.
    pub endpoint_tmp_dir: PathBuf,
    pub capabilities: HashSet<AgentCapability>,
    pub isolation: Isolation,
    /// The agent's own resources, advertised alongside provider resources.
    pub default_resources: Resources,
    pub plugin_ready_timeout: Duration,
    pub plugin_stop_timeout: Duration,
    /// Interval of the plugin health check; `None` disables it.
    pub health_check_interval: Option<Duration>,
}

impl AgentConfig {
    /// Configuration with every directory under `work_dir` and the
    /// RESOURCE_PROVIDER capability enabled.
    pub fn new(agent_id: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        Self {
            agent_id: agent_id.into(),
            config_dir: work_dir.join("resource_providers"),
            csi_root: work_dir.join("csi"),
            endpoint_tmp_dir: work_dir.join("run"),
            capabilities: HashSet::from([AgentCapability::ResourceProvider]),
            isolation: Isolation::default(),
            default_resources: Resources::new(),
            plugin_ready_timeout: Duration::from_secs(10),
            plugin_stop_timeout: Duration::from_secs(5),
            health_check_interval: Some(Duration::from_secs(5)),
        }
    }

    pub fn has_capability(&self, capability: AgentCapability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            csi_root: self.csi_root.clone(),
            endpoint_tmp_dir: self.endpoint_tmp_dir.clone(),
            ready_timeout: self.plugin_ready_timeout,
            stop_timeout: self.plugin_stop_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::new("agent-1", "/var/lib/agent");
        assert_eq!(config.csi_root, PathBuf::from("/var/lib/agent/csi"));
        assert!(config.has_capability(AgentCapability::ResourceProvider));
        assert_eq!(config.lifecycle().csi_root, config.csi_root);
    }

    #[test]
    fn test_parse_flags() {
        assert_eq!(
            "resource_provider".parse::<AgentCapability>(),
            Ok(AgentCapability::ResourceProvider)
        );
        assert!("MULTI_ROLE".parse::<AgentCapability>().is_err());
        assert_eq!("filesystem/linux".parse::<Isolation>(), Ok(Isolation::FilesystemLinux));
        assert!("docker/runtime".parse::<Isolation>().is_err());
    }
}
