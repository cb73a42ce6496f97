//! Per-agent run configuration (`moat.toml`)
//!
//! Parsed from the workspace root. Everything is optional; an absent file
//! yields `AgentConfig::default()`.

use crate::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Outbound network policy for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkPolicy {
    /// All egress allowed (still routed through the auth proxy)
    #[default]
    Open,
    /// Egress denied except the auth proxy; enforced with in-container
    /// firewall rules
    Strict,
}

/// Docker access requested by the agent's dependencies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DockerAccess {
    #[default]
    None,
    /// Mount the host's container socket into the sandbox
    Socket,
    /// Run a full Docker daemon inside the container (requires privileged)
    Dind,
}

/// Network section of `moat.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub policy: NetworkPolicy,
    /// Hosts reachable under the strict policy (in addition to the proxy)
    #[serde(default)]
    pub allow: Vec<String>,
}

/// Container resource limits
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub cpus: Option<f64>,
    /// Memory limit, e.g. "2g" or "512m"
    pub memory: Option<String>,
}

/// Declared dependencies of the agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependenciesConfig {
    /// Extra packages to install into the image
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub docker: DockerAccess,
}

/// An MCP relay server the proxy should fan out to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// An auxiliary service container sharing the run's network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Host commands run at lifecycle boundaries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    /// Run on the host before the container is created
    pub pre_create: Option<String>,
    /// Run on the host after the run has stopped
    pub post_stop: Option<String>,
}

/// A user-specified bind mount, parsed from "src:dst[:ro]"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MountEntry {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

impl TryFrom<String> for MountEntry {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [src, dst] => Ok(Self {
                source: src.to_string(),
                target: dst.to_string(),
                read_only: false,
            }),
            [src, dst, "ro"] => Ok(Self {
                source: src.to_string(),
                target: dst.to_string(),
                read_only: true,
            }),
            [src, dst, "rw"] => Ok(Self {
                source: src.to_string(),
                target: dst.to_string(),
                read_only: false,
            }),
            _ => Err(format!("invalid mount spec '{}', expected src:dst[:ro]", s)),
        }
    }
}

impl From<MountEntry> for String {
    fn from(m: MountEntry) -> String {
        if m.read_only {
            format!("{}:{}:ro", m.source, m.target)
        } else {
            format!("{}:{}", m.source, m.target)
        }
    }
}

/// A named volume mapped into the container, parsed from "name:dst"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VolumeEntry {
    pub name: String,
    pub target: String,
}

impl TryFrom<String> for VolumeEntry {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        match s.split_once(':') {
            Some((name, dst)) if !name.is_empty() && !dst.is_empty() => Ok(Self {
                name: name.to_string(),
                target: dst.to_string(),
            }),
            _ => Err(format!("invalid volume spec '{}', expected name:dst", s)),
        }
    }
}

impl From<VolumeEntry> for String {
    fn from(v: VolumeEntry) -> String {
        format!("{}:{}", v.name, v.target)
    }
}

/// Parsed `moat.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Bind mounts, relative paths resolved against the workspace
    #[serde(default)]
    pub mounts: Vec<MountEntry>,
    /// Named volumes backed by per-agent host directories
    #[serde(default)]
    pub volumes: Vec<VolumeEntry>,
    /// Environment passed into the container (overridden by CLI --env)
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Host environment variable names passed through as-is
    #[serde(default)]
    pub secrets: Vec<String>,
    /// Service name -> container port to expose through the routing proxy
    #[serde(default)]
    pub ports: HashMap<String, u16>,
    #[serde(default)]
    pub mcp: Vec<McpServerConfig>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default)]
    pub dependencies: DependenciesConfig,
}

impl AgentConfig {
    pub const FILE_NAME: &'static str = "moat.toml";

    /// Load from a workspace directory; absent file yields the default config
    pub fn load_from_workspace(workspace: &Path) -> Result<Self> {
        let path = workspace.join(Self::FILE_NAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::ReadError {
            path: path.clone(),
            source,
        })?;
        let config: Self =
            toml::from_str(&content).map_err(|source| ConfigError::TomlParseError {
                path: path.clone(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (service, port) in &self.ports {
            if *port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "port for service '{}' must be non-zero",
                    service
                )));
            }
        }
        for mcp in &self.mcp {
            if !mcp.name.starts_with("mcp-") {
                return Err(ConfigError::Invalid(format!(
                    "mcp server name '{}' must start with 'mcp-'",
                    mcp.name
                )));
            }
        }
        Ok(())
    }

    /// Whether anything in this config requires privileged mode
    pub fn requires_privileged(&self) -> bool {
        self.dependencies.docker == DockerAccess::Dind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_default() {
        let tmp = tempfile::tempdir().unwrap();
        let config = AgentConfig::load_from_workspace(tmp.path()).unwrap();
        assert!(config.mounts.is_empty());
        assert_eq!(config.network.policy, NetworkPolicy::Open);
    }

    #[test]
    fn test_parse_full_config() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("moat.toml"),
            r#"
mounts = ["./data:/data", "/etc/foo:/etc/foo:ro"]
volumes = ["cargo-cache:/home/agent/.cargo"]
secrets = ["NPM_TOKEN"]

[env]
RUST_LOG = "debug"

[ports]
web = 3000

[network]
policy = "strict"
allow = ["api.github.com"]

[limits]
cpus = 2.0
memory = "2g"

[dependencies]
packages = ["ripgrep"]
docker = "socket"

[[mcp]]
name = "mcp-context7"
url = "https://context7.example/mcp"
"#,
        )
        .unwrap();

        let config = AgentConfig::load_from_workspace(tmp.path()).unwrap();
        assert_eq!(config.mounts.len(), 2);
        assert!(!config.mounts[0].read_only);
        assert!(config.mounts[1].read_only);
        assert_eq!(config.volumes[0].name, "cargo-cache");
        assert_eq!(config.network.policy, NetworkPolicy::Strict);
        assert_eq!(config.network.allow, vec!["api.github.com"]);
        assert_eq!(config.ports["web"], 3000);
        assert_eq!(config.dependencies.docker, DockerAccess::Socket);
        assert_eq!(config.mcp[0].name, "mcp-context7");
        assert!(!config.requires_privileged());
    }

    #[test]
    fn test_invalid_mount_spec_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("moat.toml"), r#"mounts = ["justonepart"]"#).unwrap();
        assert!(AgentConfig::load_from_workspace(tmp.path()).is_err());
    }

    #[test]
    fn test_zero_port_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("moat.toml"), "[ports]\nweb = 0\n").unwrap();
        assert!(AgentConfig::load_from_workspace(tmp.path()).is_err());
    }

    #[test]
    fn test_dind_requires_privileged() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("moat.toml"), "[dependencies]\ndocker = \"dind\"\n").unwrap();
        let config = AgentConfig::load_from_workspace(tmp.path()).unwrap();
        assert!(config.requires_privileged());
    }

    #[test]
    fn test_mcp_name_must_have_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("moat.toml"),
            "[[mcp]]\nname = \"context7\"\nurl = \"https://x\"\n",
        )
        .unwrap();
        assert!(AgentConfig::load_from_workspace(tmp.path()).is_err());
    }
}
