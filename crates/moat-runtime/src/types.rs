//! Common types for container runtimes

use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::Result;

/// Container ID wrapper
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn short(&self) -> &str {
        if self.0.len() > 12 {
            &self.0[..12]
        } else {
            &self.0
        }
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Image ID wrapper
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageId(pub String);

impl ImageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for ImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Container runtime kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Docker,
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
        }
    }
}

impl std::str::FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            _ => Err(format!("Unknown runtime kind: {}", s)),
        }
    }
}

/// Container status as reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Restarting => write!(f, "restarting"),
            Self::Removing => write!(f, "removing"),
            Self::Exited => write!(f, "exited"),
            Self::Dead => write!(f, "dead"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl From<&str> for ContainerStatus {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" | "stopped" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }
}

/// Mount type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    Bind,
    Volume,
    Tmpfs,
}

/// Mount specification
#[derive(Debug, Clone)]
pub struct MountSpec {
    pub kind: MountKind,
    /// Host path or volume name
    pub source: String,
    /// Path in the container
    pub target: String,
    pub read_only: bool,
}

impl MountSpec {
    pub fn bind(source: impl Into<String>, target: impl Into<String>, read_only: bool) -> Self {
        Self {
            kind: MountKind::Bind,
            source: source.into(),
            target: target.into(),
            read_only,
        }
    }
}

/// Port publication request
#[derive(Debug, Clone)]
pub struct PortSpec {
    pub container_port: u16,
    /// None lets the runtime pick a free host port
    pub host_port: Option<u16>,
    pub protocol: String,
}

/// A published port discovered after start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBindingInfo {
    pub container_port: u16,
    pub host_port: u16,
    pub protocol: String,
}

/// Configuration for creating a container
#[derive(Debug, Clone, Default)]
pub struct CreateContainerConfig {
    pub image: String,
    pub name: Option<String>,
    pub cmd: Option<Vec<String>>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<String>,
    /// "uid:gid" or a username; empty means the image default
    pub user: Option<String>,
    pub mounts: Vec<MountSpec>,
    pub ports: Vec<PortSpec>,
    pub labels: HashMap<String, String>,
    pub hostname: Option<String>,
    pub tty: bool,
    pub stdin_open: bool,
    /// "host", "bridge", a network id, or None for the runtime default
    pub network_mode: Option<String>,
    /// "host:ip" entries added to /etc/hosts
    pub extra_hosts: Vec<String>,
    pub privileged: bool,
    pub cap_add: Vec<String>,
    /// Supplementary groups for the container user
    pub group_add: Vec<String>,
    pub cpus: Option<f64>,
    pub memory_bytes: Option<i64>,
}

/// Which stream a log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
}

/// One demultiplexed log chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub stream: LogSource,
    pub message: String,
}

/// Streaming container logs
pub type LogStream = Pin<Box<dyn Stream<Item = Result<LogEntry>> + Send>>;

/// I/O handles for a container started in attached mode
pub struct AttachedIo {
    pub stdin: Pin<Box<dyn AsyncWrite + Send>>,
    /// Combined stdout/stderr (raw when a TTY is allocated)
    pub output: Pin<Box<dyn AsyncRead + Send>>,
}

/// Egress firewall parameters for a strict-policy run
#[derive(Debug, Clone)]
pub struct FirewallConfig {
    /// The auth proxy the container must still reach
    pub proxy_host: String,
    pub proxy_port: u16,
    /// Extra hosts allowed by the user's policy
    pub allowed_hosts: Vec<String>,
}

/// Image build options
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub no_cache: bool,
    pub pull: bool,
    pub build_args: HashMap<String, String>,
    pub labels: HashMap<String, String>,
}

/// A sandboxed service container request (e.g. a database the agent needs)
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    /// Container name on the host
    pub name: String,
    /// Network alias the main container uses to reach it
    pub alias: String,
    pub image: String,
    pub env: HashMap<String, String>,
    /// Run network to join
    pub network: String,
}

/// Runtime identification
#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    pub kind: RuntimeKind,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_id_short() {
        let id = ContainerId::new("0123456789abcdef0123");
        assert_eq!(id.short(), "0123456789ab");
        let id = ContainerId::new("abc");
        assert_eq!(id.short(), "abc");
    }

    #[test]
    fn test_status_from_str() {
        assert_eq!(ContainerStatus::from("running"), ContainerStatus::Running);
        assert_eq!(ContainerStatus::from("EXITED"), ContainerStatus::Exited);
        assert_eq!(ContainerStatus::from("stopped"), ContainerStatus::Exited);
        assert_eq!(ContainerStatus::from("whatever"), ContainerStatus::Unknown);
    }

    #[test]
    fn test_log_entry_serializes_lowercase() {
        let entry = LogEntry {
            stream: LogSource::Stderr,
            message: "boom".to_string(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains(r#""stream":"stderr""#));
    }
}
