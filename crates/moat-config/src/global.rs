//! Global configuration (`~/.config/moat/config.toml`)

use crate::{ConfigError, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Runtime connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Container runtime API socket
    #[serde(default = "default_docker_socket")]
    pub socket: String,
}

fn default_docker_socket() -> String {
    "/var/run/docker.sock".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            socket: default_docker_socket(),
        }
    }
}

/// SSH key authorization: key fingerprint -> hosts it may sign for
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshConfig {
    /// SHA256 fingerprint -> allowed hosts
    #[serde(default)]
    pub keys: HashMap<String, Vec<String>>,
}

/// Global moat configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Override for the run storage directory
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Default image for new runs
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default)]
    pub ssh: SshConfig,
}

fn default_image() -> String {
    "ghcr.io/majorcontext/moat-sandbox:latest".to_string()
}

impl GlobalConfig {
    /// Load from the default location; absent file yields defaults
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Load from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self {
                image: default_image(),
                ..Self::default()
            });
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.clone(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::TomlParseError {
            path: path.clone(),
            source,
        })
    }

    /// Default config file path
    pub fn config_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "moat").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Data directory for run storage, created on demand by callers
    pub fn data_dir() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "moat").ok_or(ConfigError::NoDataDir)?;
        Ok(dirs.data_dir().to_path_buf())
    }

    /// Directory holding per-run storage
    pub fn runs_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.join("runs")),
            None => Ok(Self::data_dir()?.join("runs")),
        }
    }

    /// Directory backing named volumes, keyed by agent then volume name
    pub fn volumes_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.join("volumes")),
            None => Ok(Self::data_dir()?.join("volumes")),
        }
    }

    /// Hosts a given key fingerprint may sign for
    pub fn ssh_hosts_for_key(&self, fingerprint: &str) -> Option<&[String]> {
        self.ssh.keys.get(fingerprint).map(|v| v.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_yields_defaults() {
        let path = PathBuf::from("/tmp/nonexistent_moat_config_test.toml");
        let config = GlobalConfig::load_from(&path).unwrap();
        assert_eq!(config.runtime.socket, "/var/run/docker.sock");
        assert!(config.data_dir.is_none());
        assert!(!config.image.is_empty());
    }

    #[test]
    fn test_parse_ssh_mappings() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
data_dir = "/srv/moat"

[runtime]
socket = "unix:///run/docker.sock"

[ssh.keys]
"SHA256:abc123" = ["github.com", "gitlab.com"]
"#,
        )
        .unwrap();

        let config = GlobalConfig::load_from(&path).unwrap();
        assert_eq!(config.runtime.socket, "unix:///run/docker.sock");
        assert_eq!(config.runs_dir().unwrap(), PathBuf::from("/srv/moat/runs"));
        let hosts = config.ssh_hosts_for_key("SHA256:abc123").unwrap();
        assert_eq!(hosts, ["github.com".to_string(), "gitlab.com".to_string()]);
        assert!(config.ssh_hosts_for_key("SHA256:nope").is_none());
    }
}
