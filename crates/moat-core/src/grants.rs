//! Grant strings: what credentials a run may consume
//!
//! Syntax: `<provider>[:<scope>]`, `ssh:<host>`, or `mcp-<name>`.

use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};

/// A parsed grant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Grant {
    /// A credential provider grant, optionally scoped (e.g. an AWS role ARN)
    Provider {
        name: String,
        scope: Option<String>,
    },
    /// Filtered access to the host SSH agent for one host
    Ssh { host: String },
    /// An MCP relay handled entirely by the proxy
    Mcp { name: String },
}

impl Grant {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CoreError::InvalidGrant(s.to_string()));
        }

        if let Some(host) = s.strip_prefix("ssh:") {
            if host.is_empty() {
                return Err(CoreError::InvalidGrant(s.to_string()));
            }
            return Ok(Self::Ssh {
                host: host.to_string(),
            });
        }

        if s.starts_with("mcp-") {
            return Ok(Self::Mcp {
                name: s.to_string(),
            });
        }

        let (name, scope) = match s.split_once(':') {
            Some((name, scope)) => (name, Some(scope.to_string())),
            None => (s, None),
        };

        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(CoreError::InvalidGrant(s.to_string()));
        }

        Ok(Self::Provider {
            name: name.to_string(),
            scope,
        })
    }

    /// The provider name this grant resolves to, if it is a provider grant
    pub fn provider_name(&self) -> Option<&str> {
        match self {
            Self::Provider { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn is_ssh(&self) -> bool {
        matches!(self, Self::Ssh { .. })
    }

    pub fn is_mcp(&self) -> bool {
        matches!(self, Self::Mcp { .. })
    }
}

impl std::fmt::Display for Grant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provider { name, scope: None } => write!(f, "{}", name),
            Self::Provider {
                name,
                scope: Some(scope),
            } => write!(f, "{}:{}", name, scope),
            Self::Ssh { host } => write!(f, "ssh:{}", host),
            Self::Mcp { name } => write!(f, "{}", name),
        }
    }
}

impl TryFrom<String> for Grant {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&s).map_err(|e| e.to_string())
    }
}

impl From<Grant> for String {
    fn from(g: Grant) -> String {
        g.to_string()
    }
}

/// Parse a full grant list, preserving order
pub fn parse_grants(grants: &[String]) -> Result<Vec<Grant>> {
    grants.iter().map(|g| Grant::parse(g)).collect()
}
