//! Interfaces to the per-run TLS-intercepting auth proxy
//!
//! The proxy itself is an external process; the core holds one handle per
//! run, configures it through `ProxyConfigurer`, and stops it when the run
//! ends. The handle is owned by exactly one `Run` — the manager never
//! reaches through.

use crate::credentials::{Credential, CredentialStore};
use crate::Result;
use async_trait::async_trait;
use moat_config::{McpServerConfig, NetworkPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// One intercepted request, as appended to `network.jsonl`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkLogRecord {
    pub method: String,
    pub url: String,
    pub status: u16,
    pub duration_ms: u64,
    /// Request headers after secret filtering
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Whether the recorded body was truncated
    #[serde(default)]
    pub truncated: bool,
}

/// Callback receiving intercepted-request records
pub type NetworkLogger = Box<dyn Fn(NetworkLogRecord) + Send + Sync>;

/// Configuration surface of the per-run proxy
pub trait ProxyConfigurer: Send + Sync {
    /// Register a host -> (header name, header value) injection
    fn set_credential(&self, host: &str, header: &str, value: &str);

    /// Serve short-lived cloud credentials at the proxy's credential
    /// endpoint for the given role-assumption credential
    fn set_aws_handler(&self, cred: &Credential);

    fn set_network_policy(&self, policy: NetworkPolicy, allow: &[String], grants: &[String]);

    fn set_mcp_servers(&self, servers: &[McpServerConfig]);

    /// Store used when the proxy needs to re-read refreshed tokens
    fn set_credential_store(&self, store: Arc<dyn CredentialStore>);

    fn set_logger(&self, logger: NetworkLogger);

    fn set_bind_addr(&self, addr: &str);

    fn set_auth_token(&self, token: &str);
}

/// A running per-run proxy
#[async_trait]
pub trait AuthProxy: ProxyConfigurer {
    /// View this handle as its configuration surface
    fn as_configurer(&self) -> &dyn ProxyConfigurer;

    /// Port the proxy listens on (on the host)
    fn host_port(&self) -> u16;

    /// Host directory holding the proxy's CA certificate (`ca.crt`).
    /// May also hold private material; never mount this directly.
    fn ca_source_dir(&self) -> PathBuf;

    /// The bearer token guarding the proxy, when bound to all interfaces
    fn auth_token(&self) -> Option<String>;

    /// Stop the proxy. Idempotent.
    async fn stop(&self);
}

/// Launch parameters for a per-run proxy
#[derive(Clone)]
pub struct ProxyLaunchOptions {
    pub run_id: String,
    /// Bind to all interfaces (multi-VM runtimes); implies an auth token
    pub bind_all: bool,
    pub auth_token: Option<String>,
    pub store: Arc<dyn CredentialStore>,
}

/// Spawns per-run proxies
#[async_trait]
pub trait ProxyLauncher: Send + Sync {
    async fn launch(&self, opts: ProxyLaunchOptions) -> Result<Arc<dyn AuthProxy>>;
}
