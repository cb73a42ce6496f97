//! Credential store and provider interfaces
//!
//! Credentials live on the host, encrypted at rest by an external store; the
//! core reads them, hands them to providers for proxy configuration, and
//! never lets the raw secret reach the container.

mod bind;
pub mod providers;
mod refresh;

pub use bind::*;
pub use refresh::*;

use crate::proxy::ProxyConfigurer;
use crate::{CoreError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moat_runtime::MountSpec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// A host-held credential for one provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub provider: String,
    /// The secret value injected by the proxy; never exported to the container
    pub secret: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Credential {
    pub fn new(provider: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            secret: secret.into(),
            refresh_token: None,
            expires_at: None,
            metadata: HashMap::new(),
        }
    }
}

/// An authorized SSH key and the hosts it may sign for
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshKeyMapping {
    /// SHA256 key fingerprint
    pub fingerprint: String,
    pub hosts: Vec<String>,
}

/// Host-side credential storage, shared read-mostly across runs
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Look up the credential for a provider.
    /// Errors: `GrantNotConfigured`, `GrantDecryptionFailed`.
    async fn get(&self, provider: &str) -> Result<Credential>;

    /// Persist a (refreshed) credential
    async fn save(&self, cred: &Credential) -> Result<()>;

    /// SSH key mappings whose host lists intersect the given hosts
    async fn ssh_mappings_for_hosts(&self, hosts: &[String]) -> Result<Vec<SshKeyMapping>>;
}

/// Inputs a provider may need while contributing env and mounts
#[derive(Debug, Clone)]
pub struct BindContext {
    pub proxy_host: String,
    pub proxy_port: u16,
    pub auth_token: Option<String>,
    /// Home directory of the sandbox user inside the container
    pub container_home: String,
    /// Host directory providers stage files under (one subdir per provider)
    pub staging_root: PathBuf,
}

/// Context handed to run-stopped hooks
#[derive(Debug, Clone)]
pub struct RunStoppedContext {
    pub run_id: String,
    pub workspace: PathBuf,
    pub storage_dir: PathBuf,
}

/// A credential provider: knows how to wire one kind of credential into the
/// per-run proxy and the container
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Register host -> header mappings (and any special handlers) on the proxy
    fn configure_proxy(
        &self,
        proxy: &dyn ProxyConfigurer,
        cred: &Credential,
        scope: Option<&str>,
    ) -> Result<()>;

    /// Container-visible environment this provider requires (sentinel values,
    /// endpoint URLs); never the secret itself
    fn container_env(&self, cred: &Credential, ctx: &BindContext) -> Vec<(String, String)>;

    /// Optional container mounts (staging directories) plus the host path to
    /// clean up after the run
    fn container_mounts(
        &self,
        _cred: &Credential,
        _ctx: &BindContext,
    ) -> Result<(Vec<MountSpec>, Option<PathBuf>)> {
        Ok((Vec::new(), None))
    }

    /// Packages the sandbox image needs for this provider's tooling
    fn implied_dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn refreshable(&self) -> Option<&dyn RefreshableProvider> {
        None
    }

    fn run_stopped_hook(&self) -> Option<&dyn RunStoppedHook> {
        None
    }
}

impl std::fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Provider({})", self.name())
    }
}

/// Token refresh support for providers whose credentials expire
#[async_trait]
pub trait RefreshableProvider: Send + Sync {
    fn can_refresh(&self, cred: &Credential) -> bool;

    fn refresh_interval(&self) -> Duration;

    /// Obtain a fresh token and re-register it on the proxy.
    /// A `TokenRevoked` error is terminal for the grant.
    async fn refresh(&self, proxy: &dyn ProxyConfigurer, cred: &Credential) -> Result<Credential>;
}

/// Callback invoked exactly once after container exit
#[async_trait]
pub trait RunStoppedHook: Send + Sync {
    /// Returns provider metadata to merge into the run's persisted record
    async fn on_run_stopped(&self, ctx: &RunStoppedContext) -> Result<HashMap<String, String>>;
}

/// Registry of providers, built before Manager construction
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the builtin providers
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(providers::GithubProvider));
        registry.register(Arc::new(providers::AnthropicProvider));
        registry.register(Arc::new(providers::AwsProvider));
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    /// Resolve a grant name to its provider; `mcp-*` names never reach this
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Provider>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::UnknownProvider(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_resolves_builtins() {
        let registry = ProviderRegistry::with_builtins();
        assert!(registry.resolve("github").is_ok());
        assert!(registry.resolve("anthropic").is_ok());
        assert!(registry.resolve("aws").is_ok());
    }

    #[test]
    fn test_registry_unknown_provider() {
        let registry = ProviderRegistry::with_builtins();
        let err = registry.resolve("doesnotexist").unwrap_err();
        assert!(matches!(err, CoreError::UnknownProvider(_)));
    }
}
