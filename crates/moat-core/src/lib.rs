//! Run lifecycle management for moat
//!
//! This crate is the orchestration core of the sandbox: it composes the
//! container, the per-run auth proxy, the SSH-agent filter, the workspace
//! mount tree and credential-derived environment for each run, drives the
//! run state machine, persists every transition, and recovers runs across
//! process restarts. Every failure path releases every previously-acquired
//! resource.

mod audit;
mod compose;
pub mod credentials;
mod error;
mod grants;
mod ids;
mod manager;
mod options;
mod proxy;
mod routes;
mod run;
mod ssh;
mod storage;

pub use audit::*;
pub use compose::*;
pub use credentials::{
    Credential, CredentialStore, Provider, ProviderRegistry, RefreshableProvider, RunStoppedHook,
    SshKeyMapping,
};
pub use error::*;
pub use grants::*;
pub use ids::*;
pub use manager::*;
pub use options::*;
pub use proxy::*;
pub use routes::*;
pub use run::*;
pub use ssh::*;
pub use storage::*;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

/// In-container mount point of the cert-only CA directory
pub const CONTAINER_CA_DIR: &str = "/etc/moat/ca";

/// The single file allowed in the CA mount
pub const CA_CERT_FILE: &str = "ca.crt";

/// In-container path of the filtered SSH agent socket
pub const CONTAINER_SSH_AUTH_SOCK: &str = "/run/moat/ssh-agent.sock";

/// Network alias of the BuildKit sidecar; always excluded from proxying
pub const BUILDKIT_ALIAS: &str = "moat-buildkitd";
