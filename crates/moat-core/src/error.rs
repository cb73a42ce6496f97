//! Error types for moat-core

use thiserror::Error;

/// Why SSH agent setup failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshAgentFailure {
    /// No upstream agent socket on the host
    NoUpstreamAgent,
    /// No authorized key covers the granted host
    NoMatchingKey(String),
    /// Could not connect to the upstream agent
    ConnectFailed(String),
}

impl std::fmt::Display for SshAgentFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoUpstreamAgent => {
                write!(f, "no upstream SSH agent (is SSH_AUTH_SOCK set?)")
            }
            Self::NoMatchingKey(host) => write!(
                f,
                "no SSH key authorized for host '{}' (run `moat grant ssh --host {}`)",
                host, host
            ),
            Self::ConnectFailed(e) => write!(f, "could not connect to upstream agent: {}", e),
        }
    }
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] moat_config::ConfigError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] moat_runtime::RuntimeError),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Name conflict: '{0}' is already in use")]
    NameConflict(String),

    #[error("Invalid grant '{0}'")]
    InvalidGrant(String),

    #[error("No credential configured for '{0}' (run `moat grant {0}`)")]
    GrantNotConfigured(String),

    #[error(
        "Failed to decrypt credential for '{0}': the encryption key has rotated, \
         re-authorize with `moat grant {0}`"
    )]
    GrantDecryptionFailed(String),

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("MCP grant '{0}' has no matching server in the agent config")]
    McpGrantMissing(String),

    #[error("Failed to start auth proxy: {0}")]
    ProxyStartFailed(String),

    #[error("SSH agent setup failed: {0}")]
    SshAgentSetupFailed(SshAgentFailure),

    #[error("Image build failed: {0}")]
    ImageBuildFailed(String),

    #[error("Image remove failed: {0}")]
    ImageRemoveFailed(String),

    #[error("Container create failed: {0}")]
    ContainerCreateFailed(String),

    #[error("Container start failed: {0}")]
    ContainerStartFailed(String),

    #[error("Firewall setup failed: {0}")]
    FirewallSetupFailed(String),

    #[error("Container wait failed: {0}")]
    ContainerWaitFailed(String),

    #[error("container exited with code {0}")]
    ContainerExitedNonZero(i64),

    #[error("Token refresh failed for '{provider}': {reason}")]
    TokenRefreshFailed { provider: String, reason: String },

    #[error("Token for '{0}' was revoked; re-authorize with `moat grant {0}`")]
    TokenRevoked(String),

    #[error("Failed to persist run metadata: {0}")]
    PersistenceFailed(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Operation cancelled by caller")]
    CancelledByCaller,

    #[error("Audit log error: {0}")]
    Audit(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
