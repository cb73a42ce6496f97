//! Filtering SSH-agent proxy for `ssh:<host>` grants
//!
//! Sits between the container and the host's real agent. Identity listings
//! are filtered to the keys authorized for the granted hosts; signing is
//! refused for any other key. Every signing attempt is audited.
//!
//! The wire protocol is the ssh-agent framing: a u32 big-endian length
//! followed by a one-byte message type and its payload.

use crate::audit::{AuditEvent, AuditLog};
use crate::credentials::{CredentialStore, SshKeyMapping};
use crate::{CoreError, Result, SshAgentFailure, CONTAINER_SSH_AUTH_SOCK};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use moat_runtime::MountSpec;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SSH_AGENT_FAILURE: u8 = 5;
const SSH_AGENTC_REQUEST_IDENTITIES: u8 = 11;
const SSH_AGENT_IDENTITIES_ANSWER: u8 = 12;
const SSH_AGENTC_SIGN_REQUEST: u8 = 13;

/// Upper bound on a single agent message
const MAX_MESSAGE_LEN: u32 = 1024 * 1024;

/// SHA256 fingerprint of a public key blob, OpenSSH style
pub fn key_fingerprint(blob: &[u8]) -> String {
    let digest = Sha256::digest(blob);
    format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
}

/// Where the filtered agent is reachable
#[derive(Debug, Clone)]
pub enum SshAgentEndpoint {
    /// Host Unix socket, bind-mountable into the container
    Unix(PathBuf),
    /// TCP endpoint for runtimes with a VM boundary; an in-container socat
    /// bridge re-exposes it as a Unix socket
    Tcp(std::net::SocketAddr),
}

/// Everything the composer needs from SSH agent setup
pub struct SshAgentSetup {
    pub proxy: SshAgentProxy,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<MountSpec>,
}

/// A running filtering agent proxy
pub struct SshAgentProxy {
    endpoint: SshAgentEndpoint,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SshAgentProxy {
    pub fn endpoint(&self) -> &SshAgentEndpoint {
        &self.endpoint
    }

    /// Stop accepting connections. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

struct Filter {
    upstream: PathBuf,
    allowed: HashSet<String>,
    hosts: Vec<String>,
    audit: Option<Arc<AuditLog>>,
}

impl Filter {
    async fn upstream_roundtrip(&self, message: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut stream = UnixStream::connect(&self.upstream).await?;
        write_frame(&mut stream, message).await?;
        let response = read_frame(&mut stream).await?;
        Ok(response)
    }

    fn audit_sign(&self, fingerprint: &str, error: Option<&str>) {
        if let Some(audit) = &self.audit {
            audit.append_best_effort(&AuditEvent::new(
                "ssh-sign",
                json!({
                    "action": "sign",
                    "hosts": self.hosts,
                    "fingerprint": fingerprint,
                    "error": error,
                }),
            ));
        }
    }

    async fn handle_message(&self, message: &[u8]) -> Vec<u8> {
        match message.first() {
            Some(&SSH_AGENTC_REQUEST_IDENTITIES) => match self.upstream_roundtrip(message).await {
                Ok(response) => {
                    filter_identities(&response, &self.allowed).unwrap_or(response)
                }
                Err(e) => {
                    tracing::warn!("Upstream agent request failed: {}", e);
                    vec![SSH_AGENT_FAILURE]
                }
            },
            Some(&SSH_AGENTC_SIGN_REQUEST) => {
                let Some(blob) = sign_request_key_blob(message) else {
                    return vec![SSH_AGENT_FAILURE];
                };
                let fingerprint = key_fingerprint(&blob);
                if !self.allowed.contains(&fingerprint) {
                    self.audit_sign(&fingerprint, Some("key not authorized for granted hosts"));
                    return vec![SSH_AGENT_FAILURE];
                }
                match self.upstream_roundtrip(message).await {
                    Ok(response) => {
                        self.audit_sign(&fingerprint, None);
                        response
                    }
                    Err(e) => {
                        self.audit_sign(&fingerprint, Some(&e.to_string()));
                        vec![SSH_AGENT_FAILURE]
                    }
                }
            }
            // Everything else (add/remove/lock) is refused by the filter
            _ => vec![SSH_AGENT_FAILURE],
        }
    }

    async fn serve_connection<S>(&self, mut stream: S)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        loop {
            let message = match read_frame(&mut stream).await {
                Ok(m) => m,
                Err(_) => return,
            };
            let response = self.handle_message(&message).await;
            if write_frame(&mut stream, &response).await.is_err() {
                return;
            }
        }
    }
}

async fn read_frame<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<Vec<u8>> {
    let len = stream.read_u32().await?;
    if len == 0 || len > MAX_MESSAGE_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "agent message length out of range",
        ));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_frame<S: tokio::io::AsyncWrite + Unpin>(
    stream: &mut S,
    message: &[u8],
) -> std::io::Result<()> {
    stream.write_u32(message.len() as u32).await?;
    stream.write_all(message).await?;
    stream.flush().await
}

fn read_lv<'a>(buf: &'a [u8], offset: &mut usize) -> Option<&'a [u8]> {
    if buf.len() < *offset + 4 {
        return None;
    }
    let len = u32::from_be_bytes(buf[*offset..*offset + 4].try_into().ok()?) as usize;
    *offset += 4;
    if buf.len() < *offset + len {
        return None;
    }
    let value = &buf[*offset..*offset + len];
    *offset += len;
    Some(value)
}

fn write_lv(out: &mut Vec<u8>, value: &[u8]) {
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value);
}

/// Rewrite an identities answer to contain only allowed keys.
/// Returns None when the message is not an identities answer.
fn filter_identities(message: &[u8], allowed: &HashSet<String>) -> Option<Vec<u8>> {
    if message.first() != Some(&SSH_AGENT_IDENTITIES_ANSWER) {
        return None;
    }
    let mut offset = 1;
    if message.len() < offset + 4 {
        return None;
    }
    let nkeys = u32::from_be_bytes(message[offset..offset + 4].try_into().ok()?);
    offset += 4;

    let mut kept: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    for _ in 0..nkeys {
        let blob = read_lv(message, &mut offset)?.to_vec();
        let comment = read_lv(message, &mut offset)?.to_vec();
        if allowed.contains(&key_fingerprint(&blob)) {
            kept.push((blob, comment));
        }
    }

    let mut out = vec![SSH_AGENT_IDENTITIES_ANSWER];
    out.extend_from_slice(&(kept.len() as u32).to_be_bytes());
    for (blob, comment) in kept {
        write_lv(&mut out, &blob);
        write_lv(&mut out, &comment);
    }
    Some(out)
}

/// Extract the key blob from a sign request
fn sign_request_key_blob(message: &[u8]) -> Option<Vec<u8>> {
    if message.first() != Some(&SSH_AGENTC_SIGN_REQUEST) {
        return None;
    }
    let mut offset = 1;
    read_lv(message, &mut offset).map(|blob| blob.to_vec())
}

/// Fingerprints allowed for the granted hosts, failing per host with no key
fn allowed_fingerprints(
    mappings: &[SshKeyMapping],
    hosts: &[String],
) -> Result<HashSet<String>> {
    let mut allowed = HashSet::new();
    for host in hosts {
        let mut found = false;
        for mapping in mappings {
            if mapping.hosts.iter().any(|h| h == host) {
                allowed.insert(mapping.fingerprint.clone());
                found = true;
            }
        }
        if !found {
            return Err(CoreError::SshAgentSetupFailed(SshAgentFailure::NoMatchingKey(
                host.clone(),
            )));
        }
    }
    Ok(allowed)
}

/// Set up the filtering agent proxy for a run's `ssh:` grants.
///
/// `shared_kernel` selects the Unix-socket mount path; otherwise the proxy
/// binds a TCP endpoint on all interfaces and the container bridges it with
/// socat. Returns None when no SSH grants are present.
pub async fn setup_ssh_agent(
    hosts: &[String],
    store: &dyn CredentialStore,
    storage_dir: &Path,
    audit: Option<Arc<AuditLog>>,
    shared_kernel: bool,
    host_address: &str,
) -> Result<Option<SshAgentSetup>> {
    if hosts.is_empty() {
        return Ok(None);
    }

    let upstream = std::env::var("SSH_AUTH_SOCK")
        .ok()
        .map(PathBuf::from)
        .filter(|p| p.exists())
        .ok_or(CoreError::SshAgentSetupFailed(
            SshAgentFailure::NoUpstreamAgent,
        ))?;

    let mappings = store.ssh_mappings_for_hosts(hosts).await?;
    let allowed = allowed_fingerprints(&mappings, hosts)?;

    let filter = Arc::new(Filter {
        upstream,
        allowed,
        hosts: hosts.to_vec(),
        audit,
    });
    let cancel = CancellationToken::new();

    let mut env = vec![(
        "SSH_AUTH_SOCK".to_string(),
        CONTAINER_SSH_AUTH_SOCK.to_string(),
    )];
    let mut mounts = Vec::new();

    let proxy = if shared_kernel {
        let socket_path = storage_dir.join("ssh-agent.sock");
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path).map_err(|e| {
            CoreError::SshAgentSetupFailed(SshAgentFailure::ConnectFailed(e.to_string()))
        })?;

        mounts.push(MountSpec::bind(
            socket_path.to_string_lossy().to_string(),
            CONTAINER_SSH_AUTH_SOCK,
            false,
        ));

        let task_cancel = cancel.clone();
        let task_filter = Arc::clone(&filter);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => return,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { return };
                        let conn_filter = Arc::clone(&task_filter);
                        tokio::spawn(async move {
                            conn_filter.serve_connection(stream).await;
                        });
                    }
                }
            }
        });

        SshAgentProxy {
            endpoint: SshAgentEndpoint::Unix(socket_path),
            cancel,
            task,
        }
    } else {
        let listener = TcpListener::bind(("0.0.0.0", 0)).await.map_err(|e| {
            CoreError::SshAgentSetupFailed(SshAgentFailure::ConnectFailed(e.to_string()))
        })?;
        let addr = listener.local_addr()?;

        // The sandbox entrypoint bridges this to CONTAINER_SSH_AUTH_SOCK
        // with socat
        env.push((
            "MOAT_SSH_AGENT_TCP".to_string(),
            format!("{}:{}", host_address, addr.port()),
        ));

        let task_cancel = cancel.clone();
        let task_filter = Arc::clone(&filter);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => return,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { return };
                        let conn_filter = Arc::clone(&task_filter);
                        tokio::spawn(async move {
                            conn_filter.serve_connection(stream).await;
                        });
                    }
                }
            }
        });

        SshAgentProxy {
            endpoint: SshAgentEndpoint::Tcp(addr),
            cancel,
            task,
        }
    };

    Ok(Some(SshAgentSetup { proxy, env, mounts }))
}
