//! Resource composition: options + host environment -> container plan
//!
//! A pure assembly step: nothing here talks to the runtime. The manager
//! acquires resources in order afterwards, so any validation failure lands
//! before the first side effect.

use crate::credentials::proxy_env;
use crate::{CoreError, Result, CONTAINER_CA_DIR};
use moat_config::{AgentConfig, DockerAccess, NetworkPolicy};
use moat_runtime::{CreateContainerConfig, MountKind, MountSpec, PortSpec, RuntimeKind};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Fixed in-container workspace path
pub const CONTAINER_WORKSPACE_DIR: &str = "/workspace";

/// Default uid of the sandbox user baked into the image
pub const SANDBOX_UID: u32 = 5000;

/// Host Docker socket mounted for `docker = "socket"` dependencies
pub const DOCKER_SOCKET_PATH: &str = "/var/run/docker.sock";

/// Inputs to the composer
pub struct ComposeInputs<'a> {
    pub run_id: &'a str,
    pub name: &'a str,
    pub workspace: &'a Path,
    pub image: &'a str,
    pub cmd: Vec<String>,
    pub config: &'a AgentConfig,
    /// CLI-level env, highest priority
    pub explicit_env: &'a HashMap<String, String>,
    /// Env contributed by bound credential providers
    pub bound_env: &'a [(String, String)],
    pub bound_mounts: &'a [MountSpec],
    /// (host, port, auth token) of the per-run proxy, when one exists
    pub proxy: Option<(String, u16, Option<String>)>,
    pub ssh_env: &'a [(String, String)],
    pub ssh_mounts: &'a [MountSpec],
    /// Host directory holding the cert-only CA mount
    pub ca_host_dir: Option<&'a Path>,
    /// Root for named-volume backing directories
    pub volumes_root: &'a Path,
    pub runtime_kind: RuntimeKind,
    pub supports_host_network: bool,
    /// Per-run network id, when service containers or a build sidecar exist
    pub run_network: Option<&'a str>,
    pub tty: bool,
    pub interactive: bool,
}

/// The composed plan, plus decisions the manager audits
pub struct ComposedPlan {
    pub container: CreateContainerConfig,
    pub host_network: bool,
    /// Present when privileged mode was selected; audited by the manager
    pub privileged_reason: Option<String>,
}

/// Parse "512m" / "2g" / plain bytes into a byte count
pub fn parse_memory(s: &str) -> Result<i64> {
    let s = s.trim().to_lowercase();
    let (digits, multiplier) = match s.strip_suffix(['k', 'm', 'g']) {
        Some(prefix) => {
            let mult = match s.as_bytes()[s.len() - 1] {
                b'k' => 1024i64,
                b'm' => 1024 * 1024,
                _ => 1024 * 1024 * 1024,
            };
            (prefix, mult)
        }
        None => (s.as_str(), 1),
    };
    digits
        .parse::<i64>()
        .map(|n| n * multiplier)
        .map_err(|_| CoreError::InvalidState(format!("invalid memory limit '{}'", s)))
}

/// Owner uid:gid of a path, on platforms where it matters
#[cfg(unix)]
fn path_owner(path: &Path) -> Option<(u32, u32)> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.uid(), meta.gid()))
}

/// Group id owning a path (for docker socket access)
#[cfg(unix)]
fn path_gid(path: &Path) -> Option<u32> {
    path_owner(path).map(|(_, gid)| gid)
}

/// Detached-worktree detection: `.git` is a file pointing at the real gitdir
/// elsewhere on the host. Mount that repository's `.git` directory at its
/// exact host path so in-container git resolves the reference.
fn worktree_gitdir_mount(workspace: &Path) -> Option<MountSpec> {
    let git_file = workspace.join(".git");
    if !git_file.is_file() {
        return None;
    }
    let content = std::fs::read_to_string(&git_file).ok()?;
    let gitdir = content.strip_prefix("gitdir:")?.trim();
    let gitdir = if Path::new(gitdir).is_absolute() {
        PathBuf::from(gitdir)
    } else {
        workspace.join(gitdir)
    };

    let root = gitdir
        .ancestors()
        .find(|a| a.file_name().map(|n| n == ".git").unwrap_or(false))
        .map(Path::to_path_buf)
        .unwrap_or(gitdir);
    let host_path = root.to_string_lossy().to_string();
    Some(MountSpec::bind(host_path.clone(), host_path, false))
}

/// Resolve a user mount source: expand `~`, then make relative paths
/// workspace-relative
fn resolve_mount_source(source: &str, workspace: &Path) -> String {
    let expanded = shellexpand::tilde(source).to_string();
    let path = Path::new(&expanded);
    if path.is_absolute() {
        expanded
    } else {
        workspace.join(path).to_string_lossy().to_string()
    }
}

/// Decide the network mode per the rules in the run design:
/// host only when the runtime supports it, no ports are published, and a
/// per-run proxy exists; bridge when anything needs the network; empty
/// otherwise. A per-run network (services/sidecars) overrides both.
fn network_mode(inputs: &ComposeInputs) -> (Option<String>, bool) {
    if let Some(network) = inputs.run_network {
        return (Some(network.to_string()), false);
    }
    let has_ports = !inputs.config.ports.is_empty();
    let has_proxy = inputs.proxy.is_some();

    if inputs.supports_host_network && !has_ports && has_proxy {
        (Some("host".to_string()), true)
    } else if has_ports || has_proxy {
        (Some("bridge".to_string()), false)
    } else {
        (None, false)
    }
}

/// Assemble the full container plan
pub fn compose_plan(inputs: &ComposeInputs) -> Result<ComposedPlan> {
    let config = inputs.config;
    let mut container = CreateContainerConfig {
        image: inputs.image.to_string(),
        name: Some(format!("moat-{}", inputs.name)),
        cmd: Some(inputs.cmd.clone()),
        working_dir: Some(CONTAINER_WORKSPACE_DIR.to_string()),
        hostname: Some(inputs.name.to_string()),
        tty: inputs.tty,
        stdin_open: inputs.interactive,
        ..Default::default()
    };

    container
        .labels
        .insert("moat.run-id".to_string(), inputs.run_id.to_string());
    container
        .labels
        .insert("moat.name".to_string(), inputs.name.to_string());

    // Workspace, always read-write at the fixed path
    container.mounts.push(MountSpec::bind(
        inputs.workspace.to_string_lossy().to_string(),
        CONTAINER_WORKSPACE_DIR,
        false,
    ));

    if let Some(mount) = worktree_gitdir_mount(inputs.workspace) {
        container.mounts.push(mount);
    }

    // User mounts, workspace-relative unless absolute
    for entry in &config.mounts {
        container.mounts.push(MountSpec::bind(
            resolve_mount_source(&entry.source, inputs.workspace),
            entry.target.clone(),
            entry.read_only,
        ));
    }

    // Named volumes: per-agent per-name host directories owned by the
    // current user
    for volume in &config.volumes {
        let host_dir = inputs.volumes_root.join(inputs.name).join(&volume.name);
        std::fs::create_dir_all(&host_dir)?;
        container.mounts.push(MountSpec {
            kind: MountKind::Bind,
            source: host_dir.to_string_lossy().to_string(),
            target: volume.target.clone(),
            read_only: false,
        });
    }

    container.mounts.extend_from_slice(inputs.bound_mounts);
    container.mounts.extend_from_slice(inputs.ssh_mounts);

    if let Some(ca_dir) = inputs.ca_host_dir {
        container.mounts.push(MountSpec::bind(
            ca_dir.to_string_lossy().to_string(),
            CONTAINER_CA_DIR,
            true,
        ));
    }

    // Environment, lowest priority first
    let mut env: Vec<(String, String)> = Vec::new();
    if let Some((host, port, token)) = &inputs.proxy {
        env.extend(proxy_env(host, *port, token.as_deref()));
    }
    env.extend_from_slice(inputs.bound_env);
    env.extend_from_slice(inputs.ssh_env);
    env.extend(config.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    for name in &config.secrets {
        if let Ok(value) = std::env::var(name) {
            env.push((name.clone(), value));
        } else {
            tracing::warn!("Secret '{}' not set in the host environment", name);
        }
    }
    env.extend(
        inputs
            .explicit_env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    for (key, value) in env {
        container.env.insert(key, value);
    }

    // Ports: host side auto-assigned, discovered after start
    for port in config.ports.values() {
        container.ports.push(PortSpec {
            container_port: *port,
            host_port: None,
            protocol: "tcp".to_string(),
        });
    }

    let (mode, host_network) = network_mode(inputs);
    container.network_mode = mode;
    if !host_network
        && container.network_mode.is_some()
        && inputs.runtime_kind == RuntimeKind::Docker
    {
        container
            .extra_hosts
            .push("host.docker.internal:host-gateway".to_string());
    }

    // Container user: only on Linux with a native Docker daemon, and only
    // when the workspace owner differs from the image's sandbox user
    if cfg!(target_os = "linux") && inputs.runtime_kind == RuntimeKind::Docker {
        #[cfg(unix)]
        if let Some((uid, gid)) = path_owner(inputs.workspace) {
            if uid != SANDBOX_UID {
                container.user = Some(format!("{}:{}", uid, gid));
            }
        }
    }

    if config.network.policy == NetworkPolicy::Strict {
        container.cap_add.push("NET_ADMIN".to_string());
    }

    let mut privileged_reason = None;
    if config.dependencies.docker == DockerAccess::Dind {
        container.privileged = true;
        privileged_reason = Some("docker-in-docker dependency".to_string());
    }

    if config.dependencies.docker == DockerAccess::Socket {
        container.mounts.push(MountSpec::bind(
            DOCKER_SOCKET_PATH,
            DOCKER_SOCKET_PATH,
            false,
        ));
        #[cfg(unix)]
        if let Some(gid) = path_gid(Path::new(DOCKER_SOCKET_PATH)) {
            container.group_add.push(gid.to_string());
        }
    }

    container.cpus = config.limits.cpus;
    if let Some(memory) = &config.limits.memory {
        container.memory_bytes = Some(parse_memory(memory)?);
    }

    Ok(ComposedPlan {
        container,
        host_network,
        privileged_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use moat_config::{LimitsConfig, MountEntry, NetworkConfig};

    fn base_inputs<'a>(
        workspace: &'a Path,
        config: &'a AgentConfig,
        volumes_root: &'a Path,
        explicit_env: &'a HashMap<String, String>,
    ) -> ComposeInputs<'a> {
        ComposeInputs {
            run_id: "run_0123456789ab",
            name: "quiet-otter",
            workspace,
            image: "sandbox:latest",
            cmd: vec!["/bin/bash".to_string()],
            config,
            explicit_env,
            bound_env: &[],
            bound_mounts: &[],
            proxy: None,
            ssh_env: &[],
            ssh_mounts: &[],
            ca_host_dir: None,
            volumes_root,
            runtime_kind: RuntimeKind::Docker,
            supports_host_network: true,
            run_network: None,
            tty: false,
            interactive: false,
        }
    }

    #[test]
    fn test_workspace_mounted_read_write() {
        let tmp = tempfile::tempdir().unwrap();
        let config = AgentConfig::default();
        let env = HashMap::new();
        let plan =
            compose_plan(&base_inputs(tmp.path(), &config, tmp.path(), &env)).unwrap();

        let ws = &plan.container.mounts[0];
        assert_eq!(ws.target, CONTAINER_WORKSPACE_DIR);
        assert!(!ws.read_only);
        assert_eq!(
            plan.container.working_dir.as_deref(),
            Some(CONTAINER_WORKSPACE_DIR)
        );
    }

    #[test]
    fn test_host_network_requires_proxy_and_no_ports() {
        let tmp = tempfile::tempdir().unwrap();
        let env = HashMap::new();
        let config = AgentConfig::default();

        // No proxy: nothing needs the network
        let plan =
            compose_plan(&base_inputs(tmp.path(), &config, tmp.path(), &env)).unwrap();
        assert_eq!(plan.container.network_mode, None);
        assert!(!plan.host_network);

        // Proxy and no ports: host
        let mut inputs = base_inputs(tmp.path(), &config, tmp.path(), &env);
        inputs.proxy = Some(("127.0.0.1".to_string(), 8377, None));
        let plan = compose_plan(&inputs).unwrap();
        assert_eq!(plan.container.network_mode.as_deref(), Some("host"));
        assert!(plan.host_network);

        // Proxy with published ports: bridge with the host-gateway alias
        let mut ported = AgentConfig::default();
        ported.ports.insert("web".to_string(), 3000);
        let mut inputs = base_inputs(tmp.path(), &ported, tmp.path(), &env);
        inputs.proxy = Some(("host.docker.internal".to_string(), 8377, None));
        let plan = compose_plan(&inputs).unwrap();
        assert_eq!(plan.container.network_mode.as_deref(), Some("bridge"));
        assert!(plan
            .container
            .extra_hosts
            .contains(&"host.docker.internal:host-gateway".to_string()));
    }

    #[test]
    fn test_no_host_network_when_unsupported() {
        let tmp = tempfile::tempdir().unwrap();
        let env = HashMap::new();
        let config = AgentConfig::default();
        let mut inputs = base_inputs(tmp.path(), &config, tmp.path(), &env);
        inputs.supports_host_network = false;
        inputs.proxy = Some(("host.docker.internal".to_string(), 8377, None));
        let plan = compose_plan(&inputs).unwrap();
        assert_eq!(plan.container.network_mode.as_deref(), Some("bridge"));
    }

    #[test]
    fn test_run_network_overrides() {
        let tmp = tempfile::tempdir().unwrap();
        let env = HashMap::new();
        let config = AgentConfig::default();
        let mut inputs = base_inputs(tmp.path(), &config, tmp.path(), &env);
        inputs.proxy = Some(("h".to_string(), 1, None));
        inputs.run_network = Some("moat-net-abc");
        let plan = compose_plan(&inputs).unwrap();
        assert_eq!(plan.container.network_mode.as_deref(), Some("moat-net-abc"));
    }

    #[test]
    fn test_relative_mounts_resolve_against_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::default();
        config.mounts.push(MountEntry {
            source: "./data".to_string(),
            target: "/data".to_string(),
            read_only: true,
        });
        let env = HashMap::new();
        let plan =
            compose_plan(&base_inputs(tmp.path(), &config, tmp.path(), &env)).unwrap();

        let mount = plan
            .container
            .mounts
            .iter()
            .find(|m| m.target == "/data")
            .unwrap();
        assert!(mount.source.starts_with(tmp.path().to_str().unwrap()));
        assert!(mount.read_only);
    }

    #[test]
    fn test_named_volume_dirs_created_per_agent() {
        let tmp = tempfile::tempdir().unwrap();
        let volumes_root = tmp.path().join("volumes");
        let mut config = AgentConfig::default();
        config.volumes.push(
            moat_config::VolumeEntry::try_from("cargo-cache:/home/agent/.cargo".to_string())
                .unwrap(),
        );
        let env = HashMap::new();
        let plan =
            compose_plan(&base_inputs(tmp.path(), &config, &volumes_root, &env)).unwrap();

        let expected = volumes_root.join("quiet-otter").join("cargo-cache");
        assert!(expected.is_dir());
        assert!(plan
            .container
            .mounts
            .iter()
            .any(|m| m.source == expected.to_string_lossy() && m.target == "/home/agent/.cargo"));
    }

    #[test]
    fn test_worktree_gitdir_mounted_at_host_path() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        let gitdir = repo.join(".git").join("worktrees").join("wt");
        std::fs::create_dir_all(&gitdir).unwrap();
        let workspace = tmp.path().join("wt");
        std::fs::create_dir_all(&workspace).unwrap();
        std::fs::write(
            workspace.join(".git"),
            format!("gitdir: {}\n", gitdir.display()),
        )
        .unwrap();

        let config = AgentConfig::default();
        let env = HashMap::new();
        let plan =
            compose_plan(&base_inputs(&workspace, &config, tmp.path(), &env)).unwrap();

        let expected = repo.join(".git").to_string_lossy().to_string();
        assert!(plan
            .container
            .mounts
            .iter()
            .any(|m| m.source == expected && m.target == expected && !m.read_only));
    }

    #[test]
    fn test_strict_policy_adds_net_admin() {
        let tmp = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            network: NetworkConfig {
                policy: NetworkPolicy::Strict,
                allow: vec![],
            },
            ..Default::default()
        };
        let env = HashMap::new();
        let plan =
            compose_plan(&base_inputs(tmp.path(), &config, tmp.path(), &env)).unwrap();
        assert!(plan.container.cap_add.contains(&"NET_ADMIN".to_string()));
    }

    #[test]
    fn test_dind_sets_privileged_with_reason() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::default();
        config.dependencies.docker = DockerAccess::Dind;
        let env = HashMap::new();
        let plan =
            compose_plan(&base_inputs(tmp.path(), &config, tmp.path(), &env)).unwrap();
        assert!(plan.container.privileged);
        assert!(plan.privileged_reason.is_some());
    }

    #[test]
    fn test_socket_docker_mounts_socket() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::default();
        config.dependencies.docker = DockerAccess::Socket;
        let env = HashMap::new();
        let plan =
            compose_plan(&base_inputs(tmp.path(), &config, tmp.path(), &env)).unwrap();
        assert!(plan
            .container
            .mounts
            .iter()
            .any(|m| m.source == DOCKER_SOCKET_PATH && m.target == DOCKER_SOCKET_PATH));
        assert!(!plan.container.privileged);
    }

    #[test]
    fn test_env_precedence_explicit_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::default();
        config
            .env
            .insert("SHARED".to_string(), "from-config".to_string());
        let mut explicit = HashMap::new();
        explicit.insert("SHARED".to_string(), "from-cli".to_string());

        let bound = vec![("SHARED".to_string(), "from-provider".to_string())];
        let mut inputs = base_inputs(tmp.path(), &config, tmp.path(), &explicit);
        inputs.bound_env = &bound;
        let plan = compose_plan(&inputs).unwrap();
        assert_eq!(plan.container.env["SHARED"], "from-cli");
    }

    #[test]
    fn test_proxy_env_included_when_proxy_present() {
        let tmp = tempfile::tempdir().unwrap();
        let config = AgentConfig::default();
        let env = HashMap::new();
        let mut inputs = base_inputs(tmp.path(), &config, tmp.path(), &env);
        inputs.proxy = Some(("host.docker.internal".to_string(), 8377, None));
        inputs.ca_host_dir = Some(tmp.path());
        let plan = compose_plan(&inputs).unwrap();

        assert_eq!(
            plan.container.env["HTTPS_PROXY"],
            "http://host.docker.internal:8377"
        );
        assert!(plan.container.env["NO_PROXY"].contains("localhost"));
        // CA dir mounted read-only at the fixed path
        assert!(plan
            .container
            .mounts
            .iter()
            .any(|m| m.target == CONTAINER_CA_DIR && m.read_only));
    }

    #[test]
    fn test_limits() {
        let tmp = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            limits: LimitsConfig {
                cpus: Some(1.5),
                memory: Some("2g".to_string()),
            },
            ..Default::default()
        };
        let env = HashMap::new();
        let plan =
            compose_plan(&base_inputs(tmp.path(), &config, tmp.path(), &env)).unwrap();
        assert_eq!(plan.container.cpus, Some(1.5));
        assert_eq!(plan.container.memory_bytes, Some(2 * 1024 * 1024 * 1024));
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("512").unwrap(), 512);
        assert_eq!(parse_memory("64k").unwrap(), 64 * 1024);
        assert_eq!(parse_memory("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory("2G").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_memory("lots").is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_workspace_owner_mapped_on_linux() {
        let tmp = tempfile::tempdir().unwrap();
        let config = AgentConfig::default();
        let env = HashMap::new();
        let plan =
            compose_plan(&base_inputs(tmp.path(), &config, tmp.path(), &env)).unwrap();
        // The tempdir is owned by the test user, never uid 5000
        let user = plan.container.user.expect("expected uid:gid mapping");
        assert!(user.contains(':'));
    }
}
