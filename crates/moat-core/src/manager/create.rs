//! Run creation: ordered resource acquisition with full rollback
//!
//! Acquisition order: name -> grant validation -> storage -> proxy ->
//! credential binding -> SSH agent -> token refresh -> image -> network /
//! services / sidecar -> container. Any failure releases everything
//! acquired so far, in reverse, before the error returns.

use super::Manager;
use crate::audit::{AuditEvent, AuditLog};
use crate::compose::{compose_plan, ComposeInputs};
use crate::credentials::{
    bind_grants, prepare_ca_dir, validate_grants, BindContext, BoundCredentials,
    spawn_refresh_loop,
};
use crate::grants::{parse_grants, Grant};
use crate::ids::{allocate_name, generate_auth_token, generate_run_id, sanitize_name};
use crate::options::CreateOptions;
use crate::proxy::{AuthProxy, ProxyLaunchOptions};
use crate::run::{Run, RunParams};
use crate::ssh::{setup_ssh_agent, SshAgentProxy};
use crate::storage::RunStorage;
use crate::{CoreError, Result, BUILDKIT_ALIAS, RUN_ID_PREFIX};
use moat_config::{DockerAccess, NetworkPolicy};
use moat_runtime::{BuildOptions, ContainerId, ContainerRuntime, ServiceSpec};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

/// Fallback when the image does not declare a home directory
const DEFAULT_CONTAINER_HOME: &str = "/home/agent";

/// Resources acquired so far; released in reverse on any failure
#[derive(Default)]
struct Rollback {
    storage: Option<RunStorage>,
    proxy: Option<Arc<dyn AuthProxy>>,
    cleanup_paths: Vec<std::path::PathBuf>,
    ssh: Option<Arc<SshAgentProxy>>,
    refresh: Option<tokio::task::JoinHandle<()>>,
    network: Option<String>,
    services: Vec<ContainerId>,
    buildkit: Option<ContainerId>,
    container: Option<ContainerId>,
}

impl Rollback {
    /// Best-effort release, reverse acquisition order
    async fn abort(self, runtime: &dyn ContainerRuntime) {
        if let Some(container) = self.container {
            if let Err(e) = runtime.remove_container(&container, true).await {
                tracing::warn!("Rollback: failed to remove container {}: {}", container, e);
            }
        }
        if let Some(buildkit) = self.buildkit {
            let _ = runtime.remove_container(&buildkit, true).await;
        }
        for service in self.services {
            let _ = runtime.remove_container(&service, true).await;
        }
        if let Some(network) = self.network {
            if let Some(networks) = runtime.networks() {
                let _ = networks.disconnect_all(&network).await;
                if let Err(e) = networks.remove_network(&network).await {
                    tracing::warn!("Rollback: failed to remove network {}: {}", network, e);
                }
            }
        }
        if let Some(refresh) = self.refresh {
            refresh.abort();
        }
        if let Some(ssh) = self.ssh {
            ssh.stop().await;
        }
        if let Some(proxy) = self.proxy {
            proxy.stop().await;
        }
        for path in self.cleanup_paths {
            let _ = std::fs::remove_dir_all(&path);
        }
        if let Some(storage) = self.storage {
            if let Err(e) = storage.remove() {
                tracing::warn!("Rollback: failed to remove storage: {}", e);
            }
        }
    }
}

/// Minimal sandbox image recipe: the base plus the packages providers and
/// the agent config imply. Anything richer comes from an external generator.
fn sandbox_dockerfile(base: &str, packages: &[String]) -> String {
    let mut dockerfile = format!("FROM {}\n", base);
    if !packages.is_empty() {
        dockerfile.push_str(&format!(
            "RUN apt-get update && apt-get install -y --no-install-recommends {} \
             && rm -rf /var/lib/apt/lists/*\n",
            packages.join(" ")
        ));
    }
    dockerfile
}

fn stdin_is_tty() -> bool {
    unsafe { nix::libc::isatty(0) == 1 }
}

impl Manager {
    /// Create a run. On return the container exists in state `Created` and
    /// the run is registered; on error the host is back to its pre-call
    /// state.
    pub async fn create(&self, options: CreateOptions) -> Result<Arc<Run>> {
        let mut rollback = Rollback::default();
        match self.create_inner(options, &mut rollback).await {
            Ok(run) => Ok(run),
            Err(e) => {
                rollback.abort(self.runtime.as_ref()).await;
                Err(e)
            }
        }
    }

    async fn create_inner(
        &self,
        options: CreateOptions,
        rollback: &mut Rollback,
    ) -> Result<Arc<Run>> {
        let workspace = options.workspace.canonicalize().map_err(|e| {
            CoreError::InvalidState(format!(
                "workspace {} is not usable: {}",
                options.workspace.display(),
                e
            ))
        })?;
        let grants = parse_grants(&options.grants)?;

        // Name allocation; uniqueness spans active runs and the routing table
        let active = self.active_names().await;
        let explicit = options.name.as_deref().map(sanitize_name);
        let name = allocate_name(explicit.as_deref(), |candidate| {
            self.routes.contains(candidate) || active.iter().any(|n| n == candidate)
        })?;

        // Validate every grant before acquiring anything
        validate_grants(&grants, &self.providers, self.store.as_ref(), &options.config).await?;

        let id = generate_run_id();
        let storage = RunStorage::create(&self.runs_root, &id)?;
        rollback.storage = Some(storage.clone());

        let audit = Arc::new(AuditLog::open(&storage.audit_db_path())?);

        // Per-run proxy, when anything needs one
        let needs_proxy = grants.iter().any(|g| !g.is_ssh())
            || !options.config.mcp.is_empty()
            || options.config.network.policy == NetworkPolicy::Strict;
        let proxy = if needs_proxy {
            Some(self.spawn_proxy(&id, &grants, &options, &storage).await?)
        } else {
            None
        };
        rollback.proxy = proxy.clone();

        // Decide up front whether host networking will apply, so the proxy
        // address in the container env matches the final network mode
        let needs_network =
            !options.config.services.is_empty() || options.config.dependencies.docker == DockerAccess::Dind;
        let host_network_planned = self.runtime.supports_host_network()
            && options.config.ports.is_empty()
            && proxy.is_some()
            && !needs_network;
        let proxy_tuple = proxy.as_ref().map(|p| {
            let host = if host_network_planned {
                "127.0.0.1".to_string()
            } else {
                self.runtime.get_host_address()
            };
            (host, p.host_port(), p.auth_token())
        });

        // Cert-only CA staging for the container mount
        let ca_host_dir = match &proxy {
            Some(p) => {
                prepare_ca_dir(&p.ca_source_dir(), &storage.ca_dir())?;
                Some(storage.ca_dir())
            }
            None => None,
        };

        let container_home = match self.runtime.get_image_home_dir(&self.global.image).await {
            Ok(Some(home)) => home,
            _ => DEFAULT_CONTAINER_HOME.to_string(),
        };

        // Bind provider grants into the proxy
        let mut bound = match (&proxy, &proxy_tuple) {
            (Some(proxy), Some((host, port, token))) => {
                let ctx = BindContext {
                    proxy_host: host.clone(),
                    proxy_port: *port,
                    auth_token: token.clone(),
                    container_home,
                    staging_root: storage.staging_dir(),
                };
                let bound =
                    bind_grants(&grants, &self.providers, self.store.as_ref(), proxy, &ctx).await?;
                rollback.cleanup_paths = bound.cleanup_paths.values().cloned().collect();
                for grant in grants.iter().filter(|g| g.provider_name().is_some()) {
                    let _ = storage.append_jsonl(
                        &storage.secrets_log_path(),
                        &json!({"event": "grant-bound", "grant": grant.to_string()}),
                    );
                }
                bound
            }
            _ => BoundCredentials::default(),
        };

        // Filtered SSH agent for ssh: grants
        let ssh_hosts: Vec<String> = grants
            .iter()
            .filter_map(|g| match g {
                Grant::Ssh { host } => Some(host.clone()),
                _ => None,
            })
            .collect();
        let (ssh_proxy, ssh_env, ssh_mounts) = match setup_ssh_agent(
            &ssh_hosts,
            self.store.as_ref(),
            storage.dir(),
            Some(Arc::clone(&audit)),
            self.runtime.supports_host_network(),
            &self.runtime.get_host_address(),
        )
        .await?
        {
            Some(setup) => (Some(Arc::new(setup.proxy)), setup.env, setup.mounts),
            None => (None, Vec::new(), Vec::new()),
        };
        rollback.ssh = ssh_proxy.clone();

        // Token refresh loop
        let refresh_targets = std::mem::take(&mut bound.refresh_targets);
        if let Some(proxy) = &proxy {
            rollback.refresh = spawn_refresh_loop(
                refresh_targets,
                Arc::clone(proxy),
                Arc::clone(&self.store),
                self.cancel.child_token(),
            );
        }

        // Image resolution / build
        let image = self
            .resolve_image(&name, &id, &options, &bound, &storage)
            .await?;

        // Per-run network, service containers, build sidecar
        let mut network_id = None;
        let mut service_ids: HashMap<String, ContainerId> = HashMap::new();
        let mut buildkit_id = None;
        if needs_network {
            let networks = self.runtime.networks().ok_or_else(|| {
                CoreError::InvalidState("runtime does not support per-run networks".to_string())
            })?;
            let network = networks.create_network(&format!("moat-{}", name)).await?;
            rollback.network = Some(network.clone());

            if !options.config.services.is_empty() {
                let services = self.runtime.services().ok_or_else(|| {
                    CoreError::InvalidState(
                        "runtime does not support service containers".to_string(),
                    )
                })?;
                for service in &options.config.services {
                    let spec = ServiceSpec {
                        name: format!("moat-{}-{}", name, service.name),
                        alias: service.name.clone(),
                        image: service.image.clone(),
                        env: service.env.clone(),
                        network: network.clone(),
                    };
                    let cid = services
                        .start_service(&spec)
                        .await
                        .map_err(|e| CoreError::ContainerCreateFailed(e.to_string()))?;
                    rollback.services.push(cid.clone());
                    service_ids.insert(service.name.clone(), cid);
                }
            }

            if options.config.dependencies.docker == DockerAccess::Dind {
                if let Some(sidecars) = self.runtime.sidecars() {
                    let cid = sidecars
                        .start_buildkit(&network, BUILDKIT_ALIAS)
                        .await
                        .map_err(|e| CoreError::ContainerCreateFailed(e.to_string()))?;
                    rollback.buildkit = Some(cid.clone());
                    buildkit_id = Some(cid);
                }
            }
            network_id = Some(network);
        }

        // Compose the container plan
        let tty = options.interactive && stdin_is_tty();
        let volumes_root = self.global.volumes_dir()?;
        let plan = compose_plan(&ComposeInputs {
            run_id: &id,
            name: &name,
            workspace: &workspace,
            image: &image,
            cmd: options.effective_cmd(),
            config: &options.config,
            explicit_env: &options.env,
            bound_env: &bound.env,
            bound_mounts: &bound.mounts,
            proxy: proxy_tuple.clone(),
            ssh_env: &ssh_env,
            ssh_mounts: &ssh_mounts,
            ca_host_dir: ca_host_dir.as_deref(),
            volumes_root: &volumes_root,
            runtime_kind: self.runtime.kind(),
            supports_host_network: self.runtime.supports_host_network(),
            run_network: network_id.as_deref(),
            tty,
            interactive: options.interactive,
        })?;

        if let Some(reason) = &plan.privileged_reason {
            audit.append_best_effort(&AuditEvent::new(
                "privileged-mode",
                json!({"run": id, "reason": reason}),
            ));
        }

        let container_id = self
            .runtime
            .create_container(&plan.container)
            .await
            .map_err(|e| CoreError::ContainerCreateFailed(e.to_string()))?;
        rollback.container = Some(container_id.clone());

        // Assemble and register the run
        let run = Arc::new(Run::new(RunParams {
            id,
            name,
            workspace,
            image,
            grants,
            ports: options.config.ports.clone(),
            interactive: options.interactive,
            keep_container: options.keep_container,
            agent_kind: options.agent_kind.clone(),
            container_id,
            storage,
        }));
        if options.config.network.policy == NetworkPolicy::Strict {
            if let Some((host, port, _)) = &proxy_tuple {
                *run.firewall.lock().unwrap() = Some(moat_runtime::FirewallConfig {
                    proxy_host: host.clone(),
                    proxy_port: *port,
                    allowed_hosts: options.config.network.allow.clone(),
                });
            }
        }
        *run.auth_proxy.lock().unwrap() = proxy;
        *run.ssh_proxy.lock().unwrap() = ssh_proxy;
        *run.service_containers.lock().unwrap() = service_ids;
        *run.network_id.lock().unwrap() = network_id;
        *run.buildkit_id.lock().unwrap() = buildkit_id;
        *run.cleanup_paths.lock().unwrap() = std::mem::take(&mut bound.cleanup_paths);
        *run.audit.lock().unwrap() = Some(audit);

        run.persist_best_effort();
        self.register_run(Arc::clone(&run)).await?;
        *run.refresh_task.lock().unwrap() = rollback.refresh.take();

        // Everything now belongs to the run
        *rollback = Rollback::default();
        tracing::info!(run = %run.id, name = %run.name, "Run created");
        Ok(run)
    }

    async fn spawn_proxy(
        &self,
        run_id: &str,
        grants: &[Grant],
        options: &CreateOptions,
        storage: &RunStorage,
    ) -> Result<Arc<dyn AuthProxy>> {
        let launcher = self.proxy_launcher.as_ref().ok_or_else(|| {
            CoreError::ProxyStartFailed("no proxy launcher configured".to_string())
        })?;

        let bind_all = !self.runtime.supports_host_network();
        let auth_token = if bind_all {
            Some(generate_auth_token())
        } else {
            None
        };

        let proxy = launcher
            .launch(ProxyLaunchOptions {
                run_id: run_id.to_string(),
                bind_all,
                auth_token: auth_token.clone(),
                store: Arc::clone(&self.store),
            })
            .await
            .map_err(|e| CoreError::ProxyStartFailed(e.to_string()))?;

        proxy.set_credential_store(Arc::clone(&self.store));
        if bind_all {
            proxy.set_bind_addr("0.0.0.0");
            if let Some(token) = &auth_token {
                proxy.set_auth_token(token);
            }
        }

        let grant_strings: Vec<String> = grants.iter().map(|g| g.to_string()).collect();
        proxy.set_network_policy(
            options.config.network.policy,
            &options.config.network.allow,
            &grant_strings,
        );
        if !options.config.mcp.is_empty() {
            proxy.set_mcp_servers(&options.config.mcp);
        }

        let log_storage = storage.clone();
        proxy.set_logger(Box::new(move |record| {
            if let Ok(value) = serde_json::to_value(&record) {
                let path = log_storage.network_log_path();
                if let Err(e) = log_storage.append_jsonl(&path, &value) {
                    tracing::warn!("Failed to append network log record: {}", e);
                }
            }
        }));

        Ok(proxy)
    }

    async fn resolve_image(
        &self,
        name: &str,
        run_id: &str,
        options: &CreateOptions,
        bound: &BoundCredentials,
        storage: &RunStorage,
    ) -> Result<String> {
        let mut packages = bound.packages.clone();
        for package in &options.config.dependencies.packages {
            if !packages.contains(package) {
                packages.push(package.clone());
            }
        }

        let builds = match self.runtime.builds() {
            Some(builds) if !packages.is_empty() || options.rebuild => builds,
            _ => return Ok(self.global.image.clone()),
        };

        let dockerfile = sandbox_dockerfile(&self.global.image, &packages);
        std::fs::write(storage.dockerfile_path(), &dockerfile)?;

        let tag = format!("moat/{}:{}", name, run_id.trim_start_matches(RUN_ID_PREFIX));
        let exists = builds.image_exists(&tag).await.unwrap_or(false);
        if options.rebuild || !exists {
            builds
                .build_image(
                    &dockerfile,
                    &tag,
                    &BuildOptions {
                        no_cache: options.rebuild,
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| CoreError::ImageBuildFailed(e.to_string()))?;
        }
        Ok(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credential;
    use crate::run::RunState;
    use crate::test_support::*;
    use crate::CA_CERT_FILE;

    #[tokio::test]
    async fn test_create_reaches_created_state() {
        let fixture = TestManager::builder().build().await;
        let run = fixture.create_default().await.unwrap();

        assert_eq!(run.state(), RunState::Created);
        assert!(run.id.starts_with("run_"));
        assert!(run.storage.metadata_path().exists());
        assert!(fixture.runtime.was_called_create());
    }

    #[tokio::test]
    async fn test_missing_credential_acquires_nothing() {
        let fixture = TestManager::builder().without_github_credential().build().await;
        let err = fixture.create_default().await.unwrap_err();
        assert!(matches!(err, CoreError::GrantNotConfigured(_)));

        // Nothing was acquired: no proxy launched, no container, no storage
        assert_eq!(fixture.launcher.launched_count(), 0);
        assert!(!fixture.runtime.was_called_create());
        assert_eq!(
            RunStorage::list_runs(&fixture.runs_root()).unwrap().len(),
            0
        );
    }

    #[tokio::test]
    async fn test_container_create_failure_rolls_back_everything() {
        let fixture = TestManager::builder().build().await;
        fixture.runtime.fail_create("boom");

        let err = fixture.create_default().await.unwrap_err();
        assert!(matches!(err, CoreError::ContainerCreateFailed(_)));

        // Proxy stopped, storage removed, registry empty
        assert_eq!(fixture.launcher.launched_count(), 1);
        assert!(fixture.launcher.all_stopped());
        assert_eq!(
            RunStorage::list_runs(&fixture.runs_root()).unwrap().len(),
            0
        );
        assert!(fixture.manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_explicit_name_conflict() {
        let fixture = TestManager::builder().build().await;
        fixture.create_named("agent-a").await.unwrap();
        let err = fixture.create_named("agent-a").await.unwrap_err();
        assert!(matches!(err, CoreError::NameConflict(_)));
    }

    #[tokio::test]
    async fn test_name_conflict_with_routing_table() {
        let fixture = TestManager::builder().build().await;
        fixture
            .manager
            .routes()
            .register("taken", vec![]);
        let err = fixture.create_named("taken").await.unwrap_err();
        assert!(matches!(err, CoreError::NameConflict(_)));
    }

    #[tokio::test]
    async fn test_ca_dir_contains_only_cert() {
        let fixture = TestManager::builder().build().await;
        let run = fixture.create_default().await.unwrap();

        let entries: Vec<String> = std::fs::read_dir(run.storage.ca_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries, vec![CA_CERT_FILE.to_string()]);
    }

    #[tokio::test]
    async fn test_proxy_env_and_mounts_in_plan() {
        let fixture = TestManager::builder().build().await;
        fixture.create_default().await.unwrap();

        let config = fixture.runtime.last_create_config().unwrap();
        assert!(config.env.contains_key("HTTPS_PROXY"));
        assert!(config.env.contains_key("NO_PROXY"));
        assert!(config
            .mounts
            .iter()
            .any(|m| m.target == crate::CONTAINER_CA_DIR && m.read_only));
        // Credential registered on the proxy, secret kept out of env
        let proxy = fixture.launcher.last_proxy().unwrap();
        assert!(!proxy.credentials.lock().unwrap().is_empty());
        for value in config.env.values() {
            assert!(!value.contains("gho_testtoken"));
        }
    }

    #[tokio::test]
    async fn test_no_proxy_for_plain_run() {
        let fixture = TestManager::builder().build().await;
        let mut options = fixture.default_options();
        options.grants = vec![];
        fixture.manager.create(options).await.unwrap();
        assert_eq!(fixture.launcher.launched_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_provider_rejected_before_acquisition() {
        let fixture = TestManager::builder().build().await;
        let mut options = fixture.default_options();
        options.grants = vec!["nonesuch".to_string()];
        let err = fixture.manager.create(options).await.unwrap_err();
        assert!(matches!(err, CoreError::UnknownProvider(_)));
        assert_eq!(fixture.launcher.launched_count(), 0);
    }

    #[tokio::test]
    async fn test_mcp_grant_requires_config_server() {
        let fixture = TestManager::builder().build().await;
        let mut options = fixture.default_options();
        options.grants = vec!["mcp-context7".to_string()];
        let err = fixture.manager.create(options).await.unwrap_err();
        assert!(matches!(err, CoreError::McpGrantMissing(_)));
    }

    #[tokio::test]
    async fn test_services_get_network_and_rollback_on_failure() {
        let fixture = TestManager::builder().build().await;
        let mut options = fixture.default_options();
        options.config.services.push(moat_config::ServiceConfig {
            name: "db".to_string(),
            image: "postgres:16".to_string(),
            env: Default::default(),
        });
        fixture.runtime.fail_create("late failure");

        let err = fixture.manager.create(options).await.unwrap_err();
        assert!(matches!(err, CoreError::ContainerCreateFailed(_)));
        // The per-run network was created, then removed during rollback
        assert!(fixture.runtime.network_created());
        assert!(fixture.runtime.networks_all_removed());
    }

    #[tokio::test]
    async fn test_dockerfile_written_when_packages_present() {
        let fixture = TestManager::builder().build().await;
        // github grant implies git/gh packages, so an image build happens
        let run = fixture.create_default().await.unwrap();
        assert!(run.storage.dockerfile_path().exists());
        let contents = std::fs::read_to_string(run.storage.dockerfile_path()).unwrap();
        assert!(contents.starts_with("FROM "));
        assert!(contents.contains("git"));
        assert!(run.image.starts_with("moat/"));
    }

    #[tokio::test]
    async fn test_decryption_failure_surfaces_remediation() {
        let fixture = TestManager::builder().build().await;
        fixture.store.fail_decryption("github");
        fixture.store.insert(Credential::new("github", "zzz"));

        let err = fixture.create_default().await.unwrap_err();
        assert!(matches!(err, CoreError::GrantDecryptionFailed(_)));
        assert!(err.to_string().contains("moat grant github"));
    }
}
