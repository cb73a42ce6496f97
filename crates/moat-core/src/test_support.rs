//! Test support utilities for moat-core
//!
//! Provides MockRuntime, MockProxy, MemoryCredentialStore and a TestManager
//! fixture for unit and integration testing without a real container
//! runtime.

use crate::credentials::{Credential, CredentialStore, ProviderRegistry, SshKeyMapping};
use crate::manager::{Manager, ManagerOptions};
use crate::options::CreateOptions;
use crate::proxy::{
    AuthProxy, NetworkLogger, ProxyConfigurer, ProxyLaunchOptions, ProxyLauncher,
};
use crate::routes::RoutingTable;
use crate::run::Run;
use crate::{CoreError, Result};
use async_trait::async_trait;
use moat_config::{GlobalConfig, McpServerConfig, NetworkPolicy};
use moat_runtime::{
    AttachedIo, BuildManager, BuildOptions, ContainerId, ContainerRuntime, ContainerStatus,
    CreateContainerConfig, FirewallConfig, ImageId, LogEntry, LogStream, NetworkManager,
    PortBindingInfo, RuntimeError, RuntimeKind, ServiceManager, ServiceSpec, SidecarManager,
};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Records which methods were called on the mock runtime
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Create { name: Option<String> },
    Start { id: String },
    StartAttached { id: String },
    Attach { id: String },
    Stop { id: String },
    Remove { id: String, force: bool },
    Wait { id: String },
    State { id: String },
    Logs { id: String, follow: bool },
    LogsAll { id: String },
    ResizeTty { id: String, height: u16, width: u16 },
    Firewall { id: String },
    PortBindings { id: String },
    BuildImage { tag: String },
    ImageExists { tag: String },
    RemoveImage { tag: String },
    CreateNetwork { name: String },
    RemoveNetwork { id: String },
    DisconnectAll { id: String },
    StartService { name: String },
    StartBuildkit { alias: String },
    Ping,
    Close,
}

/// Configurable mock container runtime
pub struct MockRuntime {
    pub calls: Arc<Mutex<Vec<MockCall>>>,
    /// Known containers and their current status
    containers: Arc<Mutex<HashMap<String, ContainerStatus>>>,
    next_id: AtomicUsize,
    create_error: Arc<Mutex<Option<String>>>,
    start_error: Arc<Mutex<Option<String>>>,
    firewall_error: Arc<Mutex<Option<String>>>,
    wait_codes: Arc<Mutex<HashMap<String, i64>>>,
    wait_version: watch::Sender<u64>,
    /// Entries served by container_logs / container_logs_all
    pub log_entries: Arc<Mutex<Vec<LogEntry>>>,
    /// Bindings served by get_port_bindings
    pub port_bindings: Arc<Mutex<Vec<PortBindingInfo>>>,
    pub last_create: Arc<Mutex<Option<CreateContainerConfig>>>,
    /// Live networks, and every network ever created
    networks_live: Arc<Mutex<Vec<String>>>,
    networks_created: Arc<Mutex<Vec<String>>>,
    supports_host_network: AtomicBool,
    /// Bytes replayed by start_attached
    pub attach_output: Arc<Mutex<Vec<u8>>>,
    /// Exit code recorded automatically when start_attached output drains
    pub attach_exit_code: Arc<Mutex<i64>>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            containers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicUsize::new(1),
            create_error: Arc::new(Mutex::new(None)),
            start_error: Arc::new(Mutex::new(None)),
            firewall_error: Arc::new(Mutex::new(None)),
            wait_codes: Arc::new(Mutex::new(HashMap::new())),
            wait_version: watch::channel(0).0,
            log_entries: Arc::new(Mutex::new(Vec::new())),
            port_bindings: Arc::new(Mutex::new(Vec::new())),
            last_create: Arc::new(Mutex::new(None)),
            networks_live: Arc::new(Mutex::new(Vec::new())),
            networks_created: Arc::new(Mutex::new(Vec::new())),
            supports_host_network: AtomicBool::new(true),
            attach_output: Arc::new(Mutex::new(Vec::new())),
            attach_exit_code: Arc::new(Mutex::new(0)),
        }
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count<F: Fn(&MockCall) -> bool>(&self, filter: F) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| filter(c)).count()
    }

    pub fn was_called_create(&self) -> bool {
        self.call_count(|c| matches!(c, MockCall::Create { .. })) > 0
    }

    pub fn fail_create(&self, message: &str) {
        *self.create_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn fail_start(&self, message: &str) {
        *self.start_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn fail_firewall(&self, message: &str) {
        *self.firewall_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn set_host_network(&self, supported: bool) {
        self.supports_host_network.store(supported, Ordering::SeqCst);
    }

    pub fn last_create_config(&self) -> Option<CreateContainerConfig> {
        self.last_create.lock().unwrap().clone()
    }

    /// Let a blocked wait_container return with this exit code
    pub fn finish_container(&self, id: &str, code: i64) {
        self.wait_codes.lock().unwrap().insert(id.to_string(), code);
        if let Some(status) = self.containers.lock().unwrap().get_mut(id) {
            *status = ContainerStatus::Exited;
        }
        self.wait_version.send_modify(|v| *v += 1);
    }

    /// Make the container unknown to the runtime
    pub fn forget_container(&self, id: &str) {
        self.containers.lock().unwrap().remove(id);
    }

    pub fn set_container_state(&self, id: &str, status: ContainerStatus) {
        self.containers
            .lock()
            .unwrap()
            .insert(id.to_string(), status);
    }

    pub fn container_exists(&self, id: &str) -> bool {
        self.containers.lock().unwrap().contains_key(id)
    }

    pub fn network_created(&self) -> bool {
        !self.networks_created.lock().unwrap().is_empty()
    }

    pub fn networks_all_removed(&self) -> bool {
        self.networks_live.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create_container(
        &self,
        config: &CreateContainerConfig,
    ) -> moat_runtime::Result<ContainerId> {
        self.record(MockCall::Create {
            name: config.name.clone(),
        });
        if let Some(message) = self.create_error.lock().unwrap().clone() {
            return Err(RuntimeError::RuntimeError(message));
        }
        *self.last_create.lock().unwrap() = Some(config.clone());
        let id = format!("mock-ctr-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers
            .lock()
            .unwrap()
            .insert(id.clone(), ContainerStatus::Created);
        Ok(ContainerId::new(id))
    }

    async fn start_container(&self, id: &ContainerId) -> moat_runtime::Result<()> {
        self.record(MockCall::Start { id: id.0.clone() });
        if let Some(message) = self.start_error.lock().unwrap().clone() {
            return Err(RuntimeError::RuntimeError(message));
        }
        self.containers
            .lock()
            .unwrap()
            .insert(id.0.clone(), ContainerStatus::Running);
        Ok(())
    }

    async fn start_attached(&self, id: &ContainerId) -> moat_runtime::Result<AttachedIo> {
        self.record(MockCall::StartAttached { id: id.0.clone() });
        if let Some(message) = self.start_error.lock().unwrap().clone() {
            return Err(RuntimeError::RuntimeError(message));
        }
        self.containers
            .lock()
            .unwrap()
            .insert(id.0.clone(), ContainerStatus::Running);
        // The attached stream drains the preset output, then the container
        // "exits" with the configured code
        let output = self.attach_output.lock().unwrap().clone();
        self.finish_container(&id.0, *self.attach_exit_code.lock().unwrap());
        Ok(AttachedIo {
            stdin: Box::pin(tokio::io::sink()),
            output: Box::pin(std::io::Cursor::new(output)),
        })
    }

    async fn attach_container(&self, id: &ContainerId) -> moat_runtime::Result<AttachedIo> {
        self.record(MockCall::Attach { id: id.0.clone() });
        Ok(AttachedIo {
            stdin: Box::pin(tokio::io::sink()),
            output: Box::pin(std::io::Cursor::new(Vec::new())),
        })
    }

    async fn stop_container(
        &self,
        id: &ContainerId,
        _timeout_secs: Option<u32>,
    ) -> moat_runtime::Result<()> {
        self.record(MockCall::Stop { id: id.0.clone() });
        let was_running = {
            let mut containers = self.containers.lock().unwrap();
            match containers.get_mut(&id.0) {
                Some(status) => {
                    let was_running = *status == ContainerStatus::Running;
                    *status = ContainerStatus::Exited;
                    was_running
                }
                None => false,
            }
        };
        // Stopping a running container completes any pending wait
        if was_running {
            let mut codes = self.wait_codes.lock().unwrap();
            codes.entry(id.0.clone()).or_insert(137);
            drop(codes);
            self.wait_version.send_modify(|v| *v += 1);
        }
        Ok(())
    }

    async fn remove_container(&self, id: &ContainerId, _force: bool) -> moat_runtime::Result<()> {
        self.record(MockCall::Remove {
            id: id.0.clone(),
            force: _force,
        });
        match self.containers.lock().unwrap().remove(&id.0) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::ContainerNotFound(id.0.clone())),
        }
    }

    async fn wait_container(&self, id: &ContainerId) -> moat_runtime::Result<i64> {
        self.record(MockCall::Wait { id: id.0.clone() });
        let mut rx = self.wait_version.subscribe();
        loop {
            if let Some(code) = self.wait_codes.lock().unwrap().get(&id.0).copied() {
                return Ok(code);
            }
            if rx.changed().await.is_err() {
                return Err(RuntimeError::WaitError("mock runtime dropped".to_string()));
            }
        }
    }

    async fn container_state(&self, id: &ContainerId) -> moat_runtime::Result<ContainerStatus> {
        self.record(MockCall::State { id: id.0.clone() });
        self.containers
            .lock()
            .unwrap()
            .get(&id.0)
            .copied()
            .ok_or_else(|| RuntimeError::ContainerNotFound(id.0.clone()))
    }

    async fn container_logs(
        &self,
        id: &ContainerId,
        follow: bool,
        _tail: Option<u64>,
    ) -> moat_runtime::Result<LogStream> {
        self.record(MockCall::Logs {
            id: id.0.clone(),
            follow,
        });
        let entries: Vec<moat_runtime::Result<LogEntry>> = self
            .log_entries
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .map(Ok)
            .collect();
        Ok(Box::pin(futures::stream::iter(entries)))
    }

    async fn container_logs_all(&self, id: &ContainerId) -> moat_runtime::Result<Vec<LogEntry>> {
        self.record(MockCall::LogsAll { id: id.0.clone() });
        Ok(self.log_entries.lock().unwrap().clone())
    }

    async fn resize_tty(&self, id: &ContainerId, height: u16, width: u16) -> moat_runtime::Result<()> {
        self.record(MockCall::ResizeTty {
            id: id.0.clone(),
            height,
            width,
        });
        Ok(())
    }

    async fn setup_firewall(
        &self,
        id: &ContainerId,
        _config: &FirewallConfig,
    ) -> moat_runtime::Result<()> {
        self.record(MockCall::Firewall { id: id.0.clone() });
        if let Some(message) = self.firewall_error.lock().unwrap().clone() {
            return Err(RuntimeError::ExecError(message));
        }
        Ok(())
    }

    async fn get_port_bindings(
        &self,
        id: &ContainerId,
    ) -> moat_runtime::Result<Vec<PortBindingInfo>> {
        self.record(MockCall::PortBindings { id: id.0.clone() });
        Ok(self.port_bindings.lock().unwrap().clone())
    }

    async fn get_image_home_dir(&self, _image: &str) -> moat_runtime::Result<Option<String>> {
        Ok(Some("/home/agent".to_string()))
    }

    fn get_host_address(&self) -> String {
        "host.docker.internal".to_string()
    }

    fn supports_host_network(&self) -> bool {
        self.supports_host_network.load(Ordering::SeqCst)
    }

    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Docker
    }

    async fn ping(&self) -> moat_runtime::Result<()> {
        self.record(MockCall::Ping);
        Ok(())
    }

    fn networks(&self) -> Option<&dyn NetworkManager> {
        Some(self)
    }

    fn services(&self) -> Option<&dyn ServiceManager> {
        Some(self)
    }

    fn sidecars(&self) -> Option<&dyn SidecarManager> {
        Some(self)
    }

    fn builds(&self) -> Option<&dyn BuildManager> {
        Some(self)
    }

    async fn close(&self) -> moat_runtime::Result<()> {
        self.record(MockCall::Close);
        Ok(())
    }
}

#[async_trait]
impl NetworkManager for MockRuntime {
    async fn create_network(&self, name: &str) -> moat_runtime::Result<String> {
        self.record(MockCall::CreateNetwork {
            name: name.to_string(),
        });
        let id = format!("net-{}", name);
        self.networks_live.lock().unwrap().push(id.clone());
        self.networks_created.lock().unwrap().push(id.clone());
        Ok(id)
    }

    async fn remove_network(&self, id: &str) -> moat_runtime::Result<()> {
        self.record(MockCall::RemoveNetwork { id: id.to_string() });
        self.networks_live.lock().unwrap().retain(|n| n != id);
        Ok(())
    }

    async fn disconnect_all(&self, id: &str) -> moat_runtime::Result<()> {
        self.record(MockCall::DisconnectAll { id: id.to_string() });
        Ok(())
    }
}

#[async_trait]
impl ServiceManager for MockRuntime {
    async fn start_service(&self, spec: &ServiceSpec) -> moat_runtime::Result<ContainerId> {
        self.record(MockCall::StartService {
            name: spec.name.clone(),
        });
        let id = format!("mock-svc-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers
            .lock()
            .unwrap()
            .insert(id.clone(), ContainerStatus::Running);
        Ok(ContainerId::new(id))
    }

    async fn stop_service(&self, id: &ContainerId) -> moat_runtime::Result<()> {
        self.stop_container(id, Some(5)).await
    }

    async fn remove_service(&self, id: &ContainerId) -> moat_runtime::Result<()> {
        self.remove_container(id, true).await
    }
}

#[async_trait]
impl SidecarManager for MockRuntime {
    async fn start_buildkit(&self, _network: &str, alias: &str) -> moat_runtime::Result<ContainerId> {
        self.record(MockCall::StartBuildkit {
            alias: alias.to_string(),
        });
        let id = format!("mock-buildkit-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers
            .lock()
            .unwrap()
            .insert(id.clone(), ContainerStatus::Running);
        Ok(ContainerId::new(id))
    }

    async fn stop_sidecar(&self, id: &ContainerId) -> moat_runtime::Result<()> {
        self.stop_container(id, Some(5)).await
    }
}

#[async_trait]
impl BuildManager for MockRuntime {
    async fn build_image(
        &self,
        _dockerfile: &str,
        tag: &str,
        _opts: &BuildOptions,
    ) -> moat_runtime::Result<ImageId> {
        self.record(MockCall::BuildImage {
            tag: tag.to_string(),
        });
        Ok(ImageId::new(tag))
    }

    async fn image_exists(&self, tag: &str) -> moat_runtime::Result<bool> {
        self.record(MockCall::ImageExists {
            tag: tag.to_string(),
        });
        Ok(false)
    }

    async fn remove_image(&self, tag: &str) -> moat_runtime::Result<()> {
        self.record(MockCall::RemoveImage {
            tag: tag.to_string(),
        });
        Ok(())
    }
}

/// Recording mock of the per-run auth proxy
pub struct MockProxy {
    pub port: u16,
    pub credentials: Mutex<Vec<(String, String, String)>>,
    pub aws_handler: Mutex<Option<Credential>>,
    pub policy: Mutex<Option<(NetworkPolicy, Vec<String>, Vec<String>)>>,
    pub mcp_servers: Mutex<Vec<String>>,
    pub bind_addr: Mutex<Option<String>>,
    pub token: Mutex<Option<String>>,
    pub store_set: AtomicBool,
    pub logger: Mutex<Option<NetworkLogger>>,
    pub stopped: AtomicBool,
    ca_source: Mutex<Option<PathBuf>>,
}

impl MockProxy {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            credentials: Mutex::new(Vec::new()),
            aws_handler: Mutex::new(None),
            policy: Mutex::new(None),
            mcp_servers: Mutex::new(Vec::new()),
            bind_addr: Mutex::new(None),
            token: Mutex::new(None),
            store_set: AtomicBool::new(false),
            logger: Mutex::new(None),
            stopped: AtomicBool::new(false),
            ca_source: Mutex::new(None),
        }
    }

    pub fn with_ca_source(self, dir: PathBuf) -> Self {
        *self.ca_source.lock().unwrap() = Some(dir);
        self
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl ProxyConfigurer for MockProxy {
    fn set_credential(&self, host: &str, header: &str, value: &str) {
        self.credentials.lock().unwrap().push((
            host.to_string(),
            header.to_string(),
            value.to_string(),
        ));
    }

    fn set_aws_handler(&self, cred: &Credential) {
        *self.aws_handler.lock().unwrap() = Some(cred.clone());
    }

    fn set_network_policy(&self, policy: NetworkPolicy, allow: &[String], grants: &[String]) {
        *self.policy.lock().unwrap() = Some((policy, allow.to_vec(), grants.to_vec()));
    }

    fn set_mcp_servers(&self, servers: &[McpServerConfig]) {
        let mut mcp = self.mcp_servers.lock().unwrap();
        for server in servers {
            mcp.push(server.name.clone());
        }
    }

    fn set_credential_store(&self, _store: Arc<dyn CredentialStore>) {
        self.store_set.store(true, Ordering::SeqCst);
    }

    fn set_logger(&self, logger: NetworkLogger) {
        *self.logger.lock().unwrap() = Some(logger);
    }

    fn set_bind_addr(&self, addr: &str) {
        *self.bind_addr.lock().unwrap() = Some(addr.to_string());
    }

    fn set_auth_token(&self, token: &str) {
        *self.token.lock().unwrap() = Some(token.to_string());
    }
}

#[async_trait]
impl AuthProxy for MockProxy {
    fn as_configurer(&self) -> &dyn ProxyConfigurer {
        self
    }

    fn host_port(&self) -> u16 {
        self.port
    }

    fn ca_source_dir(&self) -> PathBuf {
        self.ca_source.lock().unwrap().clone().unwrap_or_default()
    }

    fn auth_token(&self) -> Option<String> {
        self.token.lock().unwrap().clone()
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Launcher producing MockProxy handles backed by a shared CA source dir
/// (which deliberately contains private key material, to exercise the
/// cert-only staging)
pub struct MockProxyLauncher {
    ca_source: tempfile::TempDir,
    pub launched: Mutex<Vec<Arc<MockProxy>>>,
    pub fail_message: Mutex<Option<String>>,
    next_port: AtomicU16,
}

impl Default for MockProxyLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProxyLauncher {
    pub fn new() -> Self {
        let ca_source = tempfile::tempdir().expect("tempdir");
        std::fs::write(ca_source.path().join("ca.crt"), "TEST CERT").unwrap();
        std::fs::write(ca_source.path().join("ca.key"), "TEST PRIVATE KEY").unwrap();
        Self {
            ca_source,
            launched: Mutex::new(Vec::new()),
            fail_message: Mutex::new(None),
            next_port: AtomicU16::new(8377),
        }
    }

    pub fn fail_next(&self, message: &str) {
        *self.fail_message.lock().unwrap() = Some(message.to_string());
    }

    pub fn launched_count(&self) -> usize {
        self.launched.lock().unwrap().len()
    }

    pub fn last_proxy(&self) -> Option<Arc<MockProxy>> {
        self.launched.lock().unwrap().last().cloned()
    }

    pub fn all_stopped(&self) -> bool {
        self.launched.lock().unwrap().iter().all(|p| p.is_stopped())
    }
}

#[async_trait]
impl ProxyLauncher for MockProxyLauncher {
    async fn launch(&self, opts: ProxyLaunchOptions) -> Result<Arc<dyn AuthProxy>> {
        if let Some(message) = self.fail_message.lock().unwrap().take() {
            return Err(CoreError::ProxyStartFailed(message));
        }
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        let proxy = MockProxy::new(port).with_ca_source(self.ca_source.path().to_path_buf());
        if let Some(token) = opts.auth_token {
            proxy.set_auth_token(&token);
        }
        let proxy = Arc::new(proxy);
        self.launched.lock().unwrap().push(Arc::clone(&proxy));
        Ok(proxy)
    }
}

/// In-memory credential store
#[derive(Default)]
pub struct MemoryCredentialStore {
    creds: Mutex<HashMap<String, Credential>>,
    ssh: Mutex<Vec<SshKeyMapping>>,
    broken: Mutex<HashSet<String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, cred: Credential) {
        self.creds
            .lock()
            .unwrap()
            .insert(cred.provider.clone(), cred);
    }

    pub fn insert_ssh_mapping(&self, mapping: SshKeyMapping) {
        self.ssh.lock().unwrap().push(mapping);
    }

    /// Make get() fail with a decryption error for this provider
    pub fn fail_decryption(&self, provider: &str) {
        self.broken.lock().unwrap().insert(provider.to_string());
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, provider: &str) -> Result<Credential> {
        if self.broken.lock().unwrap().contains(provider) {
            return Err(CoreError::GrantDecryptionFailed(provider.to_string()));
        }
        self.creds
            .lock()
            .unwrap()
            .get(provider)
            .cloned()
            .ok_or_else(|| CoreError::GrantNotConfigured(provider.to_string()))
    }

    async fn save(&self, cred: &Credential) -> Result<()> {
        self.insert(cred.clone());
        Ok(())
    }

    async fn ssh_mappings_for_hosts(&self, hosts: &[String]) -> Result<Vec<SshKeyMapping>> {
        Ok(self
            .ssh
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.hosts.iter().any(|h| hosts.contains(h)))
            .cloned()
            .collect())
    }
}

/// Fully wired manager fixture over mocks and tempdirs
pub struct TestManager {
    pub manager: Arc<Manager>,
    pub runtime: Arc<MockRuntime>,
    pub launcher: Arc<MockProxyLauncher>,
    pub store: Arc<MemoryCredentialStore>,
    pub routes: Arc<RoutingTable>,
    pub data_dir: Arc<tempfile::TempDir>,
    pub workspace: Arc<tempfile::TempDir>,
}

pub struct TestManagerBuilder {
    github_credential: bool,
}

impl TestManager {
    pub fn builder() -> TestManagerBuilder {
        TestManagerBuilder {
            github_credential: true,
        }
    }

    fn global_config(data_dir: &std::path::Path) -> GlobalConfig {
        GlobalConfig {
            data_dir: Some(data_dir.to_path_buf()),
            image: "sandbox:latest".to_string(),
            ..GlobalConfig::default()
        }
    }

    pub fn runs_root(&self) -> PathBuf {
        self.data_dir.path().join("runs")
    }

    pub fn default_options(&self) -> CreateOptions {
        let mut options = CreateOptions::new(self.workspace.path());
        options.grants = vec!["github".to_string()];
        options.cmd = Some(vec!["true".to_string()]);
        options
    }

    pub async fn create_default(&self) -> Result<Arc<Run>> {
        self.manager.create(self.default_options()).await
    }

    pub async fn create_named(&self, name: &str) -> Result<Arc<Run>> {
        let mut options = self.default_options();
        options.name = Some(name.to_string());
        self.manager.create(options).await
    }

    /// Start the run and let its container exit with `code`
    pub async fn start_and_finish(&self, run: &Arc<Run>, code: i64) {
        self.manager
            .start(&run.id, Default::default())
            .await
            .unwrap();
        self.runtime.finish_container(&run.container_id.0, code);
    }

    /// Simulate a process restart: close this manager and build a new one
    /// over the same disk state and runtime
    pub async fn reopen(&self) -> TestManager {
        self.reopen_with_routes(Arc::new(RoutingTable::new())).await
    }

    pub async fn reopen_with_routes(&self, routes: Arc<RoutingTable>) -> TestManager {
        self.manager.close().await;
        let manager = Manager::new(ManagerOptions {
            global: Self::global_config(self.data_dir.path()),
            store: Arc::clone(&self.store) as Arc<dyn CredentialStore>,
            providers: ProviderRegistry::with_builtins(),
            proxy_launcher: Some(Arc::clone(&self.launcher) as Arc<dyn ProxyLauncher>),
            routes: Arc::clone(&routes),
            runtime: Some(Arc::clone(&self.runtime) as Arc<dyn ContainerRuntime>),
        })
        .await
        .expect("manager reopen");

        TestManager {
            manager,
            runtime: Arc::clone(&self.runtime),
            launcher: Arc::clone(&self.launcher),
            store: Arc::clone(&self.store),
            routes,
            data_dir: Arc::clone(&self.data_dir),
            workspace: Arc::clone(&self.workspace),
        }
    }
}

impl TestManagerBuilder {
    pub fn without_github_credential(mut self) -> Self {
        self.github_credential = false;
        self
    }

    pub async fn build(self) -> TestManager {
        let data_dir = Arc::new(tempfile::tempdir().expect("tempdir"));
        let workspace = Arc::new(tempfile::tempdir().expect("tempdir"));
        let runtime = Arc::new(MockRuntime::new());
        let launcher = Arc::new(MockProxyLauncher::new());
        let store = Arc::new(MemoryCredentialStore::new());
        let routes = Arc::new(RoutingTable::new());

        if self.github_credential {
            store.insert(Credential::new("github", "gho_testtoken"));
        }

        let manager = Manager::new(ManagerOptions {
            global: TestManager::global_config(data_dir.path()),
            store: Arc::clone(&store) as Arc<dyn CredentialStore>,
            providers: ProviderRegistry::with_builtins(),
            proxy_launcher: Some(Arc::clone(&launcher) as Arc<dyn ProxyLauncher>),
            routes: Arc::clone(&routes),
            runtime: Some(Arc::clone(&runtime) as Arc<dyn ContainerRuntime>),
        })
        .await
        .expect("manager");

        TestManager {
            manager,
            runtime,
            launcher,
            store,
            routes,
            data_dir,
            workspace,
        }
    }
}
