//! Container runtime abstraction for moat
//!
//! This crate provides the `ContainerRuntime` trait the run lifecycle manager
//! drives, plus the Docker implementation (bollard). Capability surfaces that
//! not every runtime offers (networks, service containers, build sidecars,
//! image builds) are exposed as optional accessors.

mod docker;
mod error;
mod types;

pub use docker::DockerRuntime;
pub use error::*;
pub use types::*;

use async_trait::async_trait;

/// Trait for container runtimes (Docker today, others behind the same seam)
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container, returning its runtime id
    async fn create_container(&self, config: &CreateContainerConfig) -> Result<ContainerId>;

    /// Start a created container
    async fn start_container(&self, id: &ContainerId) -> Result<()>;

    /// Attach stdio, then start. The returned handles are connected before
    /// the container process begins.
    async fn start_attached(&self, id: &ContainerId) -> Result<AttachedIo>;

    /// Attach to an already-running container
    async fn attach_container(&self, id: &ContainerId) -> Result<AttachedIo>;

    /// Stop a container; "already stopped" is not an error
    async fn stop_container(&self, id: &ContainerId, timeout_secs: Option<u32>) -> Result<()>;

    /// Remove a container
    async fn remove_container(&self, id: &ContainerId, force: bool) -> Result<()>;

    /// Block until the container exits, returning its exit code
    async fn wait_container(&self, id: &ContainerId) -> Result<i64>;

    /// Current status as reported by the runtime
    async fn container_state(&self, id: &ContainerId) -> Result<ContainerStatus>;

    /// Streaming logs (optionally following)
    async fn container_logs(
        &self,
        id: &ContainerId,
        follow: bool,
        tail: Option<u64>,
    ) -> Result<LogStream>;

    /// All logs so far, buffered and demultiplexed
    async fn container_logs_all(&self, id: &ContainerId) -> Result<Vec<LogEntry>>;

    /// Resize the container's TTY
    async fn resize_tty(&self, id: &ContainerId, height: u16, width: u16) -> Result<()>;

    /// Install egress deny-all rules inside the container, excepting the
    /// auth proxy and the allow list
    async fn setup_firewall(&self, id: &ContainerId, config: &FirewallConfig) -> Result<()>;

    /// Published ports, as visible after start
    async fn get_port_bindings(&self, id: &ContainerId) -> Result<Vec<PortBindingInfo>>;

    /// Home directory of the image's default user, if discoverable
    async fn get_image_home_dir(&self, image: &str) -> Result<Option<String>>;

    /// Address at which containers reach host-bound listeners
    fn get_host_address(&self) -> String;

    /// Whether `network_mode: "host"` is available
    fn supports_host_network(&self) -> bool;

    fn kind(&self) -> RuntimeKind;

    /// Check the runtime is reachable
    async fn ping(&self) -> Result<()>;

    fn networks(&self) -> Option<&dyn NetworkManager>;

    fn services(&self) -> Option<&dyn ServiceManager>;

    fn sidecars(&self) -> Option<&dyn SidecarManager>;

    fn builds(&self) -> Option<&dyn BuildManager>;

    /// Release any client resources
    async fn close(&self) -> Result<()>;
}

/// Per-run network management
#[async_trait]
pub trait NetworkManager: Send + Sync {
    /// Create an isolated bridge network, returning its id
    async fn create_network(&self, name: &str) -> Result<String>;

    /// Remove a network; `disconnect_all` first if removal is blocked
    async fn remove_network(&self, id: &str) -> Result<()>;

    /// Force-disconnect every container still attached
    async fn disconnect_all(&self, id: &str) -> Result<()>;
}

/// Auxiliary service containers that share a run's network
#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn start_service(&self, spec: &ServiceSpec) -> Result<ContainerId>;

    async fn stop_service(&self, id: &ContainerId) -> Result<()>;

    async fn remove_service(&self, id: &ContainerId) -> Result<()>;
}

/// Build sidecars (a BuildKit daemon joined to the run network)
#[async_trait]
pub trait SidecarManager: Send + Sync {
    /// Start a BuildKit daemon on the given network, reachable at `alias`
    async fn start_buildkit(&self, network: &str, alias: &str) -> Result<ContainerId>;

    async fn stop_sidecar(&self, id: &ContainerId) -> Result<()>;
}

/// Image building and cache management
#[async_trait]
pub trait BuildManager: Send + Sync {
    /// Build an image from Dockerfile contents (context is the Dockerfile only)
    async fn build_image(&self, dockerfile: &str, tag: &str, opts: &BuildOptions)
        -> Result<ImageId>;

    async fn image_exists(&self, tag: &str) -> Result<bool>;

    async fn remove_image(&self, tag: &str) -> Result<()>;
}

/// Create the default runtime from global configuration
pub async fn create_runtime(
    config: &moat_config::GlobalConfig,
) -> Result<Box<dyn ContainerRuntime>> {
    let runtime = DockerRuntime::new(&config.runtime.socket).await?;
    Ok(Box::new(runtime))
}

/// Test whether the configured runtime is reachable
pub async fn test_runtime_connectivity(config: &moat_config::GlobalConfig) -> bool {
    match create_runtime(config).await {
        Ok(runtime) => runtime.ping().await.is_ok(),
        Err(_) => false,
    }
}
