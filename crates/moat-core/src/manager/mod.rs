//! The Manager: process-wide registry and entry point for run operations

mod create;
mod lifecycle;
mod recovery;

pub use lifecycle::StartOptions;

use crate::credentials::{CredentialStore, ProviderRegistry};
use crate::proxy::ProxyLauncher;
use crate::routes::RoutingTable;
use crate::run::Run;
use crate::{CoreError, Result};
use moat_config::GlobalConfig;
use moat_runtime::{ContainerRuntime, LogEntry, RuntimeKind};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Overall deadline for `Manager::close`
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-cleanup-path deadline during close
pub(crate) const CLEANUP_PATH_TIMEOUT: Duration = Duration::from_secs(30);

/// Construction options for the manager
pub struct ManagerOptions {
    pub global: GlobalConfig,
    pub store: Arc<dyn CredentialStore>,
    pub providers: ProviderRegistry,
    /// Spawns per-run auth proxies; runs with credential grants fail to
    /// create without one
    pub proxy_launcher: Option<Arc<dyn ProxyLauncher>>,
    pub routes: Arc<RoutingTable>,
    /// Injected runtime (tests); the default is built from global config
    pub runtime: Option<Arc<dyn ContainerRuntime>>,
}

/// Process-wide run registry and lifecycle entry point
pub struct Manager {
    pub(crate) runtime: Arc<dyn ContainerRuntime>,
    pub(crate) store: Arc<dyn CredentialStore>,
    pub(crate) providers: ProviderRegistry,
    pub(crate) proxy_launcher: Option<Arc<dyn ProxyLauncher>>,
    pub(crate) routes: Arc<RoutingTable>,
    pub(crate) global: GlobalConfig,
    pub(crate) runs_root: PathBuf,
    pub(crate) runs: RwLock<HashMap<String, Arc<Run>>>,
    /// Parent token for every background task this manager spawns
    pub(crate) cancel: CancellationToken,
}

impl Manager {
    /// Construct the manager, connect the runtime, and recover persisted runs
    pub async fn new(options: ManagerOptions) -> Result<Arc<Self>> {
        let runtime: Arc<dyn ContainerRuntime> = match options.runtime {
            Some(runtime) => runtime,
            None => Arc::from(moat_runtime::create_runtime(&options.global).await?),
        };
        let runs_root = options.global.runs_dir()?;
        std::fs::create_dir_all(&runs_root)?;

        let manager = Arc::new(Self {
            runtime,
            store: options.store,
            providers: options.providers,
            proxy_launcher: options.proxy_launcher,
            routes: options.routes,
            global: options.global,
            runs_root,
            runs: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        });

        manager.recover_runs().await?;
        Ok(manager)
    }

    pub fn runtime_type(&self) -> RuntimeKind {
        self.runtime.kind()
    }

    pub fn routes(&self) -> &Arc<RoutingTable> {
        &self.routes
    }

    /// Look up a run by id
    pub async fn get(&self, run_id: &str) -> Option<Arc<Run>> {
        self.runs.read().await.get(run_id).cloned()
    }

    /// Look up by id or name (CLI convenience)
    pub async fn find(&self, reference: &str) -> Option<Arc<Run>> {
        let runs = self.runs.read().await;
        runs.get(reference)
            .or_else(|| runs.values().find(|r| r.name == reference))
            .cloned()
    }

    /// All registered runs
    pub async fn list(&self) -> Vec<Arc<Run>> {
        let mut runs: Vec<Arc<Run>> = self.runs.read().await.values().cloned().collect();
        runs.sort_by(|a, b| {
            a.status_snapshot()
                .created_at
                .cmp(&b.status_snapshot().created_at)
        });
        runs
    }

    pub(crate) async fn require_run(&self, run_id: &str) -> Result<Arc<Run>> {
        self.get(run_id)
            .await
            .ok_or_else(|| CoreError::RunNotFound(run_id.to_string()))
    }

    /// Names currently counting toward uniqueness
    pub(crate) async fn active_names(&self) -> Vec<String> {
        self.runs
            .read()
            .await
            .values()
            .filter(|r| r.state().is_active())
            .map(|r| r.name.clone())
            .collect()
    }

    pub(crate) async fn register_run(&self, run: Arc<Run>) -> Result<()> {
        let mut runs = self.runs.write().await;
        if runs
            .values()
            .any(|r| r.name == run.name && r.state().is_active())
        {
            return Err(CoreError::NameConflict(run.name.clone()));
        }
        runs.insert(run.id.clone(), run);
        Ok(())
    }

    pub(crate) async fn remove_run(&self, run_id: &str) {
        self.runs.write().await.remove(run_id);
    }

    /// Recent captured or live log lines for a run
    pub async fn recent_logs(&self, run_id: &str, n: usize) -> Result<Vec<LogEntry>> {
        let run = self.require_run(run_id).await?;
        if run.storage.logs_path().exists() {
            let entries = run.storage.read_logs()?;
            let skip = entries.len().saturating_sub(n);
            return Ok(entries.into_iter().skip(skip).collect());
        }
        self.runtime
            .container_logs_all(&run.container_id)
            .await
            .map(|entries| {
                let skip = entries.len().saturating_sub(n);
                entries.into_iter().skip(skip).collect()
            })
            .map_err(Into::into)
    }

    /// Tear down background tasks and release runtime resources.
    ///
    /// Running containers are left running; their persisted state is
    /// reconciled on the next start.
    pub async fn close(&self) {
        self.cancel.cancel();

        let close_all = async {
            let runs: Vec<Arc<Run>> = self.runs.read().await.values().cloned().collect();
            for run in runs {
                let teardown = async {
                    if let Some(task) = run.refresh_task.lock().unwrap().take() {
                        task.abort();
                    }
                    // Drop the audit handle so the db closes cleanly
                    run.audit.lock().unwrap().take();
                };
                if tokio::time::timeout(CLEANUP_PATH_TIMEOUT, teardown)
                    .await
                    .is_err()
                {
                    tracing::warn!(run = %run.id, "Run teardown timed out during close");
                }
            }
            if let Err(e) = self.runtime.close().await {
                tracing::warn!("Runtime close failed: {}", e);
            }
        };

        if tokio::time::timeout(CLOSE_TIMEOUT, close_all).await.is_err() {
            tracing::warn!("Manager close timed out after {:?}", CLOSE_TIMEOUT);
        }
    }
}
