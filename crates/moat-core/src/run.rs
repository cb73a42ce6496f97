//! The Run: one sandboxed agent execution and its resources

use crate::audit::AuditLog;
use crate::grants::Grant;
use crate::proxy::AuthProxy;
use crate::ssh::SshAgentProxy;
use crate::storage::RunStorage;
use crate::{CoreError, Result};
use chrono::{DateTime, Utc};
use moat_runtime::ContainerId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Run lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl RunState {
    /// Stopped or Failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Counts toward name uniqueness
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Mutable status block, guarded by the run's status lock
#[derive(Debug, Clone)]
pub struct RunStatus {
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
}

/// Serialized run metadata (`metadata.json`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub name: String,
    pub workspace: PathBuf,
    pub image: String,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
    pub grants: Vec<Grant>,
    #[serde(default)]
    pub ports: HashMap<String, u16>,
    #[serde(default)]
    pub host_ports: HashMap<String, u16>,
    pub container_id: String,
    #[serde(default)]
    pub service_containers: HashMap<String, String>,
    #[serde(default)]
    pub network_id: Option<String>,
    #[serde(default)]
    pub buildkit_container_id: Option<String>,
    #[serde(default)]
    pub agent_kind: Option<String>,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default)]
    pub keep_container: bool,
    #[serde(default)]
    pub cleanup_paths: HashMap<String, PathBuf>,
    /// Metadata contributed by provider run-stopped hooks
    #[serde(default)]
    pub provider_metadata: HashMap<String, String>,
}

/// A live run and the resources it exclusively owns
pub struct Run {
    pub id: String,
    pub name: String,
    pub workspace: PathBuf,
    pub image: String,
    pub grants: Vec<Grant>,
    pub ports: HashMap<String, u16>,
    pub interactive: bool,
    pub keep_container: bool,
    pub agent_kind: Option<String>,
    pub container_id: ContainerId,
    pub storage: RunStorage,

    status: Mutex<RunStatus>,
    exit_tx: watch::Sender<bool>,
    state_tx: watch::Sender<RunState>,
    logs_captured: AtomicBool,
    hooks_done: AtomicBool,

    /// Strict-policy firewall parameters, applied at start
    pub(crate) firewall: Mutex<Option<moat_runtime::FirewallConfig>>,

    pub(crate) auth_proxy: Mutex<Option<Arc<dyn AuthProxy>>>,
    pub(crate) ssh_proxy: Mutex<Option<Arc<SshAgentProxy>>>,
    pub(crate) service_containers: Mutex<HashMap<String, ContainerId>>,
    pub(crate) network_id: Mutex<Option<String>>,
    pub(crate) buildkit_id: Mutex<Option<ContainerId>>,
    pub(crate) host_ports: Mutex<HashMap<String, u16>>,
    pub(crate) cleanup_paths: Mutex<HashMap<String, PathBuf>>,
    pub(crate) provider_metadata: Mutex<HashMap<String, String>>,
    pub(crate) audit: Mutex<Option<Arc<AuditLog>>>,
    pub(crate) refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("image", &self.image)
            .finish_non_exhaustive()
    }
}

/// Immutable construction parameters for a new run
pub struct RunParams {
    pub id: String,
    pub name: String,
    pub workspace: PathBuf,
    pub image: String,
    pub grants: Vec<Grant>,
    pub ports: HashMap<String, u16>,
    pub interactive: bool,
    pub keep_container: bool,
    pub agent_kind: Option<String>,
    pub container_id: ContainerId,
    pub storage: RunStorage,
}

impl Run {
    pub fn new(params: RunParams) -> Self {
        let (exit_tx, _) = watch::channel(false);
        let (state_tx, _) = watch::channel(RunState::Created);
        Self {
            id: params.id,
            name: params.name,
            workspace: params.workspace,
            image: params.image,
            grants: params.grants,
            ports: params.ports,
            interactive: params.interactive,
            keep_container: params.keep_container,
            agent_kind: params.agent_kind,
            container_id: params.container_id,
            storage: params.storage,
            status: Mutex::new(RunStatus {
                state: RunState::Created,
                created_at: Utc::now(),
                started_at: None,
                stopped_at: None,
                exit_code: None,
                error: None,
            }),
            exit_tx,
            state_tx,
            logs_captured: AtomicBool::new(false),
            hooks_done: AtomicBool::new(false),
            firewall: Mutex::new(None),
            auth_proxy: Mutex::new(None),
            ssh_proxy: Mutex::new(None),
            service_containers: Mutex::new(HashMap::new()),
            network_id: Mutex::new(None),
            buildkit_id: Mutex::new(None),
            host_ports: Mutex::new(HashMap::new()),
            cleanup_paths: Mutex::new(HashMap::new()),
            provider_metadata: Mutex::new(HashMap::new()),
            audit: Mutex::new(None),
            refresh_task: Mutex::new(None),
        }
    }

    /// Rebuild a run from its persisted record (manager restart)
    pub fn from_record(record: RunRecord, storage: RunStorage) -> Self {
        let run = Self::new(RunParams {
            id: record.id,
            name: record.name,
            workspace: record.workspace,
            image: record.image,
            grants: record.grants,
            ports: record.ports,
            interactive: record.interactive,
            keep_container: record.keep_container,
            agent_kind: record.agent_kind,
            container_id: ContainerId::new(record.container_id),
            storage,
        });

        {
            let mut status = run.status.lock().unwrap();
            status.state = record.state;
            run.state_tx.send_replace(record.state);
            status.created_at = record.created_at;
            status.started_at = record.started_at;
            status.stopped_at = record.stopped_at;
            status.exit_code = record.exit_code;
            status.error = record.error;
        }
        *run.service_containers.lock().unwrap() = record
            .service_containers
            .into_iter()
            .map(|(k, v)| (k, ContainerId::new(v)))
            .collect();
        *run.network_id.lock().unwrap() = record.network_id;
        *run.buildkit_id.lock().unwrap() = record.buildkit_container_id.map(ContainerId::new);
        *run.host_ports.lock().unwrap() = record.host_ports;
        *run.cleanup_paths.lock().unwrap() = record.cleanup_paths;
        *run.provider_metadata.lock().unwrap() = record.provider_metadata;

        // Log capture survives restarts through the file itself
        run.logs_captured
            .store(run.storage.logs_path().exists(), Ordering::SeqCst);

        if record.state.is_terminal() {
            run.close_exit();
        }
        run
    }

    pub fn state(&self) -> RunState {
        self.status.lock().unwrap().state
    }

    pub fn status_snapshot(&self) -> RunStatus {
        self.status.lock().unwrap().clone()
    }

    /// Non-terminal transition along the state machine's arrows
    pub fn transition(&self, to: RunState) -> Result<()> {
        let mut status = self.status.lock().unwrap();
        let from = status.state;
        let valid = matches!(
            (from, to),
            (RunState::Created, RunState::Starting)
                | (RunState::Starting, RunState::Running)
                | (RunState::Running, RunState::Stopping)
                | (RunState::Starting, RunState::Stopping)
        );
        if !valid {
            return Err(CoreError::InvalidState(format!(
                "cannot transition from {} to {}",
                from, to
            )));
        }
        status.state = to;
        if to == RunState::Running {
            status.started_at = Some(Utc::now());
        }
        self.state_tx.send_replace(to);
        Ok(())
    }

    /// Block until the run reaches a terminal state
    pub async fn wait_terminal(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|s| s.is_terminal()).await;
    }

    /// Terminal transition; the first caller wins. Returns whether this call
    /// performed the transition.
    pub fn finish(&self, state: RunState, exit_code: Option<i64>, error: Option<String>) -> bool {
        debug_assert!(state.is_terminal());
        let mut status = self.status.lock().unwrap();
        if status.state.is_terminal() {
            return false;
        }
        status.state = state;
        status.stopped_at = Some(Utc::now());
        status.exit_code = exit_code;
        status.error = error;
        self.state_tx.send_replace(state);
        true
    }

    /// One-shot exit signal; closed by the monitor after log capture
    pub fn exit_receiver(&self) -> watch::Receiver<bool> {
        self.exit_tx.subscribe()
    }

    pub fn close_exit(&self) {
        self.exit_tx.send_replace(true);
    }

    pub fn exit_closed(&self) -> bool {
        *self.exit_tx.borrow()
    }

    /// Claim the single log-capture slot. Returns false when capture already
    /// happened (or is in flight).
    pub fn try_begin_log_capture(&self) -> bool {
        self.logs_captured
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Release the slot after a failed capture so a later attempt may retry
    pub fn reset_log_capture(&self) {
        self.logs_captured.store(false, Ordering::SeqCst);
    }

    pub fn logs_captured(&self) -> bool {
        self.logs_captured.load(Ordering::SeqCst)
    }

    /// Claim the single run-stopped-hooks slot
    pub fn try_begin_hooks(&self) -> bool {
        self.hooks_done
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Snapshot everything into a serializable record
    pub fn to_record(&self) -> RunRecord {
        let status = self.status_snapshot();
        RunRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            workspace: self.workspace.clone(),
            image: self.image.clone(),
            state: status.state,
            created_at: status.created_at,
            started_at: status.started_at,
            stopped_at: status.stopped_at,
            exit_code: status.exit_code,
            error: status.error,
            grants: self.grants.clone(),
            ports: self.ports.clone(),
            host_ports: self.host_ports.lock().unwrap().clone(),
            container_id: self.container_id.0.clone(),
            service_containers: self
                .service_containers
                .lock()
                .unwrap()
                .iter()
                .map(|(k, v)| (k.clone(), v.0.clone()))
                .collect(),
            network_id: self.network_id.lock().unwrap().clone(),
            buildkit_container_id: self.buildkit_id.lock().unwrap().as_ref().map(|c| c.0.clone()),
            agent_kind: self.agent_kind.clone(),
            interactive: self.interactive,
            keep_container: self.keep_container,
            cleanup_paths: self.cleanup_paths.lock().unwrap().clone(),
            provider_metadata: self.provider_metadata.lock().unwrap().clone(),
        }
    }

    /// Persist the current record; failures are logged, never surfaced
    pub fn persist_best_effort(&self) {
        if let Err(e) = self.storage.save_metadata(&self.to_record()) {
            tracing::warn!(run = %self.id, "Failed to persist run metadata: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_run(dir: &std::path::Path) -> Run {
        let storage = RunStorage::create(dir, "run_0123456789ab").unwrap();
        Run::new(RunParams {
            id: "run_0123456789ab".to_string(),
            name: "quiet-otter".to_string(),
            workspace: PathBuf::from("/ws"),
            image: "sandbox:latest".to_string(),
            grants: vec![Grant::parse("github").unwrap()],
            ports: HashMap::new(),
            interactive: false,
            keep_container: false,
            agent_kind: None,
            container_id: ContainerId::new("ctr1"),
            storage,
        })
    }

    #[test]
    fn test_valid_transitions() {
        let tmp = tempfile::tempdir().unwrap();
        let run = make_run(tmp.path());
        assert_eq!(run.state(), RunState::Created);
        run.transition(RunState::Starting).unwrap();
        run.transition(RunState::Running).unwrap();
        assert!(run.status_snapshot().started_at.is_some());
        run.transition(RunState::Stopping).unwrap();
        assert!(run.finish(RunState::Stopped, Some(0), None));
        assert_eq!(run.state(), RunState::Stopped);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let run = make_run(tmp.path());
        assert!(run.transition(RunState::Running).is_err());
        assert!(run.transition(RunState::Stopping).is_err());
    }

    #[test]
    fn test_finish_first_writer_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let run = make_run(tmp.path());
        run.transition(RunState::Starting).unwrap();
        run.transition(RunState::Running).unwrap();
        assert!(run.finish(RunState::Failed, Some(7), Some("container exited with code 7".into())));
        assert!(!run.finish(RunState::Stopped, Some(0), None));
        let status = run.status_snapshot();
        assert_eq!(status.state, RunState::Failed);
        assert_eq!(status.exit_code, Some(7));
    }

    #[test]
    fn test_log_capture_latch() {
        let tmp = tempfile::tempdir().unwrap();
        let run = make_run(tmp.path());
        assert!(run.try_begin_log_capture());
        assert!(!run.try_begin_log_capture());
        run.reset_log_capture();
        assert!(run.try_begin_log_capture());
    }

    #[test]
    fn test_exit_signal() {
        let tmp = tempfile::tempdir().unwrap();
        let run = make_run(tmp.path());
        assert!(!run.exit_closed());
        run.close_exit();
        assert!(run.exit_closed());
        // Closing twice is fine
        run.close_exit();
        assert!(*run.exit_receiver().borrow());
    }

    #[test]
    fn test_record_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let run = make_run(tmp.path());
        run.transition(RunState::Starting).unwrap();
        run.transition(RunState::Running).unwrap();
        run.host_ports
            .lock()
            .unwrap()
            .insert("web".to_string(), 49152);
        run.finish(RunState::Stopped, Some(0), None);

        let record = run.to_record();
        run.storage.save_metadata(&record).unwrap();

        let loaded = RunStorage::load_metadata(run.storage.dir()).unwrap();
        assert_eq!(loaded.id, record.id);
        assert_eq!(loaded.state, RunState::Stopped);
        assert_eq!(loaded.host_ports["web"], 49152);
        assert_eq!(loaded.grants.len(), 1);

        let restored = Run::from_record(loaded, run.storage.clone());
        assert_eq!(restored.state(), RunState::Stopped);
        // Terminal record: exit signal pre-closed
        assert!(restored.exit_closed());
    }

    #[test]
    fn test_from_record_restores_log_capture_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let run = make_run(tmp.path());
        run.finish(RunState::Stopped, Some(0), None);
        run.storage.write_logs(&[]).unwrap();
        run.storage.save_metadata(&run.to_record()).unwrap();

        let record = RunStorage::load_metadata(run.storage.dir()).unwrap();
        let restored = Run::from_record(record, run.storage.clone());
        assert!(restored.logs_captured());
        assert!(!restored.try_begin_log_capture());
    }
}
