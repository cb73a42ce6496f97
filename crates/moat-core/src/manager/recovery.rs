//! Restart recovery: reconcile persisted runs with live runtime state

use super::Manager;
use crate::manager::lifecycle::capture_logs_for;
use crate::run::{Run, RunRecord, RunState};
use crate::storage::RunStorage;
use crate::Result;
use futures::stream::{self, StreamExt};
use moat_runtime::{ContainerId, ContainerStatus, RuntimeError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const RECONCILE_CONCURRENCY: usize = 4;
const RECONCILE_TIMEOUT: Duration = Duration::from_secs(5);

impl Manager {
    /// Load every persisted run, reconcile against the runtime in parallel,
    /// and register the results. Runs still Running get a fresh exit
    /// monitor; terminal runs get their exit signal pre-closed and stale
    /// routes dropped.
    pub(crate) async fn recover_runs(&self) -> Result<()> {
        let dirs = RunStorage::list_runs(&self.runs_root)?;
        if dirs.is_empty() {
            return Ok(());
        }

        let mut records = Vec::new();
        for dir in dirs {
            match RunStorage::load_metadata(&dir) {
                Ok(record) => records.push((record, RunStorage::open(dir))),
                Err(e) => {
                    tracing::warn!("Skipping unreadable run metadata in {}: {}", dir.display(), e)
                }
            }
        }

        let recovered: Vec<Arc<Run>> = stream::iter(records)
            .map(|(record, storage)| self.reconcile_record(record, storage))
            .buffer_unordered(RECONCILE_CONCURRENCY)
            .collect()
            .await;

        for run in recovered {
            let state = run.state();
            if state.is_terminal() {
                self.routes.unregister(&run.name);
                // A terminal run always has a logs file, even a post-crash one
                if !run.storage.logs_path().exists() {
                    capture_logs_for(&run, self.runtime.as_ref()).await;
                }
            }
            {
                let mut runs = self.runs.write().await;
                runs.insert(run.id.clone(), Arc::clone(&run));
            }
            if state == RunState::Running {
                self.spawn_monitor(&run);
            }
            run.persist_best_effort();
            tracing::debug!(run = %run.id, state = %state, "Recovered run");
        }
        Ok(())
    }

    /// Map observed container state onto the persisted record
    async fn reconcile_record(&self, mut record: RunRecord, storage: RunStorage) -> Arc<Run> {
        let container = ContainerId::new(record.container_id.clone());
        let observed = tokio::time::timeout(
            RECONCILE_TIMEOUT,
            self.runtime.container_state(&container),
        )
        .await;

        record.state = match observed {
            Ok(Ok(ContainerStatus::Running)) => RunState::Running,
            Ok(Ok(ContainerStatus::Exited | ContainerStatus::Dead)) => RunState::Stopped,
            Ok(Ok(ContainerStatus::Created | ContainerStatus::Restarting)) => RunState::Created,
            // The container disappeared entirely
            Ok(Err(RuntimeError::ContainerNotFound(_))) => RunState::Stopped,
            // Timeout or transient runtime error: preserve what we knew
            _ => record.state,
        };

        // Drop service containers that no longer exist
        let mut kept = HashMap::new();
        for (name, id) in std::mem::take(&mut record.service_containers) {
            let exists = matches!(
                tokio::time::timeout(
                    RECONCILE_TIMEOUT,
                    self.runtime.container_state(&ContainerId::new(id.clone())),
                )
                .await,
                Ok(Ok(_))
            );
            if exists {
                kept.insert(name, id);
            }
        }
        record.service_containers = kept;

        Arc::new(Run::from_record(record, storage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_recover_terminal_run_has_closed_exit() {
        let fixture = TestManager::builder().build().await;
        let run = fixture.create_default().await.unwrap();
        fixture.start_and_finish(&run, 0).await;
        fixture.manager.wait(&run.id, &CancellationToken::new()).await.unwrap();

        // A second manager over the same disk state
        let second = fixture.reopen().await;
        let recovered = second.manager.get(&run.id).await.unwrap();
        assert_eq!(recovered.state(), RunState::Stopped);
        assert!(recovered.exit_closed());
        // Wait returns immediately
        second
            .manager
            .wait(&run.id, &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_recover_disappeared_container_is_stopped_with_logs() {
        let fixture = TestManager::builder().build().await;
        let run = fixture.create_default().await.unwrap();
        // Persisted as running, but the container is gone by restart time
        let mut record = run.to_record();
        record.state = RunState::Running;
        run.storage.save_metadata(&record).unwrap();
        fixture.runtime.forget_container(&run.container_id.0);

        let second = fixture.reopen().await;
        let recovered = second.manager.get(&run.id).await.unwrap();
        assert_eq!(recovered.state(), RunState::Stopped);
        assert!(recovered.exit_closed());
        assert!(recovered.storage.logs_path().exists());
    }

    #[tokio::test]
    async fn test_recover_running_run_attaches_monitor() {
        let fixture = TestManager::builder().build().await;
        let run = fixture.create_default().await.unwrap();
        fixture
            .manager
            .start(&run.id, Default::default())
            .await
            .unwrap();

        // Simulate a crash-restart while the container is still running
        let second = fixture.reopen().await;
        let recovered = second.manager.get(&run.id).await.unwrap();
        assert_eq!(recovered.state(), RunState::Running);
        assert!(!recovered.exit_closed());

        // The fresh monitor captures the exit
        second.runtime.finish_container(&run.container_id.0, 0);
        second
            .manager
            .wait(&run.id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(recovered.state(), RunState::Stopped);
        assert!(recovered.storage.logs_path().exists());
    }

    #[tokio::test]
    async fn test_recovery_is_idempotent() {
        let fixture = TestManager::builder().build().await;
        let a = fixture.create_named("agent-a").await.unwrap();
        let b = fixture.create_named("agent-b").await.unwrap();

        let second = fixture.reopen().await;
        let third = fixture.reopen().await;

        let mut second_ids: Vec<String> =
            second.manager.list().await.iter().map(|r| r.id.clone()).collect();
        let mut third_ids: Vec<String> =
            third.manager.list().await.iter().map(|r| r.id.clone()).collect();
        second_ids.sort();
        third_ids.sort();
        assert_eq!(second_ids, third_ids);
        assert!(second_ids.contains(&a.id));
        assert!(second_ids.contains(&b.id));
    }

    #[tokio::test]
    async fn test_recovery_filters_dead_service_containers() {
        let fixture = TestManager::builder().build().await;
        let run = fixture.create_default().await.unwrap();
        let mut record = run.to_record();
        record
            .service_containers
            .insert("db".to_string(), "gone-service".to_string());
        run.storage.save_metadata(&record).unwrap();

        let second = fixture.reopen().await;
        let recovered = second.manager.get(&run.id).await.unwrap();
        assert!(recovered.service_containers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recovery_drops_stale_routes_for_terminal_runs() {
        let fixture = TestManager::builder().build().await;
        let run = fixture.create_default().await.unwrap();
        fixture.start_and_finish(&run, 0).await;
        fixture.manager.wait(&run.id, &CancellationToken::new()).await.unwrap();

        // A stale route left behind by a crashed process
        let routes = fixture.routes.clone();
        routes.register(&run.name, vec![]);
        let second = fixture.reopen_with_routes(routes.clone()).await;
        assert!(second.manager.get(&run.id).await.is_some());
        assert!(!routes.contains(&run.name));
    }
}
