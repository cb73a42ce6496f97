//! End-to-end lifecycle scenarios over the mock runtime

use moat_core::test_support::*;
use moat_core::{CoreError, RunState, RunStorage, StartOptions};
use moat_runtime::{LogEntry, LogSource, PortBindingInfo};
use tokio_util::sync::CancellationToken;

/// Single github grant, normal exit: Created -> Starting -> Running ->
/// Stopped, logs captured, proxy stopped, container removed.
#[tokio::test]
async fn single_grant_normal_exit() {
    let fixture = TestManager::builder().build().await;
    let run = fixture.create_default().await.unwrap();
    assert_eq!(run.state(), RunState::Created);

    fixture
        .manager
        .start(&run.id, StartOptions::default())
        .await
        .unwrap();
    assert_eq!(run.state(), RunState::Running);

    fixture.runtime.finish_container(&run.container_id.0, 0);
    fixture
        .manager
        .wait(&run.id, &CancellationToken::new())
        .await
        .unwrap();

    let status = run.status_snapshot();
    assert_eq!(status.state, RunState::Stopped);
    assert_eq!(status.exit_code, Some(0));
    assert!(status.error.is_none());
    assert!(status.started_at.is_some());
    assert!(status.stopped_at.is_some());

    // Logs captured (file exists, possibly empty), proxy stopped,
    // container removed
    assert!(run.storage.logs_path().exists());
    assert!(fixture.launcher.last_proxy().unwrap().is_stopped());
    assert!(!fixture.runtime.container_exists(&run.container_id.0));

    // Persisted metadata reflects the final state
    let record = RunStorage::load_metadata(run.storage.dir()).unwrap();
    assert_eq!(record.state, RunState::Stopped);
}

/// Non-zero exit: Failed, error recorded, Wait surfaces it, cleanup done.
#[tokio::test]
async fn non_zero_exit_fails_run() {
    let fixture = TestManager::builder().build().await;
    let run = fixture.create_default().await.unwrap();
    fixture.start_and_finish(&run, 7).await;

    let err = fixture
        .manager
        .wait(&run.id, &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        CoreError::ContainerExitedNonZero(code) => assert_eq!(code, 7),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(err_message(&fixture, &run).as_deref(), Some("container exited with code 7"));
    assert_eq!(run.state(), RunState::Failed);
    assert!(run.storage.logs_path().exists());
    assert!(!fixture.runtime.container_exists(&run.container_id.0));
}

fn err_message(
    _fixture: &TestManager,
    run: &std::sync::Arc<moat_core::Run>,
) -> Option<String> {
    run.status_snapshot().error
}

/// Detach mid-run: Wait returns CancelledByCaller and the container keeps
/// running; a manager restart reconciles it as Running.
#[tokio::test]
async fn detach_leaves_run_running() {
    let fixture = TestManager::builder().build().await;
    let run = fixture.create_default().await.unwrap();
    fixture
        .manager
        .start(&run.id, StartOptions::default())
        .await
        .unwrap();

    let ctx = CancellationToken::new();
    ctx.cancel();
    let err = fixture.manager.wait(&run.id, &ctx).await.unwrap_err();
    assert!(matches!(err, CoreError::CancelledByCaller));
    assert!(fixture.runtime.container_exists(&run.container_id.0));
    assert_eq!(run.state(), RunState::Running);

    // Restart: the run is reconciled as Running with a fresh monitor
    let second = fixture.reopen().await;
    let recovered = second.manager.get(&run.id).await.unwrap();
    assert_eq!(recovered.state(), RunState::Running);
    second.runtime.finish_container(&run.container_id.0, 0);
    second
        .manager
        .wait(&run.id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(recovered.state(), RunState::Stopped);
}

/// Strict policy with firewall failure: the container is stopped and the
/// run fails with a message naming the policy.
#[tokio::test]
async fn strict_policy_firewall_failure_is_fatal() {
    let fixture = TestManager::builder().build().await;
    let mut options = fixture.default_options();
    options.config.network.policy = moat_config::NetworkPolicy::Strict;
    let run = fixture.manager.create(options).await.unwrap();

    fixture.runtime.fail_firewall("iptables: not permitted");
    let err = fixture
        .manager
        .start(&run.id, StartOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::FirewallSetupFailed(_)));

    let status = run.status_snapshot();
    assert_eq!(status.state, RunState::Failed);
    let message = status.error.unwrap();
    assert!(message.contains("firewall"));
    assert!(message.contains("strict network policy"));
    assert!(run.exit_closed());
    assert!(run.storage.logs_path().exists());
}

/// Concurrent Stop and natural exit: one set of cleanup effects, no error
/// surfaced to the Stop caller.
#[tokio::test]
async fn concurrent_stop_and_exit() {
    let fixture = TestManager::builder().build().await;
    let run = fixture.create_default().await.unwrap();
    fixture
        .manager
        .start(&run.id, StartOptions::default())
        .await
        .unwrap();

    // The container exits on its own at the same time Stop runs
    fixture.runtime.finish_container(&run.container_id.0, 0);
    let stop = fixture.manager.stop(&run.id);
    let cancel = CancellationToken::new();
    let wait = fixture.manager.wait(&run.id, &cancel);
    let (stop_result, _) = tokio::join!(stop, wait);
    stop_result.unwrap();

    run.wait_terminal().await;
    assert_eq!(run.state(), RunState::Stopped);
    assert!(run.storage.logs_path().exists());
    assert!(fixture.launcher.all_stopped());
    assert!(!fixture.routes.contains(&run.name));
}

/// Exit-signal ordering: logs are observably captured before the exit
/// signal closes.
#[tokio::test]
async fn logs_captured_before_exit_signal() {
    let fixture = TestManager::builder().build().await;
    let run = fixture.create_default().await.unwrap();
    fixture
        .manager
        .start(&run.id, StartOptions::default())
        .await
        .unwrap();

    let observer_run = std::sync::Arc::clone(&run);
    let observer = tokio::spawn(async move {
        let mut rx = observer_run.exit_receiver();
        rx.wait_for(|closed| *closed).await.unwrap();
        observer_run.logs_captured()
    });

    fixture.runtime.finish_container(&run.container_id.0, 0);
    assert!(observer.await.unwrap(), "exit closed before log capture");
}

/// Published ports are registered under the run's name and unregistered by
/// the time the run is terminal.
#[tokio::test]
async fn route_lifecycle_tracks_run() {
    let fixture = TestManager::builder().build().await;
    let mut options = fixture.default_options();
    options.config.ports.insert("web".to_string(), 3000);
    let run = fixture.manager.create(options).await.unwrap();

    fixture.runtime.port_bindings.lock().unwrap().push(PortBindingInfo {
        container_port: 3000,
        host_port: 49321,
        protocol: "tcp".to_string(),
    });

    fixture
        .manager
        .start(&run.id, StartOptions::default())
        .await
        .unwrap();
    let endpoints = fixture.routes.endpoints(&run.name).unwrap();
    assert_eq!(endpoints[0].service, "web");
    assert_eq!(endpoints[0].host_port, 49321);
    assert_eq!(run.to_record().host_ports["web"], 49321);

    fixture.manager.stop(&run.id).await.unwrap();
    assert!(!fixture.routes.contains(&run.name));
    assert_eq!(run.state(), RunState::Stopped);
}

/// A failed container start fails the run and still produces a logs file
/// and a closed exit signal.
#[tokio::test]
async fn start_failure_fails_run() {
    let fixture = TestManager::builder().build().await;
    let run = fixture.create_default().await.unwrap();
    fixture.runtime.fail_start("oci runtime error");

    let err = fixture
        .manager
        .start(&run.id, StartOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ContainerStartFailed(_)));
    assert_eq!(run.state(), RunState::Failed);
    assert!(run.exit_closed());
    assert!(run.storage.logs_path().exists());
    assert!(fixture.launcher.all_stopped());
}

/// keep_container leaves the container in place after exit.
#[tokio::test]
async fn keep_container_skips_removal() {
    let fixture = TestManager::builder().build().await;
    let mut options = fixture.default_options();
    options.keep_container = true;
    let run = fixture.manager.create(options).await.unwrap();
    fixture.start_and_finish(&run, 0).await;
    fixture
        .manager
        .wait(&run.id, &CancellationToken::new())
        .await
        .unwrap();

    assert!(fixture.runtime.container_exists(&run.container_id.0));
}

/// Stop on a non-running run is a no-op.
#[tokio::test]
async fn stop_is_noop_when_not_running() {
    let fixture = TestManager::builder().build().await;
    let run = fixture.create_default().await.unwrap();
    fixture.manager.stop(&run.id).await.unwrap();
    assert_eq!(run.state(), RunState::Created);

    fixture.start_and_finish(&run, 0).await;
    run.wait_terminal().await;
    fixture.manager.stop(&run.id).await.unwrap();
    assert_eq!(run.state(), RunState::Stopped);
}

/// Attached start: stdio connected, output tee-captured, exit code
/// returned.
#[tokio::test]
async fn start_attached_captures_output() {
    let fixture = TestManager::builder().build().await;
    let mut options = fixture.default_options();
    options.interactive = true;
    let run = fixture.manager.create(options).await.unwrap();

    *fixture.runtime.attach_output.lock().unwrap() = b"hello from agent\n".to_vec();
    fixture
        .runtime
        .log_entries
        .lock()
        .unwrap()
        .push(LogEntry {
            stream: LogSource::Stdout,
            message: "hello from agent\n".to_string(),
        });

    let code = fixture
        .manager
        .start_attached(
            &run.id,
            Box::new(tokio::io::empty()),
            Box::new(tokio::io::sink()),
        )
        .await
        .unwrap();
    assert_eq!(code, 0);

    run.wait_terminal().await;
    assert_eq!(run.state(), RunState::Stopped);
    let captured = run.storage.read_logs().unwrap();
    assert!(!captured.is_empty());
    assert!(captured[0].message.contains("hello from agent"));
}

/// Destroy refuses a running run, then removes everything once stopped.
#[tokio::test]
async fn destroy_refuses_running_then_cleans() {
    let fixture = TestManager::builder().build().await;
    let run = fixture.create_default().await.unwrap();
    fixture
        .manager
        .start(&run.id, StartOptions::default())
        .await
        .unwrap();

    let err = fixture.manager.destroy(&run.id).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidState(_)));

    fixture.runtime.finish_container(&run.container_id.0, 0);
    fixture
        .manager
        .wait(&run.id, &CancellationToken::new())
        .await
        .unwrap();
    fixture.manager.destroy(&run.id).await.unwrap();

    assert!(fixture.manager.get(&run.id).await.is_none());
    assert!(!run.storage.dir().exists());
}

/// Two runs never share an id, and active runs never share a name.
#[tokio::test]
async fn id_and_name_uniqueness() {
    let fixture = TestManager::builder().build().await;
    let a = fixture.create_named("agent-a").await.unwrap();
    let b = fixture.create_named("agent-b").await.unwrap();
    assert_ne!(a.id, b.id);

    // A terminal run frees its name
    fixture.start_and_finish(&a, 0).await;
    fixture
        .manager
        .wait(&a.id, &CancellationToken::new())
        .await
        .unwrap();
    let again = fixture.create_named("agent-a").await.unwrap();
    assert_ne!(again.id, a.id);
}
