//! Start, stop, wait, destroy, attach: the run state machine in motion

use super::Manager;
use crate::credentials::{ProviderRegistry, RunStoppedContext};
use crate::routes::{RoutingTable, ServiceEndpoint};
use crate::run::{Run, RunState};
use crate::{CoreError, Result};
use moat_runtime::{ContainerRuntime, LogEntry, LogSource, PortBindingInfo};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const PORT_POLL_RETRIES: usize = 5;
const PORT_POLL_DELAY: Duration = Duration::from_millis(50);

/// Options for `Manager::start`
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Forward container output to this process's stdout
    pub stream_logs: bool,
}

impl Manager {
    /// Start a created run: container start, firewall, port discovery,
    /// route registration, then the exit monitor.
    pub async fn start(&self, run_id: &str, options: StartOptions) -> Result<()> {
        let run = self.require_run(run_id).await?;
        run.transition(RunState::Starting)?;
        run.persist_best_effort();

        if let Err(e) = self.runtime.start_container(&run.container_id).await {
            self.fail_before_running(&run, format!("container start failed: {}", e))
                .await;
            return Err(CoreError::ContainerStartFailed(e.to_string()));
        }

        // Strict policy: the user's isolation request is honored or the run
        // does not happen
        let firewall = { run.firewall.lock().unwrap().clone() };
        if let Some(firewall) = firewall {
            if let Err(e) = self.runtime.setup_firewall(&run.container_id, &firewall).await {
                let _ = self.runtime.stop_container(&run.container_id, Some(5)).await;
                self.fail_before_running(
                    &run,
                    format!(
                        "firewall setup failed: {}; strict network policy requires \
                         in-container isolation",
                        e
                    ),
                )
                .await;
                return Err(CoreError::FirewallSetupFailed(e.to_string()));
            }
        }

        self.discover_and_register_routes(&run).await;

        run.transition(RunState::Running)?;
        run.persist_best_effort();

        if options.stream_logs && !run.interactive {
            self.spawn_stream_logs(&run);
        }
        self.spawn_monitor(&run);
        Ok(())
    }

    /// Start with stdio connected before the container process begins.
    /// Returns the container's exit code.
    pub async fn start_attached(
        &self,
        run_id: &str,
        stdin: Box<dyn AsyncRead + Send + Unpin>,
        mut stdout: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Result<i64> {
        let run = self.require_run(run_id).await?;
        run.transition(RunState::Starting)?;
        run.persist_best_effort();

        let attached = match self.runtime.start_attached(&run.container_id).await {
            Ok(attached) => attached,
            Err(e) => {
                self.fail_before_running(&run, format!("container start failed: {}", e))
                    .await;
                return Err(CoreError::ContainerStartFailed(e.to_string()));
            }
        };

        let firewall = { run.firewall.lock().unwrap().clone() };
        if let Some(firewall) = firewall {
            if let Err(e) = self.runtime.setup_firewall(&run.container_id, &firewall).await {
                let _ = self.runtime.stop_container(&run.container_id, Some(5)).await;
                self.fail_before_running(
                    &run,
                    format!(
                        "firewall setup failed: {}; strict network policy requires \
                         in-container isolation",
                        e
                    ),
                )
                .await;
                return Err(CoreError::FirewallSetupFailed(e.to_string()));
            }
        }

        // Forward the host terminal geometry before the first in-container
        // size query
        if let Some((rows, cols)) = terminal_size() {
            if let Err(e) = self.runtime.resize_tty(&run.container_id, rows, cols).await {
                tracing::debug!("Initial TTY resize failed: {}", e);
            }
        }

        self.discover_and_register_routes(&run).await;
        run.transition(RunState::Running)?;
        run.persist_best_effort();
        self.spawn_monitor(&run);

        // Pump stdio; tee the attached stream for log capture, since a TTY
        // can bypass the runtime's log API
        let mut container_stdin = attached.stdin;
        let mut container_output = attached.output;
        let stdin_task = tokio::spawn(async move {
            let mut stdin = stdin;
            let _ = tokio::io::copy(&mut stdin, &mut container_stdin).await;
        });

        let mut captured: Vec<u8> = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            match container_output.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdout.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                    let _ = stdout.flush().await;
                    captured.extend_from_slice(&buf[..n]);
                }
            }
        }
        stdin_task.abort();

        if run.try_begin_log_capture() {
            let entries = if captured.is_empty() {
                Vec::new()
            } else {
                vec![LogEntry {
                    stream: LogSource::Stdout,
                    message: String::from_utf8_lossy(&captured).to_string(),
                }]
            };
            if let Err(e) = run.storage.write_logs(&entries) {
                tracing::warn!(run = %run.id, "Tee log capture failed: {}", e);
                run.reset_log_capture();
            }
        }

        // Defense in depth; a no-op when the tee already captured
        run.wait_terminal().await;
        capture_logs_for(&run, self.runtime.as_ref()).await;

        Ok(run.status_snapshot().exit_code.unwrap_or(0))
    }

    /// Stop a run. A no-op outside Running/Starting. Safe to race with the
    /// exit monitor: every cleanup effect is latched or idempotent.
    pub async fn stop(&self, run_id: &str) -> Result<()> {
        let run = self.require_run(run_id).await?;
        if !matches!(run.state(), RunState::Running | RunState::Starting) {
            return Ok(());
        }
        if run.transition(RunState::Stopping).is_err() {
            // The monitor finished the run first
            return Ok(());
        }
        run.persist_best_effort();

        let services: Vec<_> = {
            run.service_containers
                .lock()
                .unwrap()
                .values()
                .cloned()
                .collect()
        };
        for service in services {
            if let Err(e) = self.runtime.stop_container(&service, Some(5)).await {
                tracing::warn!("Failed to stop service container {}: {}", service, e);
            }
        }
        let buildkit = { run.buildkit_id.lock().unwrap().clone() };
        if let Some(buildkit) = buildkit {
            let _ = self.runtime.stop_container(&buildkit, Some(5)).await;
        }

        if let Err(e) = self.runtime.stop_container(&run.container_id, Some(10)).await {
            tracing::warn!(run = %run.id, "Container stop reported: {}", e);
        }

        capture_logs_for(&run, self.runtime.as_ref()).await;
        run.close_exit();
        run_stopped_hooks(&run, &self.providers).await;
        self.routes.unregister(&run.name);

        let exit_code = run.status_snapshot().exit_code;
        run.finish(RunState::Stopped, exit_code, None);
        run.persist_best_effort();

        cleanup_after_exit(&run, self.runtime.as_ref()).await;
        run.persist_best_effort();
        Ok(())
    }

    /// Block until the run exits (or the caller cancels and detaches).
    /// Returns the error the monitor recorded, if any.
    pub async fn wait(&self, run_id: &str, ctx: &CancellationToken) -> Result<()> {
        let run = self.require_run(run_id).await?;
        let mut exit_rx = run.exit_receiver();

        tokio::select! {
            _ = ctx.cancelled() => return Err(CoreError::CancelledByCaller),
            res = exit_rx.wait_for(|closed| *closed) => {
                if res.is_err() {
                    return Err(CoreError::ContainerWaitFailed(
                        "exit signal dropped".to_string(),
                    ));
                }
            }
        }
        run.wait_terminal().await;

        capture_logs_for(&run, self.runtime.as_ref()).await;
        self.routes.unregister(&run.name);
        if !run.keep_container {
            if let Err(e) = self.runtime.remove_container(&run.container_id, true).await {
                tracing::debug!(run = %run.id, "Container remove after wait: {}", e);
            }
        }
        release_cleanup_paths(&run);

        let status = run.status_snapshot();
        match (status.state, status.exit_code, status.error) {
            (RunState::Failed, Some(code), _) if code != 0 => {
                Err(CoreError::ContainerExitedNonZero(code))
            }
            (RunState::Failed, _, Some(error)) => Err(CoreError::ContainerWaitFailed(error)),
            _ => Ok(()),
        }
    }

    /// Remove a terminal run and everything it still holds
    pub async fn destroy(&self, run_id: &str) -> Result<()> {
        let run = self.require_run(run_id).await?;
        if run.state() == RunState::Running {
            return Err(CoreError::InvalidState(
                "cannot destroy a running run; stop it first".to_string(),
            ));
        }

        if let Err(e) = self.runtime.remove_container(&run.container_id, true).await {
            tracing::debug!(run = %run.id, "Container remove during destroy: {}", e);
        }
        let services: Vec<_> = {
            run.service_containers
                .lock()
                .unwrap()
                .values()
                .cloned()
                .collect()
        };
        for service in services {
            let _ = self.runtime.remove_container(&service, true).await;
        }
        let buildkit = { run.buildkit_id.lock().unwrap().take() };
        if let Some(buildkit) = buildkit {
            let _ = self.runtime.remove_container(&buildkit, true).await;
        }
        remove_run_network(&run, self.runtime.as_ref()).await;

        // Per-run image tags would otherwise accumulate forever
        if run.image.starts_with("moat/") {
            if let Some(builds) = self.runtime.builds() {
                if let Err(e) = builds.remove_image(&run.image).await {
                    tracing::warn!(run = %run.id, "{}", CoreError::ImageRemoveFailed(e.to_string()));
                }
            }
        }

        let proxy = { run.auth_proxy.lock().unwrap().take() };
        if let Some(proxy) = proxy {
            proxy.stop().await;
        }
        let ssh = { run.ssh_proxy.lock().unwrap().take() };
        if let Some(ssh) = ssh {
            ssh.stop().await;
        }
        let refresh = { run.refresh_task.lock().unwrap().take() };
        if let Some(refresh) = refresh {
            refresh.abort();
        }

        self.routes.unregister(&run.name);
        run.audit.lock().unwrap().take();
        release_cleanup_paths(&run);
        run.storage.remove()?;
        self.remove_run(&run.id).await;
        tracing::info!(run = %run.id, "Run destroyed");
        Ok(())
    }

    /// Attach stdio to an already-running container
    pub async fn attach(
        &self,
        run_id: &str,
        stdin: Box<dyn AsyncRead + Send + Unpin>,
        mut stdout: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Result<()> {
        let run = self.require_run(run_id).await?;
        if run.state() != RunState::Running {
            return Err(CoreError::InvalidState(format!(
                "run is {}, not running",
                run.state()
            )));
        }

        let attached = self.runtime.attach_container(&run.container_id).await?;
        let mut container_stdin = attached.stdin;
        let mut container_output = attached.output;
        let stdin_task = tokio::spawn(async move {
            let mut stdin = stdin;
            let _ = tokio::io::copy(&mut stdin, &mut container_stdin).await;
        });
        let _ = tokio::io::copy(&mut container_output, &mut stdout).await;
        stdin_task.abort();
        Ok(())
    }

    pub async fn resize_tty(&self, run_id: &str, height: u16, width: u16) -> Result<()> {
        let run = self.require_run(run_id).await?;
        self.runtime
            .resize_tty(&run.container_id, height, width)
            .await?;
        Ok(())
    }

    /// Stream live logs into a writer until the container exits
    pub async fn follow_logs(
        &self,
        run_id: &str,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        use futures::StreamExt;

        let run = self.require_run(run_id).await?;
        if run.state().is_terminal() {
            for entry in run.storage.read_logs()? {
                writer.write_all(entry.message.as_bytes()).await?;
            }
            return Ok(());
        }

        let mut stream = self
            .runtime
            .container_logs(&run.container_id, true, None)
            .await?;
        while let Some(entry) = stream.next().await {
            match entry {
                Ok(entry) => writer.write_all(entry.message.as_bytes()).await?,
                Err(e) => {
                    tracing::debug!("Log stream ended: {}", e);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Terminal bookkeeping for failures between Starting and Running
    async fn fail_before_running(&self, run: &Arc<Run>, error: String) {
        capture_logs_for(run, self.runtime.as_ref()).await;
        run.close_exit();
        run_stopped_hooks(run, &self.providers).await;
        self.routes.unregister(&run.name);
        run.finish(RunState::Failed, None, Some(error));
        run.persist_best_effort();
        cleanup_after_exit(run, self.runtime.as_ref()).await;
        run.persist_best_effort();
    }

    /// Poll the runtime for published ports and register discovered
    /// endpoints under the run's name
    async fn discover_and_register_routes(&self, run: &Arc<Run>) {
        if run.ports.is_empty() {
            return;
        }

        let mut bindings: Vec<PortBindingInfo> = Vec::new();
        for attempt in 0..PORT_POLL_RETRIES {
            bindings = self
                .runtime
                .get_port_bindings(&run.container_id)
                .await
                .unwrap_or_default();
            let all_found = run
                .ports
                .values()
                .all(|port| bindings.iter().any(|b| b.container_port == *port));
            if all_found {
                break;
            }
            if attempt + 1 < PORT_POLL_RETRIES {
                tokio::time::sleep(PORT_POLL_DELAY).await;
            }
        }

        let mut host_ports = HashMap::new();
        let mut endpoints = Vec::new();
        for (service, container_port) in &run.ports {
            match bindings.iter().find(|b| b.container_port == *container_port) {
                Some(binding) => {
                    host_ports.insert(service.clone(), binding.host_port);
                    endpoints.push(ServiceEndpoint {
                        service: service.clone(),
                        host_port: binding.host_port,
                    });
                }
                None => tracing::warn!(
                    run = %run.id,
                    "No host binding discovered for service '{}' (port {})",
                    service,
                    container_port
                ),
            }
        }
        if !endpoints.is_empty() {
            self.routes.register(&run.name, endpoints);
        }
        *run.host_ports.lock().unwrap() = host_ports;
    }

    /// Forward container output to this process's stdout
    fn spawn_stream_logs(&self, run: &Arc<Run>) {
        use futures::StreamExt;

        let runtime = Arc::clone(&self.runtime);
        let cancel = self.cancel.child_token();
        let run = Arc::clone(run);
        tokio::spawn(async move {
            let stream = runtime.container_logs(&run.container_id, true, None).await;
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(run = %run.id, "Log streaming unavailable: {}", e);
                    return;
                }
            };
            let mut stdout = tokio::io::stdout();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    entry = stream.next() => match entry {
                        Some(Ok(entry)) => {
                            if stdout.write_all(entry.message.as_bytes()).await.is_err() {
                                return;
                            }
                            let _ = stdout.flush().await;
                        }
                        _ => return,
                    }
                }
            }
        });
    }

    /// Spawn the per-run exit monitor
    pub(crate) fn spawn_monitor(&self, run: &Arc<Run>) {
        let runtime = Arc::clone(&self.runtime);
        let routes = Arc::clone(&self.routes);
        let providers = self.providers.clone();
        let cancel = self.cancel.child_token();
        let run = Arc::clone(run);
        tokio::spawn(async move {
            monitor_container_exit(run, runtime, routes, providers, cancel).await;
        });
    }
}

/// Block on container exit, then run the terminal sequence: capture logs,
/// close the exit signal, run provider hooks, unregister routes,
/// transition, persist, clean up.
pub(crate) async fn monitor_container_exit(
    run: Arc<Run>,
    runtime: Arc<dyn ContainerRuntime>,
    routes: Arc<RoutingTable>,
    providers: ProviderRegistry,
    cancel: CancellationToken,
) {
    let outcome = tokio::select! {
        // Manager teardown: leave the run as-is; recovery re-attaches later
        _ = cancel.cancelled() => return,
        outcome = runtime.wait_container(&run.container_id) => outcome,
    };

    // Capture before anything can remove the container
    capture_logs_for(&run, runtime.as_ref()).await;
    run.close_exit();
    run_stopped_hooks(&run, &providers).await;
    routes.unregister(&run.name);

    let was_stopping = run.state() == RunState::Stopping;
    let (state, exit_code, error) = match outcome {
        Ok(0) => (RunState::Stopped, Some(0), None),
        // A stop-invoked kill is a clean stop, not a failure
        Ok(code) if was_stopping => (RunState::Stopped, Some(code), None),
        Ok(code) => (
            RunState::Failed,
            Some(code),
            Some(format!("container exited with code {}", code)),
        ),
        Err(e) => (
            RunState::Failed,
            None,
            Some(format!("container wait failed: {}", e)),
        ),
    };
    if run.finish(state, exit_code, error) {
        run.persist_best_effort();
    }

    cleanup_after_exit(&run, runtime.as_ref()).await;
    run.persist_best_effort();
}

/// At-most-once log capture via the runtime's log API.
/// A capture that cannot read logs still creates an empty `logs.jsonl`;
/// only a failed disk write releases the latch for a retry.
pub(crate) async fn capture_logs_for(run: &Run, runtime: &dyn ContainerRuntime) {
    if !run.try_begin_log_capture() {
        return;
    }
    let entries = match runtime.container_logs_all(&run.container_id).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(run = %run.id, "Log capture read failed: {}", e);
            Vec::new()
        }
    };
    if let Err(e) = run.storage.write_logs(&entries) {
        tracing::warn!(run = %run.id, "Log capture write failed: {}", e);
        run.reset_log_capture();
    }
}

/// Provider run-stopped hooks, exactly once per run
pub(crate) async fn run_stopped_hooks(run: &Run, providers: &ProviderRegistry) {
    if !run.try_begin_hooks() {
        return;
    }
    let ctx = RunStoppedContext {
        run_id: run.id.clone(),
        workspace: run.workspace.clone(),
        storage_dir: run.storage.dir().to_path_buf(),
    };
    for grant in &run.grants {
        let Some(name) = grant.provider_name() else {
            continue;
        };
        let Ok(provider) = providers.resolve(name) else {
            continue;
        };
        let Some(hook) = provider.run_stopped_hook() else {
            continue;
        };
        match hook.on_run_stopped(&ctx).await {
            Ok(metadata) => {
                run.provider_metadata.lock().unwrap().extend(metadata);
            }
            Err(e) => tracing::warn!(
                run = %run.id,
                "run-stopped hook for '{}' failed: {}",
                name,
                e
            ),
        }
    }
}

fn release_cleanup_paths(run: &Run) {
    let paths: Vec<_> = {
        run.cleanup_paths
            .lock()
            .unwrap()
            .drain()
            .map(|(_, path)| path)
            .collect()
    };
    for path in paths {
        if let Err(e) = std::fs::remove_dir_all(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove cleanup path {}: {}", path.display(), e);
            }
        }
    }
}

async fn remove_run_network(run: &Run, runtime: &dyn ContainerRuntime) {
    let network = { run.network_id.lock().unwrap().take() };
    let Some(network) = network else { return };
    let Some(networks) = runtime.networks() else {
        return;
    };
    if networks.remove_network(&network).await.is_err() {
        // Force-disconnect stragglers, then retry once
        let _ = networks.disconnect_all(&network).await;
        if let Err(e) = networks.remove_network(&network).await {
            tracing::warn!("Failed to remove network {}: {}", network, e);
        }
    }
}

/// Everything released after a run reaches a terminal state. Each step is
/// idempotent so the monitor and `stop` can race freely.
pub(crate) async fn cleanup_after_exit(run: &Run, runtime: &dyn ContainerRuntime) {
    let services: Vec<_> = {
        let mut map = run.service_containers.lock().unwrap();
        map.drain().map(|(_, id)| id).collect()
    };
    for service in services {
        let _ = runtime.stop_container(&service, Some(5)).await;
        let _ = runtime.remove_container(&service, true).await;
    }
    let buildkit = { run.buildkit_id.lock().unwrap().take() };
    if let Some(buildkit) = buildkit {
        let _ = runtime.stop_container(&buildkit, Some(5)).await;
        let _ = runtime.remove_container(&buildkit, true).await;
    }

    // The container is no longer running; the proxy may go
    let proxy = { run.auth_proxy.lock().unwrap().take() };
    if let Some(proxy) = proxy {
        proxy.stop().await;
    }
    let ssh = { run.ssh_proxy.lock().unwrap().take() };
    if let Some(ssh) = ssh {
        ssh.stop().await;
    }
    let refresh = { run.refresh_task.lock().unwrap().take() };
    if let Some(refresh) = refresh {
        refresh.abort();
    }

    if !run.keep_container {
        if let Err(e) = runtime.remove_container(&run.container_id, true).await {
            tracing::debug!(run = %run.id, "Container remove after exit: {}", e);
        }
    }

    release_cleanup_paths(run);
    remove_run_network(run, runtime).await;
    run.host_ports.lock().unwrap().clear();
}

/// Rows/cols of the controlling terminal, when stdin is one
fn terminal_size() -> Option<(u16, u16)> {
    use nix::libc;

    if unsafe { libc::isatty(0) } != 1 {
        return None;
    }
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::ioctl(0, libc::TIOCGWINSZ, &mut ws) };
    if rc == 0 && ws.ws_row > 0 && ws.ws_col > 0 {
        Some((ws.ws_row, ws.ws_col))
    } else {
        None
    }
}
