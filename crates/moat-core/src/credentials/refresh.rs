//! Per-run token refresh loop
//!
//! Refreshable credentials are refreshed immediately at startup and then on
//! the minimum interval declared across all targets. Failures back off
//! exponentially (30s doubling to 5min); revocation is terminal for the
//! grant and surfaces a warning.

use super::{Credential, CredentialStore, Provider};
use crate::proxy::AuthProxy;
use crate::CoreError;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const REFRESH_BACKOFF_INITIAL: Duration = Duration::from_secs(30);
pub const REFRESH_BACKOFF_MAX: Duration = Duration::from_secs(300);

/// One credential enrolled in the refresh loop
pub struct RefreshTarget {
    pub provider: Arc<dyn Provider>,
    pub credential: Credential,
}

struct TargetState {
    provider: Arc<dyn Provider>,
    credential: Credential,
    backoff: Option<Duration>,
    next_at: Instant,
    revoked: bool,
}

fn next_backoff(current: Option<Duration>) -> Duration {
    match current {
        None => REFRESH_BACKOFF_INITIAL,
        Some(d) => (d * 2).min(REFRESH_BACKOFF_MAX),
    }
}

/// Spawn the refresh task for a run. Returns `None` when nothing is
/// refreshable.
pub fn spawn_refresh_loop(
    targets: Vec<RefreshTarget>,
    proxy: Arc<dyn AuthProxy>,
    store: Arc<dyn CredentialStore>,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    let interval = targets
        .iter()
        .filter_map(|t| t.provider.refreshable().map(|r| r.refresh_interval()))
        .min()?;

    let mut states: Vec<TargetState> = targets
        .into_iter()
        .filter(|t| t.provider.refreshable().is_some())
        .map(|t| TargetState {
            provider: t.provider,
            credential: t.credential,
            backoff: None,
            next_at: Instant::now(),
            revoked: false,
        })
        .collect();

    if states.is_empty() {
        return None;
    }

    Some(tokio::spawn(async move {
        loop {
            let Some(wake_at) = states
                .iter()
                .filter(|s| !s.revoked)
                .map(|s| s.next_at)
                .min()
            else {
                // Every target revoked
                return;
            };

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep_until(wake_at) => {}
            }

            let now = Instant::now();
            for state in states.iter_mut().filter(|s| !s.revoked && s.next_at <= now) {
                refresh_one(state, proxy.as_ref(), store.as_ref(), interval).await;
            }
        }
    }))
}

async fn refresh_one(
    state: &mut TargetState,
    proxy: &dyn AuthProxy,
    store: &dyn CredentialStore,
    interval: Duration,
) {
    let refreshable = match state.provider.refreshable() {
        Some(r) => r,
        None => {
            state.revoked = true;
            return;
        }
    };

    match refreshable
        .refresh(proxy.as_configurer(), &state.credential)
        .await
    {
        Ok(new_cred) => {
            if let Err(e) = store.save(&new_cred).await {
                tracing::warn!(
                    provider = state.provider.name(),
                    "Failed to persist refreshed token: {}",
                    e
                );
            }
            state.credential = new_cred;
            state.backoff = None;
            state.next_at = Instant::now() + interval;
        }
        Err(CoreError::TokenRevoked(provider)) => {
            tracing::warn!(
                "Token for '{}' was revoked; refresh disabled for this run. \
                 Re-authorize with `moat grant {}`",
                provider,
                provider
            );
            state.revoked = true;
        }
        Err(e) => {
            let backoff = next_backoff(state.backoff);
            tracing::warn!(
                provider = state.provider.name(),
                "Token refresh failed ({}); retrying in {:?}",
                e,
                backoff
            );
            state.backoff = Some(backoff);
            state.next_at = Instant::now() + backoff;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{BindContext, RefreshableProvider};
    use crate::proxy::ProxyConfigurer;
    use crate::test_support::{MemoryCredentialStore, MockProxy};
    use crate::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted refreshable provider: pops one outcome per refresh call
    struct ScriptedProvider {
        outcomes: Mutex<Vec<std::result::Result<(), CoreError>>>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedProvider {
        fn new(outcomes: Vec<std::result::Result<(), CoreError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn configure_proxy(
            &self,
            _proxy: &dyn ProxyConfigurer,
            _cred: &Credential,
            _scope: Option<&str>,
        ) -> Result<()> {
            Ok(())
        }

        fn container_env(&self, _cred: &Credential, _ctx: &BindContext) -> Vec<(String, String)> {
            Vec::new()
        }

        fn refreshable(&self) -> Option<&dyn RefreshableProvider> {
            Some(self)
        }
    }

    #[async_trait]
    impl RefreshableProvider for ScriptedProvider {
        fn can_refresh(&self, _cred: &Credential) -> bool {
            true
        }

        fn refresh_interval(&self) -> Duration {
            Duration::from_secs(600)
        }

        async fn refresh(
            &self,
            _proxy: &dyn ProxyConfigurer,
            cred: &Credential,
        ) -> Result<Credential> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut outcomes = self.outcomes.lock().unwrap();
            match outcomes.pop() {
                Some(Ok(())) | None => Ok(Credential::new(&cred.provider, "refreshed")),
                Some(Err(e)) => Err(e),
            }
        }
    }

    fn make_loop(
        provider: Arc<ScriptedProvider>,
        store: Arc<MemoryCredentialStore>,
        cancel: &CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let proxy: Arc<dyn AuthProxy> = Arc::new(MockProxy::new(1));
        spawn_refresh_loop(
            vec![RefreshTarget {
                provider: provider as Arc<dyn Provider>,
                credential: Credential::new("scripted", "orig"),
            }],
            proxy,
            store,
            cancel.clone(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_refresh_and_persist() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let calls = provider.calls.clone();
        let store = Arc::new(MemoryCredentialStore::new());
        let cancel = CancellationToken::new();

        let handle = make_loop(provider, store.clone(), &cancel).unwrap();
        // Let the startup refresh run
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get("scripted").await.unwrap().secret, "refreshed");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoked_stops_refreshing() {
        let provider = Arc::new(ScriptedProvider::new(vec![Err(CoreError::TokenRevoked(
            "scripted".to_string(),
        ))]));
        let calls = provider.calls.clone();
        let store = Arc::new(MemoryCredentialStore::new());
        let cancel = CancellationToken::new();

        let handle = make_loop(provider, store, &cancel).unwrap();
        tokio::time::sleep(Duration::from_secs(3600)).await;
        // Only the initial attempt; revocation is terminal
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // All targets revoked: the loop has exited on its own
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_backs_off_before_retry() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(()),
            Err(CoreError::TokenRefreshFailed {
                provider: "scripted".to_string(),
                reason: "503".to_string(),
            }),
        ]));
        let calls = provider.calls.clone();
        let store = Arc::new(MemoryCredentialStore::new());
        let cancel = CancellationToken::new();

        let handle = make_loop(provider, store, &cancel).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The retry must not happen before the 30s back-off elapses
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = None;
        let mut seen = Vec::new();
        for _ in 0..6 {
            let next = next_backoff(backoff);
            seen.push(next.as_secs());
            backoff = Some(next);
        }
        assert_eq!(seen, vec![30, 60, 120, 240, 300, 300]);
    }
}
