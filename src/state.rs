//! Shared application state.
//!
//! Everything here is immutable after startup except the live session
//! registry. The credential cache inside [`CredentialProvider`] is the only
//! state shared between sessions.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::{ProfileRegistry, RelayConfig};
use crate::core::audio::AudioBatchConfig;
use crate::core::credentials::CredentialProvider;
use crate::core::upstream::{SessionSettings, UpstreamConnector};
use crate::errors::CredentialError;

/// Registry entry for a running session.
#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub profile: String,
    pub started_at: Instant,
}

/// Application state shared by every request handler.
pub struct AppState {
    pub config: RelayConfig,
    pub profiles: ProfileRegistry,
    pub credentials: Arc<CredentialProvider>,
    pub connector: UpstreamConnector,
    pub settings: SessionSettings,
    pub audio_config: AudioBatchConfig,
    sessions: DashMap<String, ActiveSession>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl AppState {
    /// Build state with the credential provider the configuration implies.
    pub fn new(
        config: RelayConfig,
        profiles: ProfileRegistry,
    ) -> Result<Arc<Self>, CredentialError> {
        let credentials = Arc::new(config.credential_provider()?);
        Ok(Self::with_credentials(config, profiles, credentials))
    }

    /// Build state around an existing credential provider.
    pub fn with_credentials(
        config: RelayConfig,
        profiles: ProfileRegistry,
        credentials: Arc<CredentialProvider>,
    ) -> Arc<Self> {
        let tasks = TaskTracker::new();
        let connector = UpstreamConnector::new(config.upstream_endpoint(), credentials.clone())
            .with_task_tracker(tasks.clone());
        let settings = config.session_settings();
        let audio_config = config.audio_batch_config();

        info!(
            backend = %config.backend,
            model = %config.model,
            profiles = profiles.len(),
            static_key = credentials.is_static(),
            "Relay state initialized"
        );

        Arc::new(Self {
            config,
            profiles,
            credentials,
            connector,
            settings,
            audio_config,
            sessions: DashMap::new(),
            shutdown: CancellationToken::new(),
            tasks,
        })
    }

    pub fn register_session(&self, session_id: &str, profile: &str) {
        self.sessions.insert(
            session_id.to_string(),
            ActiveSession {
                profile: profile.to_string(),
                started_at: Instant::now(),
            },
        );
    }

    pub fn unregister_session(&self, session_id: &str) -> Option<ActiveSession> {
        self.sessions.remove(session_id).map(|(_, session)| session)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Token cancelled when the server shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Ask every live session to dispose.
    pub fn shutdown(&self) {
        info!(
            active_sessions = self.active_sessions(),
            "Shutting down relay sessions"
        );
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Tracker for client connections and upstream link tasks.
    pub fn task_tracker(&self) -> TaskTracker {
        self.tasks.clone()
    }

    /// Wait for tracked connections to finish disposing. Returns `false`
    /// if `timeout` elapsed first.
    pub async fn drain_sessions(&self, timeout: Duration) -> bool {
        self.tasks.close();
        if tokio::time::timeout(timeout, self.tasks.wait()).await.is_ok() {
            return true;
        }
        warn!(
            remaining_tasks = self.tasks.len(),
            active_sessions = self.active_sessions(),
            "Timed out waiting for relay sessions to close"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> Arc<AppState> {
        let mut config = RelayConfig::default();
        config.api_key = Some("sk-test".to_string());
        AppState::new(config, ProfileRegistry::default()).unwrap()
    }

    #[test]
    fn test_session_registry() {
        let state = state();
        assert_eq!(state.active_sessions(), 0);

        state.register_session("a", "coach");
        state.register_session("b", "coach");
        assert_eq!(state.active_sessions(), 2);

        let removed = state.unregister_session("a").unwrap();
        assert_eq!(removed.profile, "coach");
        assert!(state.unregister_session("a").is_none());
        assert_eq!(state.active_sessions(), 1);
    }

    #[test]
    fn test_shutdown_cancels_tokens() {
        let state = state();
        let token = state.shutdown_token();
        assert!(!token.is_cancelled());

        state.shutdown();
        assert!(token.is_cancelled());
        assert!(state.is_shutting_down());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_tracked_tasks() {
        let state = state();
        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let flag = finished.clone();
        state.task_tracker().spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        });

        assert!(state.drain_sessions(Duration::from_secs(5)).await);
        assert!(finished.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_gives_up_after_timeout() {
        let state = state();
        state
            .task_tracker()
            .spawn(tokio::time::sleep(Duration::from_secs(60)));

        assert!(!state.drain_sessions(Duration::from_secs(1)).await);
    }

    #[test]
    fn test_static_key_credentials() {
        assert!(state().credentials.is_static());
    }
}
