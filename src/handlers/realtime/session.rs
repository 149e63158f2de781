//! One relay session: a client connection bridged to one upstream link.
//!
//! The session is a single-writer actor. [`RelaySession::run`] owns the
//! audio buffer, the flush deadline and both link handles, and multiplexes
//! client frames, upstream frames and the flush timer in one `select!`
//! loop. Nothing else mutates session state, so flushes never overlap and a
//! pending timer is always cleared before an immediate flush.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::messages::{ClientFrame, ClientMessage, ClientRoute};
use super::router;
use crate::config::Profile;
use crate::core::audio::{AudioBatchConfig, AudioSink, AudioUplinkBuffer, FlushOutcome};
use crate::core::upstream::{
    ClientEvent, ConversationItem, ResponseConfig, SessionConfig, SessionSettings,
    UpstreamConnector, UpstreamEvent, UpstreamHandle,
};
use crate::errors::{RelayError, RelayResult};

/// How long disposal waits to queue the close frame for a slow client.
const CLIENT_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Active,
    Disposing,
    Disposed,
}

/// Relay state for one client.
pub struct RelaySession {
    id: String,
    profile: Arc<Profile>,
    settings: SessionSettings,
    state: SessionState,
    client_tx: mpsc::Sender<ClientRoute>,
    upstream: Option<UpstreamHandle>,
    audio: AudioUplinkBuffer,
    greeting_sent: bool,
}

impl RelaySession {
    pub fn new(
        profile: Arc<Profile>,
        settings: SessionSettings,
        audio_config: AudioBatchConfig,
        client_tx: mpsc::Sender<ClientRoute>,
    ) -> Self {
        Self::with_id(
            uuid::Uuid::new_v4().to_string(),
            profile,
            settings,
            audio_config,
            client_tx,
        )
    }

    pub fn with_id(
        id: String,
        profile: Arc<Profile>,
        settings: SessionSettings,
        audio_config: AudioBatchConfig,
        client_tx: mpsc::Sender<ClientRoute>,
    ) -> Self {
        Self {
            id,
            profile,
            settings,
            state: SessionState::Initializing,
            client_tx,
            upstream: None,
            audio: AudioUplinkBuffer::new(audio_config),
            greeting_sent: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn audio(&self) -> &AudioUplinkBuffer {
        &self.audio
    }

    /// When the audio buffer wants to be flushed next.
    pub fn flush_deadline(&self) -> Option<Instant> {
        self.audio.flush_deadline()
    }

    fn is_terminal(&self) -> bool {
        matches!(self.state, SessionState::Disposing | SessionState::Disposed)
    }

    /// Take ownership of a freshly opened upstream link and configure it.
    pub fn attach_upstream(&mut self, handle: UpstreamHandle) -> RelayResult<()> {
        if self.is_terminal() {
            handle.close();
            return Err(RelayError::Disposed);
        }

        let session = SessionConfig::for_profile(
            &self.settings,
            &self.profile.instructions,
            &self.profile.tools,
        );
        let result = handle.send_event(&ClientEvent::SessionUpdate { session });
        self.upstream = Some(handle);
        result?;

        self.state = SessionState::Active;
        info!(
            tools = self.profile.tools.len(),
            "Session configuration sent to realtime service"
        );
        Ok(())
    }

    // =========================================================================
    // Client side
    // =========================================================================

    /// Handle one client text frame.
    pub fn handle_client_text(&mut self, text: &str) -> RelayResult<()> {
        if self.is_terminal() {
            return Ok(());
        }

        let message: ClientMessage = serde_json::from_str(text)?;
        match message {
            ClientMessage::UserMessage { text } => {
                debug!(text_length = text.len(), "Forwarding user message");
                let upstream = self.upstream.as_ref().ok_or(RelayError::NotConnected)?;
                upstream.send_event(&ClientEvent::ConversationItemCreate {
                    item: ConversationItem::user_text(text),
                })?;
                upstream.send_event(&ClientEvent::response_create())?;
            }
            ClientMessage::Init { profile } => {
                warn!(profile = %profile, "Session already initialized, ignoring init");
            }
            ClientMessage::Other => {
                debug!("Ignoring unsupported client message");
            }
        }
        Ok(())
    }

    /// Queue one client audio frame.
    pub fn handle_client_binary(&mut self, data: Bytes) {
        if self.is_terminal() || data.is_empty() {
            return;
        }
        let Some(upstream) = self.upstream.as_ref() else {
            return;
        };
        if let Some(outcome) = self.audio.push(data, upstream) {
            debug!(?outcome, "Audio buffer flushed on size threshold");
        }
    }

    /// The flush deadline elapsed.
    pub fn on_flush_timer(&mut self) -> FlushOutcome {
        match self.upstream.as_ref() {
            Some(upstream) if !self.is_terminal() => self.audio.flush(upstream),
            _ => {
                self.audio.cancel_pending_flush();
                FlushOutcome::Empty
            }
        }
    }

    // =========================================================================
    // Upstream side
    // =========================================================================

    /// Handle one upstream text frame.
    pub fn handle_upstream_text(&mut self, text: &str) -> RelayResult<()> {
        if self.is_terminal() {
            return Ok(());
        }

        let (event_type, event) = UpstreamEvent::parse(text)?;

        match &event {
            UpstreamEvent::AudioDone { .. } | UpstreamEvent::ResponseDone { .. } => {
                self.audio.metrics_mut().record_response();
            }
            UpstreamEvent::Unknown => {
                debug!(event_type = %event_type, "Unhandled realtime event");
            }
            _ => {}
        }

        if let Some(route) = router::route(&self.id, &event) {
            self.send_to_client(route);
        }

        if matches!(event, UpstreamEvent::SessionCreated { .. }) {
            self.send_greeting();
        }
        Ok(())
    }

    fn send_greeting(&mut self) {
        if self.greeting_sent {
            return;
        }
        let Some(upstream) = self.upstream.as_ref() else {
            return;
        };
        self.greeting_sent = true;

        let prefix: String = self.id.chars().take(8).collect();
        let event = ClientEvent::ResponseCreate {
            event_id: Some(format!("greeting_{prefix}")),
            response: Some(ResponseConfig {
                modalities: Some(self.settings.modalities.clone()),
                instructions: self.profile.greeting.clone(),
                voice: Some(self.settings.voice.clone()),
            }),
        };
        match upstream.send_event(&event) {
            Ok(()) => debug!("Greeting requested"),
            Err(e) => warn!("Failed to request greeting: {}", e),
        }
    }

    /// Queue a message for the client without waiting. A client that stops
    /// reading loses messages instead of stalling the session loop.
    fn send_to_client(&self, route: ClientRoute) {
        match self.client_tx.try_send(route) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Client is not reading, dropping message");
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Client sender closed, dropping message");
            }
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Tear the session down. Safe to call any number of times.
    pub async fn dispose(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.state = SessionState::Disposing;

        self.audio.cancel_pending_flush();
        if let Some(upstream) = self.upstream.as_ref()
            && upstream.is_open()
            && !self.audio.is_empty()
        {
            let outcome = self.audio.flush(upstream);
            debug!(?outcome, "Final audio flush");
        }
        self.audio.clear();

        if let Some(stats) = self.audio.metrics().summary() {
            match serde_json::to_string(&stats) {
                Ok(stats) => info!(stats = %stats, "Audio session stats"),
                Err(e) => warn!("Failed to serialize audio stats: {}", e),
            }
        }

        if let Some(upstream) = self.upstream.take() {
            upstream.close();
        }
        match tokio::time::timeout(CLIENT_CLOSE_TIMEOUT, self.client_tx.send(ClientRoute::Close))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(_)) => debug!("Client sender already closed"),
            Err(_) => warn!("Client is not reading, close frame not queued"),
        }

        self.state = SessionState::Disposed;
        info!("Relay session disposed");
    }

    /// Drive the session until the client leaves, the upstream link drops or
    /// `shutdown` fires. The session is always disposed on return.
    pub async fn run<S>(
        mut self,
        connector: &UpstreamConnector,
        client: &mut S,
        shutdown: CancellationToken,
    ) where
        S: Stream<Item = ClientFrame> + Unpin,
    {
        let span = info_span!(
            "relay_session",
            session_id = %self.id,
            profile = %self.profile.id
        );

        async move {
            info!("Relay session starting");

            let connected = tokio::select! {
                result = connector.connect() => Some(result),
                _ = shutdown.cancelled() => None,
            };

            let connection = match connected {
                Some(Ok(connection)) => connection,
                Some(Err(e)) => {
                    error!("Failed to connect to realtime service: {}", e);
                    self.dispose().await;
                    return;
                }
                None => {
                    info!("Shutdown requested before upstream connected");
                    self.dispose().await;
                    return;
                }
            };

            let (handle, mut upstream_rx) = connection.into_parts();
            if let Err(e) = self.attach_upstream(handle) {
                error!("Failed to configure upstream session: {}", e);
                self.dispose().await;
                return;
            }

            loop {
                let deadline = self.flush_deadline();

                tokio::select! {
                    frame = client.next() => match frame {
                        Some(ClientFrame::Text(text)) => {
                            if let Err(e) = self.handle_client_text(&text) {
                                warn!("Dropping client message: {}", e);
                            }
                        }
                        Some(ClientFrame::Binary(data)) => self.handle_client_binary(data),
                        Some(ClientFrame::Close) | None => {
                            info!("Client disconnected");
                            break;
                        }
                    },

                    event = upstream_rx.recv() => match event {
                        Some(text) => {
                            if let Err(e) = self.handle_upstream_text(&text) {
                                warn!("Dropping upstream message: {}", e);
                            }
                        }
                        None => {
                            info!("Upstream link closed");
                            break;
                        }
                    },

                    _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                        if deadline.is_some() =>
                    {
                        self.on_flush_timer();
                    }

                    _ = shutdown.cancelled() => {
                        info!("Shutdown requested, closing session");
                        break;
                    }
                }
            }

            self.dispose().await;
        }
        .instrument(span)
        .await
    }
}
