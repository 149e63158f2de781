//! Upstream WebSocket link.
//!
//! [`UpstreamConnector::connect`] authenticates, performs the handshake and
//! spawns one I/O task per link. The task owns both halves of the socket:
//! it drains the outbound queue, forwards inbound text frames to the
//! session, and answers pings. A byte counter tracks data accepted by
//! [`UpstreamHandle`] but not yet written, which is what the audio buffer
//! reads as the link's buffered amount.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_util::task::TaskTracker;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};
use url::Url;

use super::config::{Backend, UpstreamEndpoint};
use super::messages::ClientEvent;
use crate::core::audio::AudioSink;
use crate::core::credentials::{AuthMaterial, CredentialProvider};
use crate::errors::{RelayError, RelayResult, UpstreamConnectError};

/// Inbound frames buffered between the I/O task and the session.
const INBOUND_CHANNEL_SIZE: usize = 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Base64 payloads above this size are logged.
const LARGE_PAYLOAD_LOG_BYTES: usize = 5 * 1024 * 1024;

// =============================================================================
// Connector
// =============================================================================

/// Opens authenticated links to the realtime service.
#[derive(Debug, Clone)]
pub struct UpstreamConnector {
    endpoint: UpstreamEndpoint,
    credentials: Arc<CredentialProvider>,
    tasks: TaskTracker,
}

impl UpstreamConnector {
    pub fn new(endpoint: UpstreamEndpoint, credentials: Arc<CredentialProvider>) -> Self {
        Self {
            endpoint,
            credentials,
            tasks: TaskTracker::new(),
        }
    }

    /// Spawn link I/O tasks on `tasks` so shutdown can wait for them.
    pub fn with_task_tracker(mut self, tasks: TaskTracker) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn endpoint(&self) -> &UpstreamEndpoint {
        &self.endpoint
    }

    /// Open a new link. No retry is attempted on failure.
    pub async fn connect(&self) -> Result<UpstreamConnection, UpstreamConnectError> {
        let auth = self.credentials.acquire().await?;
        let url = self.endpoint.websocket_url()?;
        let request = build_handshake_request(&url, self.endpoint.backend, &auth)?;

        debug!(backend = %self.endpoint.backend, host = ?url.host_str(), "Connecting to realtime service");

        let (ws_stream, _response) =
            tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| UpstreamConnectError::Handshake("connection timed out".to_string()))?
                .map_err(|e| UpstreamConnectError::Handshake(e.to_string()))?;

        info!(backend = %self.endpoint.backend, "Connected to realtime service");

        Ok(UpstreamConnection::spawn(ws_stream, &self.tasks))
    }
}

/// Build the WebSocket upgrade request with backend-specific auth headers.
pub fn build_handshake_request(
    url: &Url,
    backend: Backend,
    auth: &AuthMaterial,
) -> Result<http::Request<()>, UpstreamConnectError> {
    let host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => {
            return Err(UpstreamConnectError::InvalidRequest(format!(
                "URL has no host: {url}"
            )));
        }
    };

    let mut builder = http::Request::builder()
        .uri(url.as_str())
        .header(
            "Sec-WebSocket-Key",
            tungstenite::handshake::client::generate_key(),
        )
        .header("Sec-WebSocket-Version", "13")
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Host", host);

    builder = match (backend, auth) {
        (Backend::Azure, AuthMaterial::ApiKey(key)) => builder.header("api-key", key.as_str()),
        (Backend::Azure, AuthMaterial::BearerToken(token)) => {
            builder.header("Authorization", format!("Bearer {token}"))
        }
        (Backend::OpenAI, auth) => builder
            .header("Authorization", format!("Bearer {}", auth.secret()))
            .header("OpenAI-Beta", "realtime=v1"),
    };

    builder
        .body(())
        .map_err(|e| UpstreamConnectError::InvalidRequest(e.to_string()))
}

// =============================================================================
// Connection
// =============================================================================

enum Outbound {
    Frame { message: Message, counted: usize },
    Close,
}

/// Cheap, cloneable sending side of an upstream link.
#[derive(Debug, Clone)]
pub struct UpstreamHandle {
    tx: mpsc::UnboundedSender<Outbound>,
    buffered: Arc<AtomicUsize>,
    open: Arc<AtomicBool>,
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Frame { counted, .. } => write!(f, "Frame({counted} bytes)"),
            Self::Close => f.write_str("Close"),
        }
    }
}

impl UpstreamHandle {
    fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            tx,
            buffered: Arc::new(AtomicUsize::new(0)),
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Serialize and queue an event for the service.
    pub fn send_event(&self, event: &ClientEvent) -> RelayResult<()> {
        let json = event.to_json()?;
        self.send_text(json)
    }

    fn send_text(&self, json: String) -> RelayResult<()> {
        if !self.is_open() {
            return Err(RelayError::NotConnected);
        }

        let counted = json.len();
        self.buffered.fetch_add(counted, Ordering::SeqCst);
        let frame = Outbound::Frame {
            message: Message::Text(json.into()),
            counted,
        };
        if self.tx.send(frame).is_err() {
            self.buffered.fetch_sub(counted, Ordering::SeqCst);
            self.open.store(false, Ordering::SeqCst);
            return Err(RelayError::NotConnected);
        }
        Ok(())
    }

    /// Ask the I/O task to send a close frame and stop. Idempotent.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(Outbound::Close);
        }
    }
}

impl AudioSink for UpstreamHandle {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn send_audio(&self, audio: &[u8]) -> RelayResult<()> {
        let event = ClientEvent::audio_append(audio);
        if let ClientEvent::InputAudioBufferAppend { audio: encoded } = &event
            && encoded.len() > LARGE_PAYLOAD_LOG_BYTES
        {
            debug!(
                "Large audio payload: {:.2} MB base64",
                encoded.len() as f64 / 1024.0 / 1024.0
            );
        }
        self.send_event(&event)
    }
}

/// An established upstream link.
#[derive(Debug)]
pub struct UpstreamConnection {
    handle: UpstreamHandle,
    events: mpsc::Receiver<String>,
    task: Option<JoinHandle<()>>,
}

impl UpstreamConnection {
    /// Spawn the I/O task for an already-upgraded socket on `tasks`.
    pub fn spawn<S>(ws_stream: WebSocketStream<S>, tasks: &TaskTracker) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);
        let handle = UpstreamHandle::new(out_tx);

        let task = tasks.spawn(run_link(
            ws_stream,
            out_rx,
            in_tx,
            handle.buffered.clone(),
            handle.open.clone(),
        ));

        Self {
            handle,
            events: in_rx,
            task: Some(task),
        }
    }

    pub fn handle(&self) -> &UpstreamHandle {
        &self.handle
    }

    /// Split into the sending handle and the inbound text frame stream.
    /// The stream ends when the link closes.
    pub fn into_parts(self) -> (UpstreamHandle, mpsc::Receiver<String>) {
        // The I/O task stays on the tracker and exits on close.
        drop(self.task);
        (self.handle, self.events)
    }
}

async fn run_link<S>(
    ws_stream: WebSocketStream<S>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    inbound: mpsc::Sender<String>,
    buffered: Arc<AtomicUsize>,
    open: Arc<AtomicBool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    loop {
        tokio::select! {
            command = outbound.recv() => {
                match command {
                    Some(Outbound::Frame { message, counted }) => {
                        let result = ws_sink.send(message).await;
                        buffered.fetch_sub(counted, Ordering::SeqCst);
                        if let Err(e) = result {
                            error!("Failed to send upstream message: {}", e);
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        debug!("Closing upstream link");
                        let _ = tokio::time::timeout(CLOSE_TIMEOUT, ws_sink.send(Message::Close(None))).await;
                        break;
                    }
                }
            }

            msg = ws_stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if inbound.send(text.as_str().to_owned()).await.is_err() {
                            debug!("Session stopped reading upstream events");
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_sink.send(Message::Pong(data)).await {
                            error!("Failed to send pong: {}", e);
                            break;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(reason = ?frame, "Upstream link closed by service");
                        break;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!(len = data.len(), "Ignoring binary frame from upstream");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("Upstream WebSocket error: {}", e);
                        break;
                    }
                    None => {
                        info!("Upstream stream ended");
                        break;
                    }
                }
            }
        }
    }

    open.store(false, Ordering::SeqCst);
    // Dropping `inbound` ends the session's event stream.
}

// =============================================================================
// Test support
// =============================================================================

/// Service side of a connection that has no socket behind it.
#[cfg(test)]
pub(crate) struct DetachedUpstream {
    outbound: mpsc::UnboundedReceiver<Outbound>,
    pub inbound: mpsc::Sender<String>,
    pub buffered: Arc<AtomicUsize>,
    pub open: Arc<AtomicBool>,
}

#[cfg(test)]
impl DetachedUpstream {
    /// Text frames sent so far, parsed as JSON.
    pub fn sent_events(&mut self) -> Vec<serde_json::Value> {
        let mut events = Vec::new();
        while let Ok(command) = self.outbound.try_recv() {
            if let Outbound::Frame {
                message: Message::Text(text),
                counted,
            } = command
            {
                self.buffered.fetch_sub(counted, Ordering::SeqCst);
                if let Ok(value) = serde_json::from_str(text.as_str()) {
                    events.push(value);
                }
            }
        }
        events
    }

    /// Whether a close was requested.
    pub fn close_requested(&mut self) -> bool {
        let mut closed = false;
        while let Ok(command) = self.outbound.try_recv() {
            if matches!(command, Outbound::Close) {
                closed = true;
            }
        }
        closed
    }
}

#[cfg(test)]
impl UpstreamConnection {
    /// A connection backed by in-memory channels.
    pub(crate) fn detached() -> (Self, DetachedUpstream) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);
        let handle = UpstreamHandle::new(out_tx);
        let remote = DetachedUpstream {
            outbound: out_rx,
            inbound: in_tx,
            buffered: handle.buffered.clone(),
            open: handle.open.clone(),
        };
        (
            Self {
                handle,
                events: in_rx,
                task: None,
            },
            remote,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header<'a>(request: &'a http::Request<()>, name: &str) -> Option<&'a str> {
        request.headers().get(name).and_then(|v| v.to_str().ok())
    }

    #[test]
    fn test_direct_handshake_headers() {
        let url = Url::parse("wss://api.openai.com/v1/realtime?model=gpt-realtime").unwrap();
        let request =
            build_handshake_request(&url, Backend::OpenAI, &AuthMaterial::ApiKey("sk-1".into()))
                .unwrap();

        assert_eq!(header(&request, "Authorization"), Some("Bearer sk-1"));
        assert_eq!(header(&request, "OpenAI-Beta"), Some("realtime=v1"));
        assert_eq!(header(&request, "Host"), Some("api.openai.com"));
        assert!(header(&request, "api-key").is_none());
    }

    #[test]
    fn test_gateway_key_header() {
        let url = Url::parse("wss://res.openai.azure.com/openai/realtime?deployment=d").unwrap();
        let request =
            build_handshake_request(&url, Backend::Azure, &AuthMaterial::ApiKey("k".into()))
                .unwrap();

        assert_eq!(header(&request, "api-key"), Some("k"));
        assert!(header(&request, "Authorization").is_none());
        assert!(header(&request, "OpenAI-Beta").is_none());
    }

    #[test]
    fn test_gateway_token_header() {
        let url = Url::parse("wss://res.openai.azure.com:8443/openai/realtime").unwrap();
        let request = build_handshake_request(
            &url,
            Backend::Azure,
            &AuthMaterial::BearerToken("tok".into()),
        )
        .unwrap();

        assert_eq!(header(&request, "Authorization"), Some("Bearer tok"));
        assert_eq!(header(&request, "Host"), Some("res.openai.azure.com:8443"));
    }

    #[tokio::test]
    async fn test_send_tracks_buffered_amount() {
        let (connection, mut remote) = UpstreamConnection::detached();
        let handle = connection.handle().clone();

        handle.send_audio(&[0u8; 300]).unwrap();
        assert!(handle.buffered_amount() > 400);

        let events = remote.sent_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "input_audio_buffer.append");
        assert_eq!(handle.buffered_amount(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (connection, mut remote) = UpstreamConnection::detached();
        let handle = connection.handle().clone();

        handle.close();
        handle.close();
        assert!(!handle.is_open());
        assert!(remote.close_requested());
        assert!(!remote.close_requested());
        assert!(matches!(
            handle.send_event(&ClientEvent::response_create()),
            Err(RelayError::NotConnected)
        ));
    }
}
