//! Client WebSocket entry point
//!
//! Upgrades the connection, waits for a valid `init` frame and then hands
//! the socket to exactly one [`RelaySession`].

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt, future};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::messages::{ClientFrame, ClientMessage, ClientRoute};
use super::session::RelaySession;
use crate::config::{Profile, ProfileRegistry};
use crate::state::AppState;

/// Outgoing messages buffered between the session and the socket writer
const CHANNEL_BUFFER_SIZE: usize = 1024;

/// Maximum WebSocket frame size (10 MB)
const MAX_WS_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Maximum WebSocket message size (10 MB)
const MAX_WS_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// How long the writer gets to deliver the close frame
const SENDER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Realtime relay WebSocket handler
///
/// Upgrades the HTTP connection to a WebSocket. The first valid
/// `{"kind": "init", "profile": ...}` frame starts the relay session.
pub async fn realtime_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    info!("Realtime relay connection upgrade requested");

    // Tracked so shutdown can wait for the final flush and close frames.
    let tasks = state.task_tracker();
    ws.max_frame_size(MAX_WS_FRAME_SIZE)
        .max_message_size(MAX_WS_MESSAGE_SIZE)
        .on_upgrade(move |socket| tasks.track_future(handle_client_socket(socket, state)))
}

/// Result of inspecting a frame received before initialization.
#[derive(Debug, Clone, PartialEq)]
pub enum InitDecision {
    /// Valid init for a known profile
    Accept(Arc<Profile>),
    /// Init naming a profile that does not exist
    UnknownProfile(String),
    /// Well-formed, but not an init frame
    NotInit,
    /// Not a client message at all
    Malformed(String),
}

/// Decide what a pre-initialization text frame means.
pub fn evaluate_init(text: &str, profiles: &ProfileRegistry) -> InitDecision {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Init { profile }) => match profiles.get(&profile) {
            Some(found) => InitDecision::Accept(found),
            None => InitDecision::UnknownProfile(profile),
        },
        Ok(_) => InitDecision::NotInit,
        Err(e) => InitDecision::Malformed(e.to_string()),
    }
}

fn client_frame(msg: Result<Message, axum::Error>) -> Option<ClientFrame> {
    match msg {
        Ok(Message::Text(text)) => Some(ClientFrame::Text(text.as_str().to_owned())),
        Ok(Message::Binary(data)) => Some(ClientFrame::Binary(data)),
        Ok(Message::Close(_)) => Some(ClientFrame::Close),
        // Pings are answered by axum
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
        Err(e) => {
            warn!("Client WebSocket error: {}", e);
            Some(ClientFrame::Close)
        }
    }
}

async fn handle_client_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("Realtime relay connection established");

    let (mut sender, receiver) = socket.split();
    let (client_tx, mut client_rx) = mpsc::channel::<ClientRoute>(CHANNEL_BUFFER_SIZE);

    // Sender task for outgoing messages
    let mut sender_task = tokio::spawn(async move {
        while let Some(route) = client_rx.recv().await {
            let should_close = matches!(route, ClientRoute::Close);

            let result = match route {
                ClientRoute::Outgoing(message) => match serde_json::to_string(&message) {
                    Ok(json_str) => sender.send(Message::Text(json_str.into())).await,
                    Err(e) => {
                        error!("Failed to serialize outgoing message: {}", e);
                        continue;
                    }
                },
                ClientRoute::Audio(data) => sender.send(Message::Binary(data)).await,
                ClientRoute::Close => {
                    debug!("Closing client WebSocket connection");
                    sender.send(Message::Close(None)).await
                }
            };

            if let Err(e) = result {
                debug!("Failed to send WebSocket message: {}", e);
                break;
            }

            if should_close {
                break;
            }
        }
    });

    let mut frames = receiver.filter_map(|msg| future::ready(client_frame(msg)));
    let shutdown = state.shutdown_token();

    let profile = loop {
        let frame = tokio::select! {
            frame = frames.next() => frame,
            _ = shutdown.cancelled() => None,
        };

        match frame {
            Some(ClientFrame::Text(text)) => match evaluate_init(&text, &state.profiles) {
                InitDecision::Accept(profile) => break Some(profile),
                InitDecision::UnknownProfile(id) => {
                    warn!(profile = %id, "Unknown profile requested, waiting for a valid init");
                }
                InitDecision::NotInit => debug!("Ignoring message received before init"),
                InitDecision::Malformed(e) => warn!("Dropping malformed client frame: {}", e),
            },
            Some(ClientFrame::Binary(data)) => {
                debug!(len = data.len(), "Ignoring audio received before init");
            }
            Some(ClientFrame::Close) | None => {
                info!("Client left before initialization");
                break None;
            }
        }
    };

    if let Some(profile) = profile {
        let session = RelaySession::new(
            profile.clone(),
            state.settings.clone(),
            state.audio_config.clone(),
            client_tx.clone(),
        );
        let session_id = session.id().to_string();
        state.register_session(&session_id, &profile.id);
        info!(
            session_id = %session_id,
            profile = %profile.id,
            active_sessions = state.active_sessions(),
            "Relay session created"
        );

        session.run(&state.connector, &mut frames, shutdown).await;

        state.unregister_session(&session_id);
    } else {
        let _ = client_tx.send(ClientRoute::Close).await;
    }

    drop(client_tx);
    if tokio::time::timeout(SENDER_DRAIN_TIMEOUT, &mut sender_task)
        .await
        .is_err()
    {
        sender_task.abort();
    }

    info!(
        active_sessions = state.active_sessions(),
        "Realtime relay connection closed"
    );
}
