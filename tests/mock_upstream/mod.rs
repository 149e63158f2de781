//! Mock realtime service
//!
//! Accepts WebSocket connections the way the hosted service does, records
//! every event the relay sends, and lets a test push events back or drop
//! the link.

// Not every test binary uses every helper
#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        Message,
        handshake::server::{ErrorResponse, Request, Response},
    },
};

/// Handshake details captured for the most recent connection.
#[derive(Debug, Clone, Default)]
pub struct CapturedHandshake {
    pub path_and_query: String,
    pub headers: Vec<(String, String)>,
}

impl CapturedHandshake {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

enum Command {
    Send(Value),
    Drop,
}

#[derive(Default)]
struct MockState {
    received: Mutex<Vec<Value>>,
    handshake: Mutex<Option<CapturedHandshake>>,
    connection_count: AtomicU64,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
}

/// Scripted realtime service listening on a local port.
pub struct MockRealtimeServer {
    pub addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockRealtimeServer {
    /// Start the server. Every new connection immediately receives
    /// `session.created`, as the hosted service does.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockState::default());

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, state).await;
                });
            }
        });

        Self { addr, state }
    }

    pub fn http_endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_endpoint(&self) -> String {
        format!("ws://{}/v1/realtime", self.addr)
    }

    pub fn connection_count(&self) -> u64 {
        self.state.connection_count.load(Ordering::SeqCst)
    }

    pub fn handshake(&self) -> Option<CapturedHandshake> {
        self.state.handshake.lock().clone()
    }

    /// All events received so far.
    pub fn received(&self) -> Vec<Value> {
        self.state.received.lock().clone()
    }

    /// Received events of one type.
    pub fn received_of(&self, event_type: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|e| e["type"] == event_type)
            .collect()
    }

    /// Wait until at least `count` events of `event_type` have arrived.
    pub async fn wait_for(&self, event_type: &str, count: usize) -> Vec<Value> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let events = self.received_of(event_type);
            if events.len() >= count {
                return events;
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "Timed out waiting for {count} '{event_type}' events, got {}: {:?}",
                    events.len(),
                    self.received()
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Push an event to the connected relay.
    pub fn send(&self, event: Value) {
        if let Some(tx) = self.state.commands.lock().as_ref() {
            let _ = tx.send(Command::Send(event));
        }
    }

    /// Drop the current connection without a close handshake.
    pub fn drop_connection(&self) {
        if let Some(tx) = self.state.commands.lock().as_ref() {
            let _ = tx.send(Command::Drop);
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    state: Arc<MockState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let capture_state = state.clone();
    let ws_stream = accept_hdr_async(stream, move |req: &Request, resp: Response| {
        let headers = req
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|p| p.to_string())
            .unwrap_or_default();
        *capture_state.handshake.lock() = Some(CapturedHandshake {
            path_and_query,
            headers,
        });
        Ok::<Response, ErrorResponse>(resp)
    })
    .await?;

    let (mut write, mut read) = ws_stream.split();
    let conn_id = state.connection_count.fetch_add(1, Ordering::SeqCst) + 1;

    let (tx, mut rx) = mpsc::unbounded_channel();
    *state.commands.lock() = Some(tx);

    let created = json!({
        "type": "session.created",
        "event_id": format!("event_{conn_id}"),
        "session": {"id": format!("sess_mock_{conn_id}"), "model": "gpt-realtime"}
    });
    write.send(Message::Text(created.to_string().into())).await?;

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(value) = serde_json::from_str::<Value>(text.as_str()) {
                        state.received.lock().push(value);
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
            command = rx.recv() => match command {
                Some(Command::Send(event)) => {
                    write.send(Message::Text(event.to_string().into())).await?;
                }
                Some(Command::Drop) | None => break,
            },
        }
    }

    Ok(())
}
