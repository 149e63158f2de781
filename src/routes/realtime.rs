//! Realtime relay route configuration

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::realtime::realtime_handler;
use crate::state::AppState;
use std::sync::Arc;

/// Create the realtime relay router
///
/// # Endpoint
///
/// `GET /realtime` - WebSocket upgrade
///
/// # Example
///
/// ```json
/// // Client selects a profile
/// {"kind": "init", "profile": "language-coach"}
///
/// // Relay confirms once the service session exists
/// {"kind": "control", "action": "session_created", "id": "..."}
///
/// // Client sends audio as binary frames and typed input as user_message
/// {"kind": "user_message", "text": "How do I say good morning?"}
///
/// // Relay streams text deltas and binary response audio
/// {"kind": "text_delta", "id": "item_123", "delta": "Bon"}
/// ```
pub fn create_realtime_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/realtime", get(realtime_handler))
        .layer(TraceLayer::new_for_http())
}
