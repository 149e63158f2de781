use axum::{Json, extract::State};
use serde::Serialize;
use std::sync::Arc;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_sessions: usize,
}

/// `GET /` liveness check with the number of live relay sessions.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: if state.is_shutting_down() {
            "shutting_down"
        } else {
            "ok"
        },
        active_sessions: state.active_sessions(),
    })
}
