pub mod admin;
pub mod auth;
pub mod upload;

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::AppState;

/// GET /health — liveness, no auth. Reports the media load (rooms and
/// peers) alongside the presence count.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "mediaRooms": state.sfu.room_count(),
        "mediaPeers": state.sfu.total_peer_count(),
        "onlineUsers": state.registry.online_users().len(),
    }))
}
