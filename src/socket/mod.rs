//! Connection supervisor: the top-level socket event dispatcher.
//!
//! Owns the connect/disconnect hooks and wires every event handler. On
//! disconnect the teardown order is load-bearing: media first (which may
//! stop a recording), then presence, then the registry entry, then the
//! fresh online snapshot — no handler ever observes a half-torn-down
//! session.

pub mod calls;
pub mod chat;
pub mod media;

use std::sync::Arc;

use serde_json::json;
use socketioxide::extract::SocketRef;
use tracing::{info, warn};

use crate::AppState;

// ─── Payload helpers ────────────────────────────────────────────────────────

pub(crate) fn str_field<'a>(payload: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(|v| v.as_str())
}

pub(crate) fn uuid_field(payload: &serde_json::Value, key: &str) -> Option<uuid::Uuid> {
    str_field(payload, key).and_then(|s| s.parse().ok())
}

pub(crate) fn i64_field(payload: &serde_json::Value, key: &str) -> Option<i64> {
    payload.get(key).and_then(|v| v.as_i64())
}

// ─── Connect / disconnect ───────────────────────────────────────────────────

pub async fn on_connect_with_state(socket: SocketRef, state: Arc<AppState>) {
    // Every socket addresses itself through a room named by its own id, so
    // `io.to(<session id>)` works for session-targeted emits.
    let session_id = socket.id.to_string();
    socket.join(session_id.clone()).ok();

    info!(sid = %session_id, "socket connected");

    chat::register_handlers(&socket, &state);
    calls::register_handlers(&socket, &state);
    media::register_handlers(&socket, &state);

    socket.on_disconnect({
        let state = state.clone();
        move |socket: SocketRef| {
            let state = state.clone();
            async move {
                on_disconnect_with_state(socket, state).await;
            }
        }
    });
}

async fn on_disconnect_with_state(socket: SocketRef, state: Arc<AppState>) {
    let session_id = socket.id.to_string();
    info!(sid = %session_id, "socket disconnected");

    // (1) Unwind media: cascades producer/consumer/transport closure, may
    // stop a recording, and destroys rooms that became empty.
    for room_id in state.sfu.rooms_of_session(&session_id) {
        if let Some(room) = state.sfu.remove_peer(&room_id, &session_id) {
            media::broadcast_peer_left(&state, &room, &session_id);
            state.recording.maybe_stop(&room).await;
            state.sfu.remove_room_if_empty(&room_id);
        }
    }

    // (2) Flip presence if this was the user's last session.
    if let Some((entry, was_last)) = state.registry.unregister(&session_id) {
        if was_last {
            match state.db.get() {
                Ok(mut conn) => {
                    if let Err(e) = crate::store::set_online(&mut conn, entry.user_id, false) {
                        warn!(user_id = %entry.user_id, error = %e, "failed to mark user offline");
                    }
                }
                Err(e) => warn!(error = %e, "no database connection for presence update"),
            }
            let _ = state.io.emit(
                "user_status_changed",
                &json!({
                    "userId": entry.user_id,
                    "username": entry.username,
                    "isOnline": false,
                    "lastSeen": chrono::Utc::now(),
                }),
            );
        }
    }

    // (3)+(4) The registry entry is already gone; publish the new snapshot.
    let _ = state
        .io
        .emit("users_online", &state.registry.online_users());
}
