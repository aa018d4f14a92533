//! Signalling bridge: routes offer/answer/ICE between sessions and drives
//! the persisted call lifecycle.
//!
//! Targets may be a session id (used directly) or a user id (resolved
//! through the registry, first live session wins). A target with no live
//! session drops the wire event silently — the DB transition still happens.

use std::sync::Arc;

use serde_json::{json, Value};
use socketioxide::extract::{AckSender, Data, SocketRef};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ack_err, ack_ok};
use crate::store;
use crate::AppState;

use super::{i64_field, str_field, uuid_field};

pub fn register_handlers(socket: &SocketRef, state: &Arc<AppState>) {
    socket.on("call_user", {
        let state = state.clone();
        move |socket: SocketRef, Data::<Value>(payload)| {
            let state = state.clone();
            async move { on_call_user(socket, payload, &state).await }
        }
    });

    socket.on("answer_call", {
        let state = state.clone();
        move |socket: SocketRef, Data::<Value>(payload)| {
            let state = state.clone();
            async move { on_answer_call(socket, payload, &state).await }
        }
    });

    socket.on("reject_call", {
        let state = state.clone();
        move |socket: SocketRef, Data::<Value>(payload)| {
            let state = state.clone();
            async move { on_reject_call(socket, payload, &state).await }
        }
    });

    socket.on("end_call", {
        let state = state.clone();
        move |socket: SocketRef, Data::<Value>(payload)| {
            let state = state.clone();
            async move { on_end_call(socket, payload, &state).await }
        }
    });

    socket.on("ice_candidate", {
        let state = state.clone();
        move |socket: SocketRef, Data::<Value>(payload)| {
            let state = state.clone();
            async move { on_ice_candidate(socket, payload, &state).await }
        }
    });

    socket.on("get_call_history", {
        let state = state.clone();
        move |_socket: SocketRef, Data::<Value>(payload), ack: AckSender| {
            let state = state.clone();
            async move { on_get_call_history(payload, &state, ack).await }
        }
    });

    socket.on("get_recordings", {
        let state = state.clone();
        move |_socket: SocketRef, Data::<Value>(payload), ack: AckSender| {
            let state = state.clone();
            async move { on_get_recordings(payload, &state, ack).await }
        }
    });
}

/// Resolve a target identifier: live session id first, then user id.
fn resolve_target(state: &Arc<AppState>, target: &str) -> Option<String> {
    if state.registry.contains_session(target) {
        return Some(target.to_string());
    }
    target
        .parse::<Uuid>()
        .ok()
        .and_then(|user_id| state.registry.session_of(user_id))
}

// ─── Handlers ───────────────────────────────────────────────────────────────

async fn on_call_user(socket: SocketRef, payload: Value, state: &Arc<AppState>) {
    let session_id = socket.id.to_string();
    let Some(caller) = state.registry.user_of(&session_id) else {
        warn!(sid = %session_id, "call_user from unregistered session dropped");
        return;
    };
    let Some(to) = str_field(&payload, "to") else {
        warn!("call_user without 'to'");
        return;
    };
    let Some(room_id) = uuid_field(&payload, "roomId") else {
        warn!("call_user without a valid roomId");
        return;
    };
    let is_video = payload
        .get("isVideo")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let call_type = if is_video { "video" } else { "audio" };
    let signal = payload.get("signal").cloned().unwrap_or(Value::Null);

    let call = match state.db.get() {
        Ok(mut conn) => match store::create_call(&mut conn, room_id, caller.user_id, call_type) {
            Ok(call) => call,
            Err(e) => {
                warn!(%room_id, error = %e, "failed to create call");
                return;
            }
        },
        Err(e) => {
            warn!(error = %e, "no database connection for call");
            return;
        }
    };
    state.active_calls.insert(room_id.to_string(), call.id);

    // `incoming_call` goes out unconditionally — to the raw target id when
    // nothing resolves, which may be nobody. `call_ringing` only fires when
    // the callee actually has a live session.
    let callee_session = resolve_target(state, to);
    let target = callee_session
        .clone()
        .unwrap_or_else(|| to.to_string());
    let _ = state.io.to(target).emit(
        "incoming_call",
        &json!({
            "signal": signal,
            "from": session_id,
            "fromUserId": caller.user_id,
            "fromUsername": caller.username,
            "isVideo": is_video,
            "roomId": room_id,
            "callId": call.id,
        }),
    );
    if callee_session.is_some() {
        let _ = socket.emit("call_ringing", &json!({ "roomId": room_id, "callId": call.id }));
    }

    info!(call_id = %call.id, %room_id, caller = %caller.user_id, "call started ringing");
}

async fn on_answer_call(socket: SocketRef, payload: Value, state: &Arc<AppState>) {
    let session_id = socket.id.to_string();
    let Some(callee) = state.registry.user_of(&session_id) else {
        return;
    };
    let (Some(to), Some(room_id)) = (str_field(&payload, "to"), str_field(&payload, "roomId"))
    else {
        warn!("answer_call missing 'to' or 'roomId'");
        return;
    };
    let signal = payload.get("signal").cloned().unwrap_or(Value::Null);

    let Some(call_id) = state.active_calls.get(room_id).map(|entry| *entry.value()) else {
        warn!(room_id, "answer_call for unknown call");
        return;
    };

    match state.db.get() {
        Ok(mut conn) => {
            if let Err(e) = store::answer_call(&mut conn, call_id, callee.user_id) {
                warn!(%call_id, error = %e, "failed to record answer");
            }
        }
        Err(e) => warn!(error = %e, "no database connection for answer"),
    }

    if let Some(target) = resolve_target(state, to) {
        let _ = state.io.to(target).emit(
            "call_accepted",
            &json!({ "signal": signal, "from": session_id, "roomId": room_id }),
        );
    }

    info!(%call_id, room_id, answered_by = %callee.user_id, "call answered");
}

async fn on_reject_call(socket: SocketRef, payload: Value, state: &Arc<AppState>) {
    let session_id = socket.id.to_string();
    let (Some(to), Some(room_id)) = (str_field(&payload, "to"), str_field(&payload, "roomId"))
    else {
        warn!("reject_call missing 'to' or 'roomId'");
        return;
    };

    let Some((_, call_id)) = state.active_calls.remove(room_id) else {
        warn!(room_id, "reject_call for unknown call");
        return;
    };

    match state.db.get() {
        Ok(mut conn) => {
            if let Err(e) = store::reject_call(&mut conn, call_id) {
                warn!(%call_id, error = %e, "failed to record rejection");
            }
        }
        Err(e) => warn!(error = %e, "no database connection for rejection"),
    }

    if let Some(target) = resolve_target(state, to) {
        let _ = state.io.to(target).emit(
            "call_rejected",
            &json!({ "from": session_id, "roomId": room_id }),
        );
    }

    info!(%call_id, room_id, "call rejected");
}

async fn on_end_call(socket: SocketRef, payload: Value, state: &Arc<AppState>) {
    let session_id = socket.id.to_string();
    let (Some(to), Some(room_id)) = (str_field(&payload, "to"), str_field(&payload, "roomId"))
    else {
        warn!("end_call missing 'to' or 'roomId'");
        return;
    };

    let Some((_, call_id)) = state.active_calls.remove(room_id) else {
        warn!(room_id, "end_call for unknown call");
        return;
    };

    let final_status = match state.db.get() {
        Ok(mut conn) => match store::end_call(&mut conn, call_id) {
            Ok(call) => call.status,
            Err(e) => {
                warn!(%call_id, error = %e, "failed to record call end");
                "completed".to_string()
            }
        },
        Err(e) => {
            warn!(error = %e, "no database connection for call end");
            "completed".to_string()
        }
    };

    if let Some(target) = resolve_target(state, to) {
        let _ = state.io.to(target).emit(
            "call_ended",
            &json!({ "from": session_id, "roomId": room_id }),
        );
    }

    info!(%call_id, room_id, status = %final_status, "call ended");
}

async fn on_ice_candidate(socket: SocketRef, payload: Value, state: &Arc<AppState>) {
    let Some(to) = str_field(&payload, "to") else {
        return;
    };
    let candidate = payload.get("candidate").cloned().unwrap_or(Value::Null);
    let target = resolve_target(state, to).unwrap_or_else(|| to.to_string());
    let _ = state.io.to(target).emit(
        "ice_candidate",
        &json!({ "candidate": candidate, "from": socket.id.to_string() }),
    );
}

async fn on_get_call_history(payload: Value, state: &Arc<AppState>, ack: AckSender) {
    // Without a room there is no history to show.
    let Some(room_id) = uuid_field(&payload, "roomId") else {
        ack.send(&ack_ok(json!({ "calls": [] }))).ok();
        return;
    };
    let limit = i64_field(&payload, "limit").unwrap_or(20).clamp(1, 100);
    let offset = i64_field(&payload, "offset").unwrap_or(0).max(0);

    let result = state
        .db
        .get()
        .map_err(|e| e.to_string())
        .and_then(|mut conn| {
            store::call_history(&mut conn, room_id, limit, offset).map_err(|e| e.to_string())
        });

    match result {
        Ok(calls) => {
            ack.send(&ack_ok(json!({ "calls": calls }))).ok();
        }
        Err(e) => {
            warn!(%room_id, error = %e, "failed to load call history");
            ack.send(&ack_err("Failed to load call history")).ok();
        }
    }
}

async fn on_get_recordings(payload: Value, state: &Arc<AppState>, ack: AckSender) {
    let Some(call_id) = uuid_field(&payload, "callId") else {
        ack.send(&ack_err("callId is required")).ok();
        return;
    };

    let result = state
        .db
        .get()
        .map_err(|e| e.to_string())
        .and_then(|mut conn| {
            store::recordings_for_call(&mut conn, call_id).map_err(|e| e.to_string())
        });

    match result {
        Ok(recordings) => {
            ack.send(&ack_ok(json!({ "recordings": recordings }))).ok();
        }
        Err(e) => {
            warn!(%call_id, error = %e, "failed to load recordings");
            ack.send(&ack_err("Failed to load recordings")).ok();
        }
    }
}
