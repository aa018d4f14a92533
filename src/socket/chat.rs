//! Chat surface: presence registration, typing indicators, message send,
//! delivery receipts and room management.
//!
//! Fan-out resolves the room's active participants and emits to every live
//! session of each, exactly once. When the participant lookup fails the
//! fan-out degrades to a full broadcast (minus the originator) — chat
//! availability wins over privacy there, and the degradation is logged.

use std::sync::Arc;

use serde_json::{json, Value};
use socketioxide::extract::{AckSender, Data, SocketRef};
use tracing::warn;
use uuid::Uuid;

use crate::error::{ack_err, ack_ok};
use crate::models::Message;
use crate::registry::SessionEntry;
use crate::store;
use crate::AppState;

use super::{i64_field, str_field, uuid_field};

pub fn register_handlers(socket: &SocketRef, state: &Arc<AppState>) {
    socket.on("register_user", {
        let state = state.clone();
        move |socket: SocketRef, Data::<Value>(payload)| {
            let state = state.clone();
            async move { on_register_user(socket, payload, &state).await }
        }
    });

    socket.on("get_online_users", {
        let state = state.clone();
        move |socket: SocketRef| {
            let state = state.clone();
            async move {
                let _ = socket.emit("users_online", &state.registry.online_users());
            }
        }
    });

    socket.on("typing_start", {
        let state = state.clone();
        move |socket: SocketRef, Data::<Value>(payload)| {
            let state = state.clone();
            async move { on_typing(socket, payload, &state, "user_typing").await }
        }
    });

    socket.on("typing_stop", {
        let state = state.clone();
        move |socket: SocketRef, Data::<Value>(payload)| {
            let state = state.clone();
            async move { on_typing(socket, payload, &state, "user_stopped_typing").await }
        }
    });

    socket.on("send_group_message", {
        let state = state.clone();
        move |socket: SocketRef, Data::<Value>(payload)| {
            let state = state.clone();
            async move { on_send_message(socket, payload, &state, "receive_group_message").await }
        }
    });

    socket.on("send_private_message", {
        let state = state.clone();
        move |socket: SocketRef, Data::<Value>(payload)| {
            let state = state.clone();
            async move { on_send_message(socket, payload, &state, "receive_private_message").await }
        }
    });

    socket.on("edit_message", {
        let state = state.clone();
        move |socket: SocketRef, Data::<Value>(payload)| {
            let state = state.clone();
            async move { on_edit_message(socket, payload, &state).await }
        }
    });

    socket.on("get_messages", {
        let state = state.clone();
        move |_socket: SocketRef, Data::<Value>(payload), ack: AckSender| {
            let state = state.clone();
            async move { on_get_messages(payload, &state, ack).await }
        }
    });

    socket.on("message_delivered", {
        let state = state.clone();
        move |socket: SocketRef, Data::<Value>(payload)| {
            let state = state.clone();
            async move { on_message_delivered(socket, payload, &state).await }
        }
    });

    socket.on("mark_read", {
        let state = state.clone();
        move |socket: SocketRef, Data::<Value>(payload)| {
            let state = state.clone();
            async move { on_mark_read(socket, payload, &state).await }
        }
    });

    socket.on("get_rooms", {
        let state = state.clone();
        move |_socket: SocketRef, Data::<Value>(payload), ack: AckSender| {
            let state = state.clone();
            async move { on_get_rooms(payload, &state, ack).await }
        }
    });

    socket.on("start_private_chat", {
        let state = state.clone();
        move |_socket: SocketRef, Data::<Value>(payload), ack: AckSender| {
            let state = state.clone();
            async move { on_start_private_chat(payload, &state, ack).await }
        }
    });

    socket.on("create_group", {
        let state = state.clone();
        move |_socket: SocketRef, Data::<Value>(payload), ack: AckSender| {
            let state = state.clone();
            async move { on_create_group(payload, &state, ack).await }
        }
    });
}

// ─── Fan-out ────────────────────────────────────────────────────────────────

/// Emit `event` to every live session of every active participant of the
/// room, exactly once per session, skipping `exclude`. Falls back to a full
/// broadcast when the participant lookup fails.
pub(crate) async fn emit_to_room(
    state: &Arc<AppState>,
    socket: Option<&SocketRef>,
    room_id: Uuid,
    event: &str,
    payload: &Value,
    exclude: Option<&str>,
) {
    let participants = state
        .db
        .get()
        .map_err(|e| e.to_string())
        .and_then(|mut conn| {
            store::active_participants(&mut conn, room_id).map_err(|e| e.to_string())
        });

    match participants {
        Ok(user_ids) => {
            let mut delivered: Vec<String> = Vec::new();
            for user_id in user_ids {
                for session_id in state.registry.sessions_of(user_id) {
                    if exclude == Some(session_id.as_str()) || delivered.contains(&session_id) {
                        continue;
                    }
                    let _ = state.io.to(session_id.clone()).emit(event, payload);
                    delivered.push(session_id);
                }
            }
        }
        Err(e) => {
            warn!(%room_id, event, error = %e, "participant lookup failed, degrading to broadcast");
            match (socket, exclude) {
                (Some(socket), Some(_)) => {
                    let _ = socket.broadcast().emit(event, payload);
                }
                _ => {
                    let _ = state.io.emit(event, payload);
                }
            }
        }
    }
}

pub(crate) fn message_payload(message: &Message, sender_username: &str, delivery: &str) -> Value {
    json!({
        "messageId": message.id,
        "roomId": message.room_id,
        "senderId": message.sender_id,
        "senderUsername": sender_username,
        "content": message.content,
        "messageType": message.message_type,
        "fileUrl": message.file_url,
        "createdAt": message.created_at,
        "editedAt": message.edited_at,
        "deliveryStatus": delivery,
    })
}

/// Persist a message, seed `sent` statuses for every other participant and
/// fan it out. A persistence failure is logged but does not block the
/// real-time path.
pub(crate) async fn deliver_message(
    state: &Arc<AppState>,
    socket: Option<&SocketRef>,
    sender_id: Uuid,
    sender_username: &str,
    room_id: Uuid,
    content: Option<String>,
    message_type: &str,
    file_url: Option<String>,
    event: &str,
) -> Option<Value> {
    let persisted = state.db.get().ok().and_then(|mut conn| {
        let message = store::insert_message(
            &mut conn,
            crate::models::NewMessage {
                room_id,
                sender_id,
                content: content.clone(),
                message_type: message_type.to_string(),
                file_url: file_url.clone(),
            },
        )
        .map_err(|e| warn!(%room_id, error = %e, "failed to persist message"))
        .ok()?;

        let recipients: Vec<Uuid> = store::active_participants(&mut conn, room_id)
            .unwrap_or_default()
            .into_iter()
            .filter(|&id| id != sender_id)
            .collect();
        if let Err(e) = store::seed_sent_statuses(&mut conn, message.id, &recipients) {
            warn!(message_id = %message.id, error = %e, "failed to seed message statuses");
        }
        Some(message)
    });

    let payload = match &persisted {
        Some(message) => message_payload(message, sender_username, store::STATUS_SENT),
        // Degraded: recipients still get the content in real time, without
        // a durable id to acknowledge against.
        None => json!({
            "messageId": Value::Null,
            "roomId": room_id,
            "senderId": sender_id,
            "senderUsername": sender_username,
            "content": content,
            "messageType": message_type,
            "fileUrl": file_url,
            "createdAt": chrono::Utc::now(),
            "deliveryStatus": store::STATUS_SENT,
        }),
    };

    emit_to_room(state, socket, room_id, event, &payload, None).await;
    persisted.map(|message| message_payload(&message, sender_username, store::STATUS_SENT))
}

fn authenticated(socket: &SocketRef, state: &Arc<AppState>) -> Option<SessionEntry> {
    state.registry.user_of(&socket.id.to_string())
}

// ─── Handlers ───────────────────────────────────────────────────────────────

async fn on_register_user(socket: SocketRef, payload: Value, state: &Arc<AppState>) {
    let Some(user_id) = uuid_field(&payload, "userId") else {
        warn!("register_user without a valid userId");
        return;
    };
    let username = str_field(&payload, "username").unwrap_or_default().to_string();
    let session_id = socket.id.to_string();

    state.registry.register(&session_id, user_id, &username);

    // The online flag is durable before anyone hears about it.
    match state.db.get() {
        Ok(mut conn) => {
            if let Err(e) = store::set_online(&mut conn, user_id, true) {
                warn!(%user_id, error = %e, "failed to mark user online");
            }
        }
        Err(e) => warn!(error = %e, "no database connection for presence update"),
    }

    let _ = state.io.emit(
        "user_status_changed",
        &json!({
            "userId": user_id,
            "username": username,
            "isOnline": true,
            "lastSeen": chrono::Utc::now(),
        }),
    );
    let _ = state.io.emit("users_online", &state.registry.online_users());
}

async fn on_typing(socket: SocketRef, payload: Value, state: &Arc<AppState>, event: &str) {
    let Some(entry) = authenticated(&socket, state) else {
        return;
    };
    let Some(room_id) = uuid_field(&payload, "roomId") else {
        return;
    };
    let session_id = socket.id.to_string();
    let body = json!({
        "roomId": room_id,
        "userId": entry.user_id,
        "username": entry.username,
    });
    emit_to_room(state, Some(&socket), room_id, event, &body, Some(&session_id)).await;
}

async fn on_send_message(socket: SocketRef, payload: Value, state: &Arc<AppState>, event: &str) {
    let Some(entry) = authenticated(&socket, state) else {
        warn!(sid = %socket.id, "message from unregistered session dropped");
        return;
    };
    let Some(room_id) = uuid_field(&payload, "roomId") else {
        warn!("message without a valid roomId dropped");
        return;
    };

    let content = str_field(&payload, "text")
        .or_else(|| str_field(&payload, "content"))
        .map(str::to_string);
    let message_type = str_field(&payload, "messageType").unwrap_or("text");
    let file_url = str_field(&payload, "fileUrl").map(str::to_string);

    deliver_message(
        state,
        Some(&socket),
        entry.user_id,
        &entry.username,
        room_id,
        content,
        message_type,
        file_url,
        event,
    )
    .await;
}

async fn on_edit_message(socket: SocketRef, payload: Value, state: &Arc<AppState>) {
    let Some(entry) = authenticated(&socket, state) else {
        return;
    };
    let (Some(message_id), Some(content)) =
        (uuid_field(&payload, "messageId"), str_field(&payload, "content"))
    else {
        return;
    };

    let edited = state.db.get().ok().and_then(|mut conn| {
        store::edit_message(&mut conn, message_id, entry.user_id, content)
            .map_err(|e| warn!(%message_id, error = %e, "failed to edit message"))
            .ok()
    });

    if let Some(message) = edited {
        let body = json!({
            "messageId": message.id,
            "roomId": message.room_id,
            "content": message.content,
            "editedAt": message.edited_at,
        });
        emit_to_room(state, Some(&socket), message.room_id, "message_edited", &body, None).await;
    }
}

async fn on_get_messages(payload: Value, state: &Arc<AppState>, ack: AckSender) {
    let Some(room_id) = uuid_field(&payload, "roomId") else {
        ack.send(&ack_err("roomId is required")).ok();
        return;
    };
    let before = str_field(&payload, "before")
        .and_then(|s| s.parse::<chrono::DateTime<chrono::Utc>>().ok());
    let limit = i64_field(&payload, "limit").unwrap_or(50).clamp(1, 200);

    let result = state
        .db
        .get()
        .map_err(|e| e.to_string())
        .and_then(|mut conn| {
            store::messages_for_room(&mut conn, room_id, before, limit).map_err(|e| e.to_string())
        });

    match result {
        Ok(messages) => {
            ack.send(&ack_ok(json!({ "messages": messages }))).ok();
        }
        Err(e) => {
            warn!(%room_id, error = %e, "failed to load messages");
            ack.send(&ack_err("Failed to load messages")).ok();
        }
    }
}

async fn on_message_delivered(socket: SocketRef, payload: Value, state: &Arc<AppState>) {
    let Some(entry) = authenticated(&socket, state) else {
        return;
    };
    let Some(message_id) = uuid_field(&payload, "messageId") else {
        return;
    };

    let message = {
        let Ok(mut conn) = state.db.get() else {
            warn!("no database connection for delivery receipt");
            return;
        };
        if let Err(e) = store::mark_delivered(&mut conn, message_id, entry.user_id) {
            warn!(%message_id, error = %e, "failed to record delivery");
            return;
        }
        match store::find_message(&mut conn, message_id) {
            Ok(message) => message,
            Err(e) => {
                warn!(%message_id, error = %e, "delivery receipt for unknown message");
                return;
            }
        }
    };

    // Only the originator cares about the transition.
    if let Some(sender_session) = state.registry.session_of(message.sender_id) {
        let _ = state.io.to(sender_session).emit(
            "message_status_update",
            &json!({
                "messageId": message_id,
                "userId": entry.user_id,
                "status": store::STATUS_DELIVERED,
                "roomId": message.room_id,
            }),
        );
    }
}

async fn on_mark_read(socket: SocketRef, payload: Value, state: &Arc<AppState>) {
    let Some(entry) = authenticated(&socket, state) else {
        return;
    };
    let Some(room_id) = uuid_field(&payload, "roomId") else {
        return;
    };

    let senders = {
        let Ok(mut conn) = state.db.get() else {
            warn!("no database connection for read receipt");
            return;
        };
        match store::mark_room_read(&mut conn, room_id, entry.user_id) {
            Ok(senders) => senders,
            Err(e) => {
                warn!(%room_id, error = %e, "failed to mark room read");
                return;
            }
        }
    };

    for sender in senders {
        if let Some(sender_session) = state.registry.session_of(sender) {
            let _ = state.io.to(sender_session).emit(
                "message_status_update",
                &json!({
                    "roomId": room_id,
                    "userId": entry.user_id,
                    "status": store::STATUS_READ,
                }),
            );
        }
    }
}

async fn on_get_rooms(payload: Value, state: &Arc<AppState>, ack: AckSender) {
    let Some(user_id) = uuid_field(&payload, "userId") else {
        ack.send(&ack_err("userId is required")).ok();
        return;
    };

    let result = state
        .db
        .get()
        .map_err(|e| e.to_string())
        .and_then(|mut conn| store::rooms_for_user(&mut conn, user_id).map_err(|e| e.to_string()));

    match result {
        Ok(rooms) => {
            ack.send(&ack_ok(json!({ "rooms": rooms }))).ok();
        }
        Err(e) => {
            warn!(%user_id, error = %e, "failed to load rooms");
            ack.send(&ack_err("Failed to load rooms")).ok();
        }
    }
}

async fn on_start_private_chat(payload: Value, state: &Arc<AppState>, ack: AckSender) {
    let (Some(user_id), Some(target_id)) = (
        uuid_field(&payload, "userId"),
        uuid_field(&payload, "targetUserId"),
    ) else {
        ack.send(&ack_err("userId and targetUserId are required")).ok();
        return;
    };

    let result = state
        .db
        .get()
        .map_err(|e| e.to_string())
        .and_then(|mut conn| {
            let (room, created) =
                store::start_private_chat(&mut conn, user_id, target_id).map_err(|e| e.to_string())?;
            let other = store::find_user(&mut conn, target_id).map_err(|e| e.to_string())?;
            Ok((room, other, created))
        });

    match result {
        Ok((room, other, created)) => {
            ack.send(&ack_ok(json!({
                "room": room,
                "otherUser": other,
                "created": created,
            })))
            .ok();
        }
        Err(e) => {
            warn!(%user_id, %target_id, error = %e, "failed to start private chat");
            ack.send(&ack_err("Failed to start private chat")).ok();
        }
    }
}

async fn on_create_group(payload: Value, state: &Arc<AppState>, ack: AckSender) {
    let (Some(name), Some(created_by)) = (
        str_field(&payload, "name"),
        uuid_field(&payload, "createdBy"),
    ) else {
        ack.send(&ack_err("name and createdBy are required")).ok();
        return;
    };
    let member_ids: Vec<Uuid> = payload
        .get("memberIds")
        .and_then(|v| v.as_array())
        .map(|ids| {
            ids.iter()
                .filter_map(|v| v.as_str())
                .filter_map(|s| s.parse().ok())
                .collect()
        })
        .unwrap_or_default();

    let result = state
        .db
        .get()
        .map_err(|e| e.to_string())
        .and_then(|mut conn| {
            store::create_group(&mut conn, name, &member_ids, created_by).map_err(|e| e.to_string())
        });

    match result {
        Ok(room) => {
            ack.send(&ack_ok(json!({ "room": room }))).ok();
        }
        Err(e) => {
            warn!(error = %e, "failed to create group");
            ack.send(&ack_err("Failed to create group")).ok();
        }
    }
}
