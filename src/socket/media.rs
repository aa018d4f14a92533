//! Socket surface of the SFU: join/capabilities/transports/produce/consume
//! plus the recording trigger hooks. Every request acks; errors surface as
//! `{success: false, error}` and never as a dropped callback.

use std::sync::Arc;

use mediasoup::prelude::{DtlsParameters, MediaKind, RtpCapabilities, RtpParameters};
use serde_json::{json, Value};
use socketioxide::extract::{AckSender, Data, SocketRef};
use tracing::warn;

use crate::error::{ack_err, ack_ok};
use crate::sfu::{MediaRoom, TransportDirection};
use crate::AppState;

use super::str_field;

pub fn register_handlers(socket: &SocketRef, state: &Arc<AppState>) {
    socket.on("join_media_room", {
        let state = state.clone();
        move |socket: SocketRef, Data::<Value>(payload), ack: AckSender| {
            let state = state.clone();
            async move { on_join(socket, payload, &state, ack).await }
        }
    });

    socket.on("set_rtp_capabilities", {
        let state = state.clone();
        move |socket: SocketRef, Data::<Value>(payload), ack: AckSender| {
            let state = state.clone();
            async move { on_set_rtp_capabilities(socket, payload, &state, ack).await }
        }
    });

    socket.on("create_transport", {
        let state = state.clone();
        move |socket: SocketRef, Data::<Value>(payload), ack: AckSender| {
            let state = state.clone();
            async move { on_create_transport(socket, payload, &state, ack).await }
        }
    });

    socket.on("connect_transport", {
        let state = state.clone();
        move |socket: SocketRef, Data::<Value>(payload), ack: AckSender| {
            let state = state.clone();
            async move { on_connect_transport(socket, payload, &state, ack).await }
        }
    });

    socket.on("produce", {
        let state = state.clone();
        move |socket: SocketRef, Data::<Value>(payload), ack: AckSender| {
            let state = state.clone();
            async move { on_produce(socket, payload, &state, ack).await }
        }
    });

    socket.on("consume", {
        let state = state.clone();
        move |socket: SocketRef, Data::<Value>(payload), ack: AckSender| {
            let state = state.clone();
            async move { on_consume(socket, payload, &state, ack).await }
        }
    });

    socket.on("resume_consumer", {
        let state = state.clone();
        move |socket: SocketRef, Data::<Value>(payload), ack: AckSender| {
            let state = state.clone();
            async move { on_resume_consumer(socket, payload, &state, ack).await }
        }
    });

    socket.on("get_producers", {
        let state = state.clone();
        move |socket: SocketRef, Data::<Value>(payload), ack: AckSender| {
            let state = state.clone();
            async move { on_get_producers(socket, payload, &state, ack).await }
        }
    });

    socket.on("leave_media_room", {
        let state = state.clone();
        move |socket: SocketRef, Data::<Value>(payload)| {
            let state = state.clone();
            async move { on_leave(socket, payload, &state).await }
        }
    });
}

/// Emit an event to every peer of a media room except `exclude`.
fn broadcast_to_media_room(
    state: &Arc<AppState>,
    room: &MediaRoom,
    exclude: &str,
    event: &str,
    payload: &Value,
) {
    for entry in room.peers.iter() {
        if entry.key() != exclude {
            let _ = state.io.to(entry.key().clone()).emit(event, payload);
        }
    }
}

pub(crate) fn broadcast_peer_left(state: &Arc<AppState>, room: &MediaRoom, session_id: &str) {
    broadcast_to_media_room(
        state,
        room,
        session_id,
        "peer_left",
        &json!({ "peerId": session_id, "roomId": room.room_id }),
    );
}

// ─── Handlers ───────────────────────────────────────────────────────────────

async fn on_join(socket: SocketRef, payload: Value, state: &Arc<AppState>, ack: AckSender) {
    let session_id = socket.id.to_string();
    let Some(entry) = state.registry.user_of(&session_id) else {
        ack.send(&ack_err("Not registered")).ok();
        return;
    };
    let Some(room_id) = str_field(&payload, "roomId") else {
        ack.send(&ack_err("roomId is required")).ok();
        return;
    };

    match state.sfu.join(room_id, &session_id, &entry.username).await {
        Ok(capabilities) => {
            ack.send(&ack_ok(json!({ "routerRtpCapabilities": capabilities }))).ok();
        }
        Err(e) => {
            warn!(room_id, sid = %session_id, error = %e, "join_media_room failed");
            ack.send(&ack_err(e.to_string())).ok();
        }
    }
}

async fn on_set_rtp_capabilities(
    socket: SocketRef,
    payload: Value,
    state: &Arc<AppState>,
    ack: AckSender,
) {
    let session_id = socket.id.to_string();
    let Some(room_id) = str_field(&payload, "roomId") else {
        ack.send(&ack_err("roomId is required")).ok();
        return;
    };
    let capabilities: RtpCapabilities = match payload
        .get("rtpCapabilities")
        .cloned()
        .map(serde_json::from_value)
    {
        Some(Ok(capabilities)) => capabilities,
        _ => {
            ack.send(&ack_err("Invalid rtpCapabilities")).ok();
            return;
        }
    };

    match state.sfu.set_rtp_capabilities(room_id, &session_id, capabilities) {
        Ok(()) => {
            ack.send(&ack_ok(json!({}))).ok();
        }
        Err(e) => {
            ack.send(&ack_err(e.to_string())).ok();
        }
    }
}

async fn on_create_transport(
    socket: SocketRef,
    payload: Value,
    state: &Arc<AppState>,
    ack: AckSender,
) {
    let session_id = socket.id.to_string();
    let Some(room_id) = str_field(&payload, "roomId") else {
        ack.send(&ack_err("roomId is required")).ok();
        return;
    };
    let direction: TransportDirection = match str_field(&payload, "direction")
        .unwrap_or("send")
        .parse()
    {
        Ok(direction) => direction,
        Err(_) => {
            ack.send(&ack_err("direction must be 'send' or 'recv'")).ok();
            return;
        }
    };

    match state.sfu.create_transport(room_id, &session_id, direction).await {
        Ok(options) => {
            ack.send(&ack_ok(json!({
                "id": options.id,
                "iceParameters": options.ice_parameters,
                "iceCandidates": options.ice_candidates,
                "dtlsParameters": options.dtls_parameters,
            })))
            .ok();
        }
        Err(e) => {
            warn!(room_id, sid = %session_id, error = %e, "create_transport failed");
            ack.send(&ack_err(e.to_string())).ok();
        }
    }
}

async fn on_connect_transport(
    socket: SocketRef,
    payload: Value,
    state: &Arc<AppState>,
    ack: AckSender,
) {
    let session_id = socket.id.to_string();
    let (Some(room_id), Some(transport_id)) = (
        str_field(&payload, "roomId"),
        str_field(&payload, "transportId"),
    ) else {
        ack.send(&ack_err("roomId and transportId are required")).ok();
        return;
    };
    let dtls_parameters: DtlsParameters = match payload
        .get("dtlsParameters")
        .cloned()
        .map(serde_json::from_value)
    {
        Some(Ok(parameters)) => parameters,
        _ => {
            ack.send(&ack_err("Invalid dtlsParameters")).ok();
            return;
        }
    };

    match state
        .sfu
        .connect_transport(room_id, transport_id, dtls_parameters)
        .await
    {
        Ok(()) => {
            ack.send(&ack_ok(json!({}))).ok();
        }
        Err(e) => {
            warn!(room_id, sid = %session_id, error = %e, "connect_transport failed");
            ack.send(&ack_err(e.to_string())).ok();
        }
    }
}

async fn on_produce(socket: SocketRef, payload: Value, state: &Arc<AppState>, ack: AckSender) {
    let session_id = socket.id.to_string();
    let Some(room_id) = str_field(&payload, "roomId") else {
        ack.send(&ack_err("roomId is required")).ok();
        return;
    };
    let kind = match str_field(&payload, "kind") {
        Some("audio") => MediaKind::Audio,
        Some("video") => MediaKind::Video,
        _ => {
            ack.send(&ack_err("kind must be 'audio' or 'video'")).ok();
            return;
        }
    };
    let rtp_parameters: RtpParameters = match payload
        .get("rtpParameters")
        .cloned()
        .map(serde_json::from_value)
    {
        Some(Ok(parameters)) => parameters,
        _ => {
            ack.send(&ack_err("Invalid rtpParameters")).ok();
            return;
        }
    };

    let info = match state.sfu.produce(room_id, &session_id, kind, rtp_parameters).await {
        Ok(info) => info,
        Err(e) => {
            warn!(room_id, sid = %session_id, error = %e, "produce failed");
            ack.send(&ack_err(e.to_string())).ok();
            return;
        }
    };

    // Ack with the id first: the producer is already consumable, and the
    // broadcast below must never beat the ack to the producing client.
    ack.send(&ack_ok(json!({ "id": info.producer_id }))).ok();

    if let Ok(room) = state.sfu.room(room_id) {
        broadcast_to_media_room(
            state,
            &room,
            &session_id,
            "new_producer",
            &json!({
                "producerId": info.producer_id,
                "peerId": info.peer_id,
                "kind": info.kind,
                "username": info.username,
            }),
        );
        // Every producer creation re-evaluates the auto-record policy.
        state.recording.maybe_start(&room).await;
    }
}

async fn on_consume(socket: SocketRef, payload: Value, state: &Arc<AppState>, ack: AckSender) {
    let session_id = socket.id.to_string();
    let (Some(room_id), Some(producer_id)) = (
        str_field(&payload, "roomId"),
        str_field(&payload, "producerId"),
    ) else {
        ack.send(&ack_err("roomId and producerId are required")).ok();
        return;
    };

    match state.sfu.consume(room_id, &session_id, producer_id).await {
        Ok(info) => {
            ack.send(&ack_ok(json!({
                "id": info.id,
                "producerId": info.producer_id,
                "kind": info.kind,
                "rtpParameters": info.rtp_parameters,
            })))
            .ok();
        }
        Err(e) => {
            warn!(room_id, sid = %session_id, error = %e, "consume failed");
            ack.send(&ack_err(e.to_string())).ok();
        }
    }
}

async fn on_resume_consumer(
    socket: SocketRef,
    payload: Value,
    state: &Arc<AppState>,
    ack: AckSender,
) {
    let session_id = socket.id.to_string();
    let (Some(room_id), Some(consumer_id)) = (
        str_field(&payload, "roomId"),
        str_field(&payload, "consumerId"),
    ) else {
        ack.send(&ack_err("roomId and consumerId are required")).ok();
        return;
    };

    match state.sfu.resume_consumer(room_id, &session_id, consumer_id).await {
        Ok(()) => {
            ack.send(&ack_ok(json!({}))).ok();
        }
        Err(e) => {
            ack.send(&ack_err(e.to_string())).ok();
        }
    }
}

async fn on_get_producers(
    socket: SocketRef,
    payload: Value,
    state: &Arc<AppState>,
    ack: AckSender,
) {
    let session_id = socket.id.to_string();
    let Some(room_id) = str_field(&payload, "roomId") else {
        ack.send(&ack_err("roomId is required")).ok();
        return;
    };

    let producers = state.sfu.get_producers(room_id, &session_id);
    ack.send(&ack_ok(json!({ "producers": producers }))).ok();
}

async fn on_leave(socket: SocketRef, payload: Value, state: &Arc<AppState>) {
    let session_id = socket.id.to_string();
    let Some(room_id) = str_field(&payload, "roomId") else {
        return;
    };

    if let Some(room) = state.sfu.remove_peer(room_id, &session_id) {
        broadcast_peer_left(state, &room, &session_id);
        state.recording.maybe_stop(&room).await;
        state.sfu.remove_room_if_empty(room_id);
    }
}
