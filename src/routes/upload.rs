use std::path::Path as FsPath;
use std::sync::Arc;

use axum::extract::{Multipart, State};
use axum::Json;
use rand::Rng;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::ApiError;
use crate::socket::chat;
use crate::store;
use crate::AppState;

/// POST /api/upload — multipart chat attachment.
///
/// Stores the file under `uploads/<epoch-rand>.<ext>` and emits the
/// corresponding chat message through the normal fan-out, with the original
/// filename as content and the public `/uploads/...` path as file URL.
pub async fn upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut original_name = String::new();
    let mut room_id: Option<Uuid> = None;
    let mut sender_id: Option<Uuid> = None;
    let mut sender_username: Option<String> = None;
    let mut message_type: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("invalid multipart payload: {e}")))?
    {
        match field.name().unwrap_or_default() {
            "file" => {
                original_name = field.file_name().unwrap_or("upload").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("failed to read file: {e}")))?;
                file_bytes = Some(bytes.to_vec());
            }
            "roomId" => {
                room_id = field.text().await.ok().and_then(|s| s.parse().ok());
            }
            "senderId" => {
                sender_id = field.text().await.ok().and_then(|s| s.parse().ok());
            }
            "senderUsername" => {
                sender_username = field.text().await.ok();
            }
            "messageType" => {
                message_type = field.text().await.ok();
            }
            other => {
                tracing::debug!(field = other, "ignoring unknown upload field");
            }
        }
    }

    let file_bytes = file_bytes.ok_or_else(|| ApiError::bad_request("file field is required"))?;
    let room_id = room_id.ok_or_else(|| ApiError::bad_request("roomId field is required"))?;
    let sender_id = sender_id.ok_or_else(|| ApiError::bad_request("senderId field is required"))?;

    let extension = FsPath::new(&original_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("bin")
        .to_ascii_lowercase();
    let message_type = message_type.unwrap_or_else(|| {
        match extension.as_str() {
            "png" | "jpg" | "jpeg" | "gif" | "webp" => "image",
            _ => "file",
        }
        .to_string()
    });

    let stored_name = format!(
        "{}-{}.{extension}",
        chrono::Utc::now().timestamp_millis(),
        rand::thread_rng().gen_range(100_000_000..1_000_000_000u64)
    );
    tokio::fs::create_dir_all(&state.config.uploads_dir)
        .await
        .map_err(|e| ApiError::internal(format!("failed to create uploads dir: {e}")))?;
    let disk_path = FsPath::new(&state.config.uploads_dir).join(&stored_name);
    tokio::fs::write(&disk_path, &file_bytes)
        .await
        .map_err(|e| ApiError::internal(format!("failed to store upload: {e}")))?;

    let file_url = format!("/uploads/{stored_name}");
    tracing::info!(%room_id, %sender_id, url = %file_url, size = file_bytes.len(), "upload stored");

    let sender_username = match sender_username {
        Some(name) if !name.is_empty() => name,
        _ => state
            .db
            .get()
            .ok()
            .and_then(|mut conn| store::find_user(&mut conn, sender_id).ok())
            .map(|user| user.username)
            .unwrap_or_default(),
    };

    // Private rooms fan out on the private event, everything else on the
    // group event; the delivery path is otherwise identical to a text send.
    let event = state
        .db
        .get()
        .ok()
        .and_then(|mut conn| store::find_room(&mut conn, room_id).ok())
        .map(|room| {
            if room.room_type == "private" {
                "receive_private_message"
            } else {
                "receive_group_message"
            }
        })
        .unwrap_or("receive_group_message");

    let message = chat::deliver_message(
        &state,
        None,
        sender_id,
        &sender_username,
        room_id,
        Some(original_name),
        &message_type,
        Some(file_url.clone()),
        event,
    )
    .await;

    Ok(Json(json!({
        "success": true,
        "url": file_url,
        "message": message,
    })))
}
