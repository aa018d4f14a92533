use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use uuid::Uuid;

use crate::schema::{
    call_participants, calls, message_status, messages, recordings, room_participants, rooms,
    users,
};

// --- User ---

#[derive(Debug, Queryable, Identifiable, Serialize, Clone)]
#[diesel(table_name = users)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub status: String,
    pub role: String,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub status: String,
    pub role: String,
}

// --- Room ---

#[derive(Debug, Queryable, Identifiable, Serialize, Clone)]
#[diesel(table_name = rooms)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: Uuid,
    pub room_type: String,
    pub name: Option<String>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = rooms)]
pub struct NewRoom {
    pub room_type: String,
    pub name: Option<String>,
    pub created_by: Option<Uuid>,
}

// --- RoomParticipant ---

#[derive(Debug, Queryable, Identifiable, Serialize, Clone)]
#[diesel(table_name = room_participants)]
#[serde(rename_all = "camelCase")]
pub struct RoomParticipant {
    pub id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub role: String,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = room_participants)]
pub struct NewRoomParticipant {
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub role: String,
}

// --- Message ---

#[derive(Debug, Queryable, Identifiable, Serialize, Clone)]
#[diesel(table_name = messages)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub room_id: Uuid,
    pub sender_id: Uuid,
    pub content: Option<String>,
    pub message_type: String,
    pub file_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = messages)]
pub struct NewMessage {
    pub room_id: Uuid,
    pub sender_id: Uuid,
    pub content: Option<String>,
    pub message_type: String,
    pub file_url: Option<String>,
}

// --- MessageStatus ---

#[derive(Debug, Queryable, Identifiable, Serialize, Clone)]
#[diesel(table_name = message_status)]
#[serde(rename_all = "camelCase")]
pub struct MessageStatus {
    pub id: Uuid,
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = message_status)]
pub struct NewMessageStatus {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub status: String,
}

// --- Call ---

#[derive(Debug, Queryable, Identifiable, Serialize, Clone)]
#[diesel(table_name = calls)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    pub id: Uuid,
    pub room_id: Uuid,
    pub initiator_id: Uuid,
    pub call_type: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = calls)]
pub struct NewCall {
    pub room_id: Uuid,
    pub initiator_id: Uuid,
    pub call_type: String,
    pub status: String,
}

// --- CallParticipant ---

#[derive(Debug, Queryable, Identifiable, Serialize, Clone)]
#[diesel(table_name = call_participants)]
#[serde(rename_all = "camelCase")]
pub struct CallParticipant {
    pub id: Uuid,
    pub call_id: Uuid,
    pub user_id: Uuid,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub answered: bool,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = call_participants)]
pub struct NewCallParticipant {
    pub call_id: Uuid,
    pub user_id: Uuid,
    pub answered: bool,
}

// --- Recording ---

#[derive(Debug, Queryable, Identifiable, Serialize, Clone)]
#[diesel(table_name = recordings)]
#[serde(rename_all = "camelCase")]
pub struct Recording {
    pub id: String,
    pub call_id: Option<Uuid>,
    pub room_id: Uuid,
    pub file_path: String,
    pub has_video: bool,
    pub duration_secs: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = recordings)]
pub struct NewRecording {
    pub id: String,
    pub call_id: Option<Uuid>,
    pub room_id: Uuid,
    pub file_path: String,
    pub has_video: bool,
    pub duration_secs: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}
