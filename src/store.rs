//! Typed query surface over Postgres.
//!
//! Every durable read/write in the system goes through a function here, so
//! handlers never assemble SQL inline and the delivery-status state machine
//! has a single enforcement point.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use serde::Serialize;
use uuid::Uuid;

use crate::models::*;
use crate::schema::*;

pub type DbPool = diesel::r2d2::Pool<diesel::r2d2::ConnectionManager<PgConnection>>;

pub const STATUS_SENT: &str = "sent";
pub const STATUS_DELIVERED: &str = "delivered";
pub const STATUS_READ: &str = "read";

/// Ordering of the per-recipient delivery state machine.
/// Unknown strings rank lowest so they can never mask a real status.
pub fn status_rank(status: &str) -> u8 {
    match status {
        STATUS_READ => 2,
        STATUS_DELIVERED => 1,
        _ => 0,
    }
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

pub fn create_user(
    conn: &mut PgConnection,
    username: &str,
    email: &str,
    password_hash: &str,
) -> QueryResult<User> {
    diesel::insert_into(users::table)
        .values(&NewUser {
            username: username.to_string(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            status: "pending".to_string(),
            role: "user".to_string(),
        })
        .get_result(conn)
}

pub fn find_user(conn: &mut PgConnection, id: Uuid) -> QueryResult<User> {
    users::table.find(id).first(conn)
}

pub fn find_user_by_username(conn: &mut PgConnection, username: &str) -> QueryResult<Option<User>> {
    users::table
        .filter(users::username.eq(username))
        .first(conn)
        .optional()
}

pub fn username_or_email_exists(
    conn: &mut PgConnection,
    username: &str,
    email: &str,
) -> QueryResult<bool> {
    let count: i64 = users::table
        .filter(users::username.eq(username).or(users::email.eq(email)))
        .count()
        .get_result(conn)?;
    Ok(count > 0)
}

pub fn set_online(conn: &mut PgConnection, user_id: Uuid, online: bool) -> QueryResult<()> {
    diesel::update(users::table.find(user_id))
        .set((users::is_online.eq(online), users::last_seen.eq(Utc::now())))
        .execute(conn)?;
    Ok(())
}

pub fn list_users(conn: &mut PgConnection, limit: i64, offset: i64) -> QueryResult<Vec<User>> {
    users::table
        .order(users::created_at.desc())
        .limit(limit)
        .offset(offset)
        .load(conn)
}

pub fn list_pending_users(conn: &mut PgConnection) -> QueryResult<Vec<User>> {
    users::table
        .filter(users::status.eq("pending"))
        .order(users::created_at.asc())
        .load(conn)
}

pub fn set_user_status(conn: &mut PgConnection, user_id: Uuid, status: &str) -> QueryResult<User> {
    diesel::update(users::table.find(user_id))
        .set(users::status.eq(status))
        .get_result(conn)
}

// ---------------------------------------------------------------------------
// Rooms
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub user_id: Uuid,
    pub username: String,
    pub role: String,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RoomWithParticipants {
    #[serde(flatten)]
    pub room: Room,
    pub participants: Vec<ParticipantInfo>,
}

pub fn find_room(conn: &mut PgConnection, room_id: Uuid) -> QueryResult<Room> {
    rooms::table.find(room_id).first(conn)
}

/// Room ids (type `private`) where the user is an active participant.
fn private_room_ids(conn: &mut PgConnection, user_id: Uuid) -> QueryResult<Vec<Uuid>> {
    room_participants::table
        .inner_join(rooms::table)
        .filter(rooms::room_type.eq("private"))
        .filter(room_participants::user_id.eq(user_id))
        .filter(room_participants::left_at.is_null())
        .select(room_participants::room_id)
        .load(conn)
}

pub fn find_private_room(
    conn: &mut PgConnection,
    a: Uuid,
    b: Uuid,
) -> QueryResult<Option<Room>> {
    let a_rooms = private_room_ids(conn, a)?;
    let b_rooms = private_room_ids(conn, b)?;
    let shared = a_rooms.into_iter().find(|id| b_rooms.contains(id));
    match shared {
        Some(id) => rooms::table.find(id).first(conn).optional(),
        None => Ok(None),
    }
}

/// Find-or-create the unique private room for an unordered user pair.
/// Returns `(room, created)`.
pub fn start_private_chat(
    conn: &mut PgConnection,
    a: Uuid,
    b: Uuid,
) -> QueryResult<(Room, bool)> {
    if let Some(room) = find_private_room(conn, a, b)? {
        return Ok((room, false));
    }

    let room: Room = diesel::insert_into(rooms::table)
        .values(&NewRoom {
            room_type: "private".to_string(),
            name: None,
            created_by: Some(a),
        })
        .get_result(conn)?;

    let members: Vec<NewRoomParticipant> = [a, b]
        .iter()
        .map(|&user_id| NewRoomParticipant {
            room_id: room.id,
            user_id,
            role: "member".to_string(),
        })
        .collect();
    diesel::insert_into(room_participants::table)
        .values(&members)
        .execute(conn)?;

    Ok((room, true))
}

pub fn create_group(
    conn: &mut PgConnection,
    name: &str,
    member_ids: &[Uuid],
    created_by: Uuid,
) -> QueryResult<Room> {
    let room: Room = diesel::insert_into(rooms::table)
        .values(&NewRoom {
            room_type: "group".to_string(),
            name: Some(name.to_string()),
            created_by: Some(created_by),
        })
        .get_result(conn)?;

    let mut members: Vec<NewRoomParticipant> = vec![NewRoomParticipant {
        room_id: room.id,
        user_id: created_by,
        role: "admin".to_string(),
    }];
    for &user_id in member_ids.iter().filter(|&&id| id != created_by) {
        members.push(NewRoomParticipant {
            room_id: room.id,
            user_id,
            role: "member".to_string(),
        });
    }
    diesel::insert_into(room_participants::table)
        .values(&members)
        .execute(conn)?;

    Ok(room)
}

pub fn rooms_for_user(
    conn: &mut PgConnection,
    user_id: Uuid,
) -> QueryResult<Vec<RoomWithParticipants>> {
    let user_rooms: Vec<Room> = rooms::table
        .inner_join(room_participants::table)
        .filter(room_participants::user_id.eq(user_id))
        .filter(room_participants::left_at.is_null())
        .select(rooms::all_columns)
        .order(rooms::created_at.desc())
        .load(conn)?;

    let mut out = Vec::with_capacity(user_rooms.len());
    for room in user_rooms {
        let participants: Vec<(RoomParticipant, String)> = room_participants::table
            .inner_join(users::table)
            .filter(room_participants::room_id.eq(room.id))
            .filter(room_participants::left_at.is_null())
            .select((room_participants::all_columns, users::username))
            .load(conn)?;
        out.push(RoomWithParticipants {
            room,
            participants: participants
                .into_iter()
                .map(|(p, username)| ParticipantInfo {
                    user_id: p.user_id,
                    username,
                    role: p.role,
                    joined_at: p.joined_at,
                })
                .collect(),
        });
    }
    Ok(out)
}

/// User ids of active participants of a room.
pub fn active_participants(conn: &mut PgConnection, room_id: Uuid) -> QueryResult<Vec<Uuid>> {
    room_participants::table
        .filter(room_participants::room_id.eq(room_id))
        .filter(room_participants::left_at.is_null())
        .select(room_participants::user_id)
        .load(conn)
}

// ---------------------------------------------------------------------------
// Messages & delivery statuses
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MessageWithStatus {
    #[serde(flatten)]
    pub message: Message,
    pub sender_username: String,
    pub delivery_status: String,
}

pub fn insert_message(conn: &mut PgConnection, new: NewMessage) -> QueryResult<Message> {
    diesel::insert_into(messages::table).values(&new).get_result(conn)
}

pub fn find_message(conn: &mut PgConnection, id: Uuid) -> QueryResult<Message> {
    messages::table.find(id).first(conn)
}

pub fn edit_message(
    conn: &mut PgConnection,
    message_id: Uuid,
    sender_id: Uuid,
    content: &str,
) -> QueryResult<Message> {
    diesel::update(
        messages::table
            .filter(messages::id.eq(message_id))
            .filter(messages::sender_id.eq(sender_id)),
    )
    .set((messages::content.eq(content), messages::edited_at.eq(Utc::now())))
    .get_result(conn)
}

/// Seed a `sent` row for every recipient. Existing rows are left untouched.
pub fn seed_sent_statuses(
    conn: &mut PgConnection,
    message_id: Uuid,
    recipients: &[Uuid],
) -> QueryResult<()> {
    if recipients.is_empty() {
        return Ok(());
    }
    let rows: Vec<NewMessageStatus> = recipients
        .iter()
        .map(|&user_id| NewMessageStatus {
            message_id,
            user_id,
            status: STATUS_SENT.to_string(),
        })
        .collect();
    diesel::insert_into(message_status::table)
        .values(&rows)
        .on_conflict((message_status::message_id, message_status::user_id))
        .do_nothing()
        .execute(conn)?;
    Ok(())
}

/// Advance a recipient's status to `delivered`. Downgrades no-op: the UPDATE
/// only fires while the row still says `sent`.
pub fn mark_delivered(conn: &mut PgConnection, message_id: Uuid, user_id: Uuid) -> QueryResult<()> {
    diesel::insert_into(message_status::table)
        .values(&NewMessageStatus {
            message_id,
            user_id,
            status: STATUS_DELIVERED.to_string(),
        })
        .on_conflict((message_status::message_id, message_status::user_id))
        .do_nothing()
        .execute(conn)?;
    diesel::update(
        message_status::table
            .filter(message_status::message_id.eq(message_id))
            .filter(message_status::user_id.eq(user_id))
            .filter(message_status::status.eq(STATUS_SENT)),
    )
    .set((
        message_status::status.eq(STATUS_DELIVERED),
        message_status::updated_at.eq(Utc::now()),
    ))
    .execute(conn)?;
    Ok(())
}

/// Advance the reader's status to `read` for every message in the room not
/// authored by them. Returns the distinct senders appearing in the room's
/// recent history (the set to notify), reader excluded.
pub fn mark_room_read(
    conn: &mut PgConnection,
    room_id: Uuid,
    reader_id: Uuid,
) -> QueryResult<Vec<Uuid>> {
    let message_ids: Vec<Uuid> = messages::table
        .filter(messages::room_id.eq(room_id))
        .filter(messages::sender_id.ne(reader_id))
        .select(messages::id)
        .load(conn)?;

    if !message_ids.is_empty() {
        let rows: Vec<NewMessageStatus> = message_ids
            .iter()
            .map(|&message_id| NewMessageStatus {
                message_id,
                user_id: reader_id,
                status: STATUS_READ.to_string(),
            })
            .collect();
        diesel::insert_into(message_status::table)
            .values(&rows)
            .on_conflict((message_status::message_id, message_status::user_id))
            .do_nothing()
            .execute(conn)?;

        diesel::update(
            message_status::table
                .filter(message_status::message_id.eq_any(&message_ids))
                .filter(message_status::user_id.eq(reader_id))
                .filter(message_status::status.ne(STATUS_READ)),
        )
        .set((
            message_status::status.eq(STATUS_READ),
            message_status::updated_at.eq(Utc::now()),
        ))
        .execute(conn)?;
    }

    let recent_senders: Vec<Uuid> = messages::table
        .filter(messages::room_id.eq(room_id))
        .order(messages::created_at.desc())
        .limit(50)
        .select(messages::sender_id)
        .load(conn)?;

    let mut senders: Vec<Uuid> = Vec::new();
    for sender in recent_senders {
        if sender != reader_id && !senders.contains(&sender) {
            senders.push(sender);
        }
    }
    Ok(senders)
}

/// Aggregated delivery status per message: `min` across the per-recipient
/// rows under `sent < delivered < read`; `sent` when no rows exist.
pub fn delivery_status_for(
    conn: &mut PgConnection,
    message_ids: &[Uuid],
) -> QueryResult<HashMap<Uuid, String>> {
    if message_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let rows: Vec<(Uuid, String)> = message_status::table
        .filter(message_status::message_id.eq_any(message_ids))
        .select((message_status::message_id, message_status::status))
        .load(conn)?;

    let mut aggregated: HashMap<Uuid, String> = HashMap::new();
    for (message_id, status) in rows {
        aggregated
            .entry(message_id)
            .and_modify(|current| {
                if status_rank(&status) < status_rank(current) {
                    *current = status.clone();
                }
            })
            .or_insert(status);
    }
    Ok(aggregated)
}

pub fn messages_for_room(
    conn: &mut PgConnection,
    room_id: Uuid,
    before: Option<DateTime<Utc>>,
    limit: i64,
) -> QueryResult<Vec<MessageWithStatus>> {
    let mut query = messages::table
        .inner_join(users::table.on(users::id.eq(messages::sender_id)))
        .filter(messages::room_id.eq(room_id))
        .select((messages::all_columns, users::username))
        .into_boxed();
    if let Some(before) = before {
        query = query.filter(messages::created_at.lt(before));
    }
    let rows: Vec<(Message, String)> = query
        .order(messages::created_at.desc())
        .limit(limit)
        .load(conn)?;

    let ids: Vec<Uuid> = rows.iter().map(|(m, _)| m.id).collect();
    let statuses = delivery_status_for(conn, &ids)?;

    Ok(rows
        .into_iter()
        .map(|(message, sender_username)| {
            let delivery_status = statuses
                .get(&message.id)
                .cloned()
                .unwrap_or_else(|| STATUS_SENT.to_string());
            MessageWithStatus {
                message,
                sender_username,
                delivery_status,
            }
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

pub fn create_call(
    conn: &mut PgConnection,
    room_id: Uuid,
    initiator_id: Uuid,
    call_type: &str,
) -> QueryResult<Call> {
    let call: Call = diesel::insert_into(calls::table)
        .values(&NewCall {
            room_id,
            initiator_id,
            call_type: call_type.to_string(),
            status: "ringing".to_string(),
        })
        .get_result(conn)?;

    diesel::insert_into(call_participants::table)
        .values(&NewCallParticipant {
            call_id: call.id,
            user_id: initiator_id,
            answered: true,
        })
        .execute(conn)?;

    Ok(call)
}

pub fn find_call(conn: &mut PgConnection, call_id: Uuid) -> QueryResult<Call> {
    calls::table.find(call_id).first(conn)
}

/// First non-initiator answer moves the call to `ongoing`.
pub fn answer_call(conn: &mut PgConnection, call_id: Uuid, user_id: Uuid) -> QueryResult<Call> {
    let existing: Option<CallParticipant> = call_participants::table
        .filter(call_participants::call_id.eq(call_id))
        .filter(call_participants::user_id.eq(user_id))
        .first(conn)
        .optional()?;

    match existing {
        Some(participant) => {
            diesel::update(call_participants::table.find(participant.id))
                .set(call_participants::answered.eq(true))
                .execute(conn)?;
        }
        None => {
            diesel::insert_into(call_participants::table)
                .values(&NewCallParticipant {
                    call_id,
                    user_id,
                    answered: true,
                })
                .execute(conn)?;
        }
    }

    diesel::update(calls::table.find(call_id).filter(calls::status.eq("ringing")))
        .set(calls::status.eq("ongoing"))
        .execute(conn)?;

    find_call(conn, call_id)
}

pub fn reject_call(conn: &mut PgConnection, call_id: Uuid) -> QueryResult<Call> {
    diesel::update(calls::table.find(call_id))
        .set((calls::status.eq("rejected"), calls::ended_at.eq(Utc::now())))
        .get_result(conn)
}

/// Terminal status for a call being ended: `ongoing → completed`,
/// `ringing → missed` when nobody but the initiator ever answered.
pub fn final_call_status(current: &str, non_initiator_answered: bool) -> &'static str {
    if current == "ringing" && !non_initiator_answered {
        "missed"
    } else {
        "completed"
    }
}

pub fn end_call(conn: &mut PgConnection, call_id: Uuid) -> QueryResult<Call> {
    let call = find_call(conn, call_id)?;

    let answered: i64 = call_participants::table
        .filter(call_participants::call_id.eq(call_id))
        .filter(call_participants::user_id.ne(call.initiator_id))
        .filter(call_participants::answered.eq(true))
        .count()
        .get_result(conn)?;
    let final_status = final_call_status(&call.status, answered > 0);

    let now = Utc::now();
    diesel::update(
        call_participants::table
            .filter(call_participants::call_id.eq(call_id))
            .filter(call_participants::left_at.is_null()),
    )
    .set(call_participants::left_at.eq(now))
    .execute(conn)?;

    diesel::update(calls::table.find(call_id))
        .set((calls::status.eq(final_status), calls::ended_at.eq(now)))
        .get_result(conn)
}

pub fn call_history(
    conn: &mut PgConnection,
    room_id: Uuid,
    limit: i64,
    offset: i64,
) -> QueryResult<Vec<Call>> {
    calls::table
        .filter(calls::room_id.eq(room_id))
        .order(calls::started_at.desc())
        .limit(limit)
        .offset(offset)
        .load(conn)
}

/// The call a finished recording should be attached to: the most recent call
/// row for the room.
pub fn latest_call_for_room(conn: &mut PgConnection, room_id: Uuid) -> QueryResult<Option<Call>> {
    calls::table
        .filter(calls::room_id.eq(room_id))
        .order(calls::started_at.desc())
        .first(conn)
        .optional()
}

// ---------------------------------------------------------------------------
// Recordings
// ---------------------------------------------------------------------------

pub fn insert_recording(conn: &mut PgConnection, new: NewRecording) -> QueryResult<Recording> {
    diesel::insert_into(recordings::table).values(&new).get_result(conn)
}

pub fn recordings_for_call(conn: &mut PgConnection, call_id: Uuid) -> QueryResult<Vec<Recording>> {
    recordings::table
        .filter(recordings::call_id.eq(call_id))
        .order(recordings::started_at.desc())
        .load(conn)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_ordering_is_monotonic() {
        assert!(status_rank(STATUS_SENT) < status_rank(STATUS_DELIVERED));
        assert!(status_rank(STATUS_DELIVERED) < status_rank(STATUS_READ));
        // Unknown statuses rank lowest so min-aggregation can't be fooled.
        assert_eq!(status_rank("bogus"), 0);
    }

    #[test]
    fn min_aggregation_picks_least_advanced() {
        let statuses = ["read", "delivered", "read"];
        let min = statuses
            .iter()
            .min_by_key(|s| status_rank(s))
            .copied()
            .unwrap();
        assert_eq!(min, STATUS_DELIVERED);
    }

    #[test]
    fn ending_an_unanswered_ring_is_missed() {
        assert_eq!(final_call_status("ringing", false), "missed");
        assert_eq!(final_call_status("ringing", true), "completed");
        assert_eq!(final_call_status("ongoing", true), "completed");
        // Even a call that never left `ongoing` cleanly still completes.
        assert_eq!(final_call_status("ongoing", false), "completed");
    }
}
