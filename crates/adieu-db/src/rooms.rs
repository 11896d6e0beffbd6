//! Room versions and room state snapshots.

use crate::error::DbError;
use crate::id_column;
use adieu_types::{
    CreateEvent, MembershipEvent, OwnedEventId, RoomId, RoomSnapshot, RoomState, RoomVersionId,
    UserId, CREATE_EVENT_TYPE, MEMBER_EVENT_TYPE,
};
use rusqlite::{params, Connection, OptionalExtension};

/// Registers a room and its version.
///
/// Used to bootstrap rooms this server is resident in; the version of an
/// existing room is never changed.
pub fn create_room(
    conn: &Connection,
    room_id: &RoomId,
    room_version: &RoomVersionId,
) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO rooms (room_id, room_version) VALUES (?1, ?2)",
        params![room_id.as_str(), room_version.as_str()],
    )?;
    tracing::info!(room_id = room_id.as_str(), %room_version, "created room");
    Ok(())
}

/// Returns the raw version tag of a room, or `None` if the room is unknown.
///
/// The tag is returned unparsed so callers can tell an unknown room apart
/// from a room whose version this build does not support.
pub fn get_room_version(conn: &Connection, room_id: &RoomId) -> Result<Option<String>, DbError> {
    let version = conn
        .query_row(
            "SELECT room_version FROM rooms WHERE room_id = ?1",
            params![room_id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version)
}

/// Loads the membership-relevant current state and forward extremities.
///
/// Returns `None` if the room is unknown.
pub fn load_snapshot(conn: &Connection, room_id: &RoomId) -> Result<Option<RoomSnapshot>, DbError> {
    if get_room_version(conn, room_id)?.is_none() {
        return Ok(None);
    }

    let mut state = RoomState::default();
    let mut stmt = conn.prepare(
        "SELECT cs.event_type, e.json
         FROM current_state cs
         JOIN events e ON e.event_id = cs.event_id
         WHERE cs.room_id = ?1 AND cs.event_type IN (?2, ?3)",
    )?;
    let rows = stmt.query_map(
        params![room_id.as_str(), CREATE_EVENT_TYPE, MEMBER_EVENT_TYPE],
        |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
    )?;
    for row in rows {
        let (kind, json) = row?;
        if kind == CREATE_EVENT_TYPE {
            let create: CreateEvent = serde_json::from_str(&json)?;
            state.create = Some(create);
        } else {
            let member: MembershipEvent = serde_json::from_str(&json)?;
            let user = UserId::parse(member.state_key()).map_err(|e| {
                DbError::Corrupt(format!("member event {} has a bad state_key: {e}", member.event_id))
            })?;
            state.members.insert(user, member);
        }
    }

    let mut stmt = conn.prepare(
        "SELECT fe.event_id, e.depth
         FROM forward_extremities fe
         JOIN events e ON e.event_id = fe.event_id
         WHERE fe.room_id = ?1
         ORDER BY e.depth DESC, fe.event_id",
    )?;
    let extremities = stmt
        .query_map(params![room_id.as_str()], |row| {
            Ok((id_column::<OwnedEventId>(row, 0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let max_depth = extremities
        .iter()
        .map(|(_, depth)| u64::try_from(*depth).unwrap_or_default())
        .max()
        .unwrap_or_default();
    let prev_events = extremities.into_iter().map(|(id, _)| id).collect();

    Ok(Some(RoomSnapshot {
        state,
        prev_events,
        max_depth,
    }))
}
