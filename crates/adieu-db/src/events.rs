//! Event persistence.
//!
//! Events are stored as the exact JSON they were accepted as, alongside a few
//! indexed columns. Storing an event also advances the room's current state
//! and forward extremities.

use crate::error::DbError;
use adieu_types::{EventId, OwnedEventId, OwnedRoomId, OwnedServerName, OwnedUserId};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::Value;

/// The envelope fields indexed alongside the stored JSON.
#[derive(Debug, Deserialize)]
struct EventIndex {
    room_id: OwnedRoomId,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    state_key: Option<String>,
    sender: OwnedUserId,
    origin: OwnedServerName,
    depth: u64,
    #[serde(default)]
    prev_events: Vec<OwnedEventId>,
}

/// Returns `true` if an event with this id has been stored.
pub fn event_exists(conn: &Connection, event_id: &EventId) -> Result<bool, DbError> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM events WHERE event_id = ?1)",
        params![event_id.as_str()],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Loads the stored JSON of an event.
pub fn get_event_json(conn: &Connection, event_id: &EventId) -> Result<Option<Value>, DbError> {
    let json: Option<String> = conn
        .query_row(
            "SELECT json FROM events WHERE event_id = ?1",
            params![event_id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    json.map(|s| serde_json::from_str(&s).map_err(DbError::from))
        .transpose()
}

/// Persists an event and advances its room's state and extremities.
///
/// `json` must be the event in its stored form, `event_id` included. Returns
/// `false` without touching anything if the event was already stored. Run it
/// inside a transaction together with the authorization check that admitted
/// the event.
pub fn store_event(conn: &Connection, event_id: &EventId, json: &Value) -> Result<bool, DbError> {
    let index: EventIndex = serde_json::from_value(json.clone())?;
    let depth = i64::try_from(index.depth)
        .map_err(|_| DbError::Corrupt(format!("depth {} out of range", index.depth)))?;
    let text = serde_json::to_string(json)?;

    let inserted = conn.execute(
        "INSERT OR IGNORE INTO events
            (event_id, room_id, event_type, state_key, sender, origin, depth, json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            event_id.as_str(),
            index.room_id.as_str(),
            index.kind,
            index.state_key,
            index.sender.as_str(),
            index.origin.as_str(),
            depth,
            text
        ],
    )?;
    if inserted == 0 {
        return Ok(false);
    }

    if let Some(state_key) = &index.state_key {
        conn.execute(
            "INSERT INTO current_state (room_id, event_type, state_key, event_id)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (room_id, event_type, state_key)
             DO UPDATE SET event_id = excluded.event_id",
            params![index.room_id.as_str(), index.kind, state_key, event_id.as_str()],
        )?;
    }

    for prev in &index.prev_events {
        conn.execute(
            "DELETE FROM forward_extremities WHERE room_id = ?1 AND event_id = ?2",
            params![index.room_id.as_str(), prev.as_str()],
        )?;
    }
    conn.execute(
        "INSERT OR IGNORE INTO forward_extremities (room_id, event_id) VALUES (?1, ?2)",
        params![index.room_id.as_str(), event_id.as_str()],
    )?;

    tracing::debug!(
        event_id = event_id.as_str(),
        room_id = index.room_id.as_str(),
        kind = %index.kind,
        "stored event"
    );
    Ok(true)
}
