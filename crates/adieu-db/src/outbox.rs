//! Durable queue of events awaiting delivery to remote servers.

use crate::error::DbError;
use crate::id_column;
use adieu_types::{EventId, OwnedEventId, OwnedServerName, ServerName};
use rusqlite::{params, Connection};

/// One pending delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub id: i64,
    pub destination: OwnedServerName,
    pub event_id: OwnedEventId,
    /// The local server name the transaction is sent as.
    pub send_as: OwnedServerName,
    pub attempts: u32,
}

/// Queues `event_id` for delivery to `destination`.
///
/// Returns `false` if that delivery was already queued.
pub fn enqueue(
    conn: &Connection,
    destination: &ServerName,
    event_id: &EventId,
    send_as: &ServerName,
) -> Result<bool, DbError> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO federation_outbox (destination, event_id, send_as)
         VALUES (?1, ?2, ?3)",
        params![destination.as_str(), event_id.as_str(), send_as.as_str()],
    )?;
    Ok(inserted > 0)
}

/// Returns up to `limit` undelivered entries, oldest first.
pub fn pending(conn: &Connection, limit: usize) -> Result<Vec<OutboxEntry>, DbError> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut stmt = conn.prepare(
        "SELECT id, destination, event_id, send_as, attempts
         FROM federation_outbox
         WHERE delivered_at IS NULL
         ORDER BY id
         LIMIT ?1",
    )?;
    let entries = stmt
        .query_map(params![limit], |row| {
            Ok(OutboxEntry {
                id: row.get(0)?,
                destination: id_column(row, 1)?,
                event_id: id_column(row, 2)?,
                send_as: id_column(row, 3)?,
                attempts: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

pub fn mark_delivered(conn: &Connection, id: i64) -> Result<(), DbError> {
    conn.execute(
        "UPDATE federation_outbox SET delivered_at = datetime('now'), last_error = NULL
         WHERE id = ?1",
        params![id],
    )?;
    Ok(())
}

/// Records a failed attempt; the entry stays queued.
pub fn record_failure(conn: &Connection, id: i64, error: &str) -> Result<(), DbError> {
    conn.execute(
        "UPDATE federation_outbox SET attempts = attempts + 1, last_error = ?2 WHERE id = ?1",
        params![id, error],
    )?;
    Ok(())
}
