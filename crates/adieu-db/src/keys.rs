//! Server signing keys.
//!
//! Holds this server's own published verify key as well as remote keys
//! learned out of band or through key queries.

use crate::error::DbError;
use crate::id_column;
use adieu_types::{OwnedServerName, ServerName};
use rusqlite::{params, Connection};

/// A published ed25519 verify key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerKey {
    pub server_name: OwnedServerName,
    /// Full key id, e.g. `ed25519:a_bcde`.
    pub key_id: String,
    /// Unpadded base64 of the 32 public key bytes.
    pub public_key: String,
    /// Milliseconds since the epoch after which signatures made with this key
    /// are no longer accepted.
    pub valid_until_ts: u64,
}

/// Inserts a key, or replaces the stored copy of the same key id.
pub fn upsert_server_key(conn: &Connection, key: &ServerKey) -> Result<(), DbError> {
    let valid_until = i64::try_from(key.valid_until_ts).unwrap_or(i64::MAX);
    conn.execute(
        "INSERT INTO server_keys (server_name, key_id, public_key, valid_until_ts)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (server_name, key_id) DO UPDATE SET
            public_key = excluded.public_key,
            valid_until_ts = excluded.valid_until_ts,
            updated_at = datetime('now')",
        params![
            key.server_name.as_str(),
            key.key_id,
            key.public_key,
            valid_until
        ],
    )?;
    Ok(())
}

/// Returns every stored key of `server_name`, ordered by key id.
pub fn get_server_keys(conn: &Connection, server_name: &ServerName) -> Result<Vec<ServerKey>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT server_name, key_id, public_key, valid_until_ts
         FROM server_keys
         WHERE server_name = ?1
         ORDER BY key_id",
    )?;
    let keys = stmt
        .query_map(params![server_name.as_str()], |row| {
            Ok(ServerKey {
                server_name: id_column(row, 0)?,
                key_id: row.get(1)?,
                public_key: row.get(2)?,
                valid_until_ts: u64::try_from(row.get::<_, i64>(3)?).unwrap_or_default(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(keys)
}
