//! Storage for the Adieu federation server.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization,
//! embedded SQL migrations, and the query helpers behind room versions,
//! room state, event persistence, server keys, and the federation outbox.
//!
//! Query helpers take a borrowed [`rusqlite::Connection`] so that callers can
//! run several of them inside one transaction. They are blocking; async
//! callers run them on `tokio::task::spawn_blocking`.

mod error;
mod migrations;
mod pool;

pub mod events;
pub mod keys;
pub mod outbox;
pub mod rooms;

pub use error::DbError;
pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, open_database, DbPool, DbRuntimeSettings, PoolError};

use rusqlite::Row;
use std::str::FromStr;

/// Reads a text column and parses it into a validated identifier.
pub(crate) fn id_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}
