use thiserror::Error;

/// Errors returned by the query helpers in this crate.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    /// A stored row no longer parses as what was written.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}
