//! Error types for the telemetry store.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("stored document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("document must be a JSON object, got {0}")]
    InvalidDocument(&'static str),

    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store connection lock poisoned")]
    Poisoned,
}
