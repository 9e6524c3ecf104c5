//! Error type shared by the pure domain types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("device identifier must not be empty")]
    EmptyDeviceId,

    #[error("unknown telemetry category: {0}")]
    UnknownCategory(String),

    #[error("invalid timestamp {value:?}: {detail}")]
    InvalidTimestamp { value: String, detail: String },

    #[error("time range start {start} is after end {end}")]
    InvertedRange { start: String, end: String },

    #[error("failed to parse FAQ corpus: {0}")]
    Corpus(#[from] serde_json::Error),
}
