//! eyewatch-store: per-device telemetry document store.
//! Query / range-delete by device and category, device registry, and the
//! global cheating-devices collection. IO boundary only.

pub mod accessor;
pub mod error;
pub mod sqlite;

pub use accessor::{DeleteOutcome, Document, TelemetryStore};
pub use error::StoreError;
pub use sqlite::SqliteStore;
