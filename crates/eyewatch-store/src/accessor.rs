//! `TelemetryStore` trait: the query surface the HTTP layer depends on.
//! Kept as a trait so handlers can be exercised against a fake.

use serde::Serialize;

use eyewatch_core::{DeviceId, Namespace, TelemetryCategory, TimeRange};

use crate::error::StoreError;

/// A stored document as returned to clients (JSON object incl. `_id`).
pub type Document = serde_json::Value;

/// Result of a range delete.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted { count: usize },
    /// Nothing matched. `sample_timestamp` is the raw `timestamp` of the
    /// most recent document in the collection, if any.
    NothingInRange { sample_timestamp: Option<serde_json::Value> },
}

pub trait TelemetryStore: Send + Sync {
    /// All documents of one category for one device, in insertion order.
    fn find_all(
        &self,
        device: &DeviceId,
        category: TelemetryCategory,
    ) -> Result<Vec<Document>, StoreError>;

    /// Delete documents whose `timestamp` lies inside `range` (inclusive).
    fn delete_range(
        &self,
        device: &DeviceId,
        category: TelemetryCategory,
        range: &TimeRange,
    ) -> Result<DeleteOutcome, StoreError>;

    fn is_registered(&self, device: &DeviceId) -> Result<bool, StoreError>;

    /// Idempotent. Returns `true` if the device was newly added.
    fn register_device(&self, device: &DeviceId) -> Result<bool, StoreError>;

    fn cheating_devices(&self) -> Result<Vec<Document>, StoreError>;

    /// Append a document to an arbitrary namespace. Returns its id.
    fn insert(&self, namespace: &Namespace, document: Document) -> Result<i64, StoreError>;
}

impl<T: TelemetryStore + ?Sized> TelemetryStore for &T {
    fn find_all(
        &self,
        device: &DeviceId,
        category: TelemetryCategory,
    ) -> Result<Vec<Document>, StoreError> {
        (**self).find_all(device, category)
    }

    fn delete_range(
        &self,
        device: &DeviceId,
        category: TelemetryCategory,
        range: &TimeRange,
    ) -> Result<DeleteOutcome, StoreError> {
        (**self).delete_range(device, category, range)
    }

    fn is_registered(&self, device: &DeviceId) -> Result<bool, StoreError> {
        (**self).is_registered(device)
    }

    fn register_device(&self, device: &DeviceId) -> Result<bool, StoreError> {
        (**self).register_device(device)
    }

    fn cheating_devices(&self) -> Result<Vec<Document>, StoreError> {
        (**self).cheating_devices()
    }

    fn insert(&self, namespace: &Namespace, document: Document) -> Result<i64, StoreError> {
        (**self).insert(namespace, document)
    }
}
