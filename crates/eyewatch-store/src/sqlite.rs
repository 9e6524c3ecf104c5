//! SQLite-backed document store.
//!
//! Every collection lives in one `documents` table addressed by
//! `(db_name, collection)`. The document's `timestamp` field is copied into
//! `ts_ms` on insert so range deletes can use an index.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use eyewatch_core::{DeviceId, Namespace, TelemetryCategory, TimeRange, parse_timestamp};

use crate::accessor::{DeleteOutcome, Document, TelemetryStore};
use crate::error::StoreError;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database. Useful for testing.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        self.lock()?.execute_batch(
            "CREATE TABLE IF NOT EXISTS documents (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                db_name     TEXT NOT NULL,
                collection  TEXT NOT NULL,
                ts_ms       INTEGER,
                body        TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS documents_ns_ts
                ON documents (db_name, collection, ts_ms);
            CREATE TABLE IF NOT EXISTS devices (
                mac           TEXT PRIMARY KEY,
                registered_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn find_namespace(&self, ns: &Namespace) -> Result<Vec<Document>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, body FROM documents
             WHERE db_name = ?1 AND collection = ?2
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![ns.database, ns.collection], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut docs = Vec::new();
        for row in rows {
            let (id, body) = row?;
            docs.push(with_id(id, &body)?);
        }
        tracing::debug!(namespace = %ns, count = docs.len(), "find");
        Ok(docs)
    }
}

/// Decode a stored body and expose the row id as `_id`.
fn with_id(id: i64, body: &str) -> Result<Document, StoreError> {
    let mut doc: Document = serde_json::from_str(body)?;
    if let Some(obj) = doc.as_object_mut() {
        obj.insert("_id".to_string(), serde_json::Value::String(id.to_string()));
    }
    Ok(doc)
}

fn json_kind(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

impl TelemetryStore for SqliteStore {
    fn find_all(
        &self,
        device: &DeviceId,
        category: TelemetryCategory,
    ) -> Result<Vec<Document>, StoreError> {
        self.find_namespace(&Namespace::telemetry(device, category))
    }

    fn delete_range(
        &self,
        device: &DeviceId,
        category: TelemetryCategory,
        range: &TimeRange,
    ) -> Result<DeleteOutcome, StoreError> {
        let ns = Namespace::telemetry(device, category);
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM documents
             WHERE db_name = ?1 AND collection = ?2 AND ts_ms BETWEEN ?3 AND ?4",
            params![ns.database, ns.collection, range.start_ms(), range.end_ms()],
            |row| row.get(0),
        )?;

        if count == 0 {
            let latest: Option<String> = tx
                .query_row(
                    "SELECT body FROM documents
                     WHERE db_name = ?1 AND collection = ?2
                     ORDER BY ts_ms DESC, id DESC LIMIT 1",
                    params![ns.database, ns.collection],
                    |row| row.get(0),
                )
                .optional()?;
            let sample_timestamp = match latest {
                Some(body) => {
                    let doc: Document = serde_json::from_str(&body)?;
                    doc.get("timestamp").cloned()
                }
                None => None,
            };
            tracing::info!(namespace = %ns, "no documents in range");
            return Ok(DeleteOutcome::NothingInRange { sample_timestamp });
        }

        let deleted = tx.execute(
            "DELETE FROM documents
             WHERE db_name = ?1 AND collection = ?2 AND ts_ms BETWEEN ?3 AND ?4",
            params![ns.database, ns.collection, range.start_ms(), range.end_ms()],
        )?;
        tx.commit()?;

        tracing::info!(namespace = %ns, deleted, "deleted documents in range");
        Ok(DeleteOutcome::Deleted { count: deleted })
    }

    fn is_registered(&self, device: &DeviceId) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM devices WHERE mac = ?1",
                params![device.as_str()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn register_device(&self, device: &DeviceId) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO devices (mac, registered_at) VALUES (?1, ?2)",
            params![device.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(inserted > 0)
    }

    fn cheating_devices(&self) -> Result<Vec<Document>, StoreError> {
        self.find_namespace(&Namespace::cheating_devices())
    }

    fn insert(&self, namespace: &Namespace, document: Document) -> Result<i64, StoreError> {
        if !document.is_object() {
            return Err(StoreError::InvalidDocument(json_kind(&document)));
        }
        let ts_ms = document
            .get("timestamp")
            .and_then(|v| parse_timestamp(v).ok())
            .map(|ts| ts.timestamp_millis());
        if ts_ms.is_none() && document.get("timestamp").is_some() {
            tracing::debug!(
                namespace = %namespace,
                "document timestamp not parseable; excluded from range deletes"
            );
        }

        let body = serde_json::to_string(&document)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO documents (db_name, collection, ts_ms, body) VALUES (?1, ?2, ?3, ?4)",
            params![namespace.database, namespace.collection, ts_ms, body],
        )?;
        Ok(conn.last_insert_rowid())
    }
}
