use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

// ─── Device Identifier ────────────────────────────────────────────

/// Hardware network address of a monitored device.
///
/// Only non-emptiness is checked. The trimmed value namespaces all
/// per-device data and is handed verbatim to the tracking process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CoreError::EmptyDeviceId);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

// ─── Telemetry Category ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryCategory {
    ProcessDetails,
    BrowserHistory,
    SystemHealth,
    NetworkDetails,
    NetworkRequests,
    FailureAlerts,
    #[serde(rename = "connected_devices_details")]
    ConnectedDevices,
}

impl TelemetryCategory {
    pub const ALL: [Self; 7] = [
        Self::ProcessDetails,
        Self::BrowserHistory,
        Self::SystemHealth,
        Self::NetworkDetails,
        Self::NetworkRequests,
        Self::FailureAlerts,
        Self::ConnectedDevices,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProcessDetails => "process_details",
            Self::BrowserHistory => "browser_history",
            Self::SystemHealth => "system_health",
            Self::NetworkDetails => "network_details",
            Self::NetworkRequests => "network_requests",
            Self::FailureAlerts => "failure_alerts",
            Self::ConnectedDevices => "connected_devices_details",
        }
    }
}

impl fmt::Display for TelemetryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TelemetryCategory {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "connected_devices" => return Ok(Self::ConnectedDevices),
            "process" | "logs" | "tracking" => return Ok(Self::ProcessDetails),
            _ => {}
        }
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| CoreError::UnknownCategory(s.to_string()))
    }
}

// ─── Namespace ────────────────────────────────────────────────────

/// Database + collection pair addressing one document collection.
///
/// Per-device data lives in database `<mac>`, collection
/// `<category>_<mac>`. Global collections use fixed names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub const CHEATING_DEVICES: &'static str = "cheating_devices";

    pub fn telemetry(device: &DeviceId, category: TelemetryCategory) -> Self {
        Self {
            database: device.as_str().to_string(),
            collection: format!("{}_{}", category.as_str(), device.as_str()),
        }
    }

    pub fn cheating_devices() -> Self {
        Self {
            database: Self::CHEATING_DEVICES.to_string(),
            collection: Self::CHEATING_DEVICES.to_string(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

// ─── Timestamps & Ranges ──────────────────────────────────────────

/// Parse a timestamp the way dashboard clients send them.
///
/// Accepts RFC 3339 strings, naive `YYYY-MM-DDTHH:MM:SS[.fff]` (UTC),
/// bare `YYYY-MM-DD` dates (midnight UTC) and integer epoch milliseconds.
pub fn parse_timestamp(value: &serde_json::Value) -> Result<DateTime<Utc>, CoreError> {
    let invalid = |detail: &str| CoreError::InvalidTimestamp {
        value: value.to_string(),
        detail: detail.to_string(),
    };

    match value {
        serde_json::Value::Number(n) => {
            let ms = n.as_i64().ok_or_else(|| invalid("not an integer"))?;
            Utc.timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| invalid("out of range"))
        }
        serde_json::Value::String(s) => {
            parse_timestamp_str(s).ok_or_else(|| invalid("unrecognized format"))
        }
        _ => Err(invalid("expected string or number")),
    }
}

fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|n| n.and_utc());
    }
    s.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

/// Inclusive UTC time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, CoreError> {
        if start > end {
            return Err(CoreError::InvertedRange {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }
        Ok(Self { start, end })
    }

    pub fn parse(start: &serde_json::Value, end: &serde_json::Value) -> Result<Self, CoreError> {
        Self::new(parse_timestamp(start)?, parse_timestamp(end)?)
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts <= self.end
    }

    pub fn start_ms(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn end_ms(&self) -> i64 {
        self.end.timestamp_millis()
    }
}
