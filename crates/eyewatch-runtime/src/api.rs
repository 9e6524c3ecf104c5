//! HTTP handlers for the dashboard API.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use eyewatch_core::{CoreError, DeviceId, TelemetryCategory, TimeRange};
use eyewatch_store::{DeleteOutcome, Document, StoreError, TelemetryStore};

use crate::chat::{ChatError, ChatService};
use crate::tracker::{TrackerError, TrackingController, TrackingStatus};

/// Shared handler state.
pub struct AppState {
    pub store: Arc<dyn TelemetryStore>,
    pub tracker: TrackingController,
    pub chat: Arc<ChatService>,
}

pub type SharedState = Arc<AppState>;

// ─── Errors ───────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }

    #[cfg(test)]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[cfg(test)]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "message": self.message,
                "error": self.kind,
            })),
        )
            .into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_body", rejection.body_text())
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_input", err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        tracing::error!("store error: {err}");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "store", err.to_string())
    }
}

impl From<TrackerError> for ApiError {
    fn from(err: TrackerError) -> Self {
        match err {
            TrackerError::AlreadyRunning { .. } => {
                Self::new(StatusCode::BAD_REQUEST, "already_running", "Tracking already active")
            }
            TrackerError::NotRunning => {
                Self::new(StatusCode::BAD_REQUEST, "not_running", "Tracking is not active")
            }
            TrackerError::SpawnError { .. } => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "spawn", err.to_string())
            }
            TrackerError::SignalError { .. } => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "signal", err.to_string())
            }
            TrackerError::ControllerGone => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "controller_gone", err.to_string())
            }
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::EmptyMessage => {
                Self::new(StatusCode::BAD_REQUEST, "empty_message", err.to_string())
            }
            ChatError::MessageTooLong { .. } => {
                Self::new(StatusCode::BAD_REQUEST, "message_too_long", err.to_string())
            }
        }
    }
}

/// Run a store call on the blocking pool.
async fn with_store<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&dyn TelemetryStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(&state.store);
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| ApiError::internal(format!("store task failed: {e}")))?
        .map_err(ApiError::from)
}

// ─── Requests / Responses ─────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequest {
    #[serde(default)]
    pub mac_address: Option<String>,
}

impl DeviceRequest {
    fn device(&self) -> Result<DeviceId, ApiError> {
        let raw = self
            .mac_address
            .as_deref()
            .ok_or_else(|| ApiError::bad_request("macAddress is required"))?;
        Ok(DeviceId::parse(raw)?)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteLogsRequest {
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub start_timestamp: Option<serde_json::Value>,
    #[serde(default)]
    pub end_timestamp: Option<serde_json::Value>,
    /// Defaults to process details.
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptQuery {
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

// ─── Health ───────────────────────────────────────────────────────

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ─── Device registry ──────────────────────────────────────────────

pub async fn check_mac_address(
    State(state): State<SharedState>,
    payload: Result<Json<DeviceRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(req) = payload?;
    let device = req.device()?;
    let found = with_store(&state, move |store| store.is_registered(&device)).await?;
    Ok(Json(json!({ "found": found })))
}

// ─── Tracking ─────────────────────────────────────────────────────

pub async fn start_tracking(
    State(state): State<SharedState>,
    payload: Result<Json<DeviceRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(req) = payload?;
    let device = req.device()?;
    tracing::info!(device = %device, "POST /api/start-tracking");

    let ack = state.tracker.start(device).await?;
    Ok(Json(json!({
        "message": "Tracking started",
        "device": ack.device,
        "pid": ack.pid,
        "startedAt": ack.started_at,
    })))
}

pub async fn stop_tracking(
    State(state): State<SharedState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    tracing::info!("POST /api/stop-tracking");
    let ack = state.tracker.stop().await?;
    Ok(Json(json!({
        "message": "Tracking stopped",
        "device": ack.device,
        "outcome": ack.outcome,
    })))
}

pub async fn tracking_status(
    State(state): State<SharedState>,
) -> Result<Json<TrackingStatus>, ApiError> {
    Ok(Json(state.tracker.status().await?))
}

// ─── Telemetry ────────────────────────────────────────────────────

async fn list_category(
    state: &AppState,
    payload: Result<Json<DeviceRequest>, JsonRejection>,
    category: TelemetryCategory,
) -> Result<Json<Vec<Document>>, ApiError> {
    let Json(req) = payload?;
    let device = req.device()?;
    tracing::debug!(device = %device, %category, "listing telemetry");
    let docs = with_store(state, move |store| store.find_all(&device, category)).await?;
    Ok(Json(docs))
}

pub async fn get_tracking(
    State(state): State<SharedState>,
    payload: Result<Json<DeviceRequest>, JsonRejection>,
) -> Result<Json<Vec<Document>>, ApiError> {
    list_category(&state, payload, TelemetryCategory::ProcessDetails).await
}

pub async fn browser_history(
    State(state): State<SharedState>,
    payload: Result<Json<DeviceRequest>, JsonRejection>,
) -> Result<Json<Vec<Document>>, ApiError> {
    list_category(&state, payload, TelemetryCategory::BrowserHistory).await
}

pub async fn system_health(
    State(state): State<SharedState>,
    payload: Result<Json<DeviceRequest>, JsonRejection>,
) -> Result<Json<Vec<Document>>, ApiError> {
    list_category(&state, payload, TelemetryCategory::SystemHealth).await
}

pub async fn network_details(
    State(state): State<SharedState>,
    payload: Result<Json<DeviceRequest>, JsonRejection>,
) -> Result<Json<Vec<Document>>, ApiError> {
    list_category(&state, payload, TelemetryCategory::NetworkDetails).await
}

pub async fn network_requests(
    State(state): State<SharedState>,
    payload: Result<Json<DeviceRequest>, JsonRejection>,
) -> Result<Json<Vec<Document>>, ApiError> {
    list_category(&state, payload, TelemetryCategory::NetworkRequests).await
}

pub async fn failure_alerts(
    State(state): State<SharedState>,
    payload: Result<Json<DeviceRequest>, JsonRejection>,
) -> Result<Json<Vec<Document>>, ApiError> {
    list_category(&state, payload, TelemetryCategory::FailureAlerts).await
}

pub async fn connected_devices(
    State(state): State<SharedState>,
    payload: Result<Json<DeviceRequest>, JsonRejection>,
) -> Result<Json<Vec<Document>>, ApiError> {
    list_category(&state, payload, TelemetryCategory::ConnectedDevices).await
}

/// Any category by name, e.g. `POST /api/telemetry/system-health`.
pub async fn telemetry_by_name(
    State(state): State<SharedState>,
    Path(category): Path<String>,
    payload: Result<Json<DeviceRequest>, JsonRejection>,
) -> Result<Json<Vec<Document>>, ApiError> {
    let category: TelemetryCategory = category.parse()?;
    list_category(&state, payload, category).await
}

pub async fn cheating_devices(
    State(state): State<SharedState>,
) -> Result<Json<Vec<Document>>, ApiError> {
    let docs = with_store(&state, |store| store.cheating_devices()).await?;
    Ok(Json(docs))
}

fn is_blank(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

pub async fn delete_logs(
    State(state): State<SharedState>,
    payload: Result<Json<DeleteLogsRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = payload?;
    let mac = req.mac_address.filter(|m| !m.trim().is_empty());
    let start = req.start_timestamp.filter(|v| !is_blank(v));
    let end = req.end_timestamp.filter(|v| !is_blank(v));
    let (Some(mac), Some(start), Some(end)) = (mac, start, end) else {
        return Err(ApiError::bad_request("Missing required parameters"));
    };

    let device = DeviceId::parse(&mac)?;
    let range = TimeRange::parse(&start, &end)?;
    let category = match req.category.as_deref() {
        Some(name) => name.parse()?,
        None => TelemetryCategory::ProcessDetails,
    };
    let time_range = json!({
        "start": range.start.to_rfc3339(),
        "end": range.end.to_rfc3339(),
    });

    tracing::info!(
        device = %device,
        %category,
        start = %range.start,
        end = %range.end,
        "deleting logs"
    );
    let outcome =
        with_store(&state, move |store| store.delete_range(&device, category, &range)).await?;

    let response = match outcome {
        DeleteOutcome::Deleted { count } => {
            tracing::info!(count, "deleted logs");
            Json(json!({
                "success": true,
                "deletedCount": count,
                "message": format!("Deleted {count} logs"),
                "timeRange": time_range,
            }))
            .into_response()
        }
        DeleteOutcome::NothingInRange { sample_timestamp } => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "success": false,
                "message": "No documents found in specified time range",
                "error": "not_found",
                "query": time_range,
                "sampleTimestamp": sample_timestamp,
            })),
        )
            .into_response(),
    };
    Ok(response)
}

// ─── Chat ─────────────────────────────────────────────────────────

pub async fn chat(
    State(state): State<SharedState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = payload?;
    let reply = state
        .chat
        .ask(req.conversation_id.as_deref(), &req.message)
        .await?;
    Ok(Json(reply).into_response())
}

pub async fn chat_transcript(
    State(state): State<SharedState>,
    Query(query): Query<TranscriptQuery>,
) -> Json<serde_json::Value> {
    let messages = state.chat.transcript(query.conversation_id.as_deref()).await;
    let conversation_id = query
        .conversation_id
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| crate::chat::DEFAULT_CONVERSATION.to_string());
    Json(json!({
        "conversationId": conversation_id,
        "messages": messages,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::TrackerConfig;
    use eyewatch_core::{FaqCorpus, FaqEntry, Namespace};
    use eyewatch_store::SqliteStore;
    use serde_json::Value;

    const MAC: &str = "AA:BB:CC:DD:EE:FF";

    fn state_with(store: SqliteStore) -> SharedState {
        let corpus = FaqCorpus::new(vec![FaqEntry {
            question: "How do I delete logs?".into(),
            answer: "Pick a range and press Delete.".into(),
        }]);
        Arc::new(AppState {
            store: Arc::new(store),
            tracker: TrackingController::spawn(TrackerConfig::default()),
            chat: Arc::new(ChatService::new(corpus, None)),
        })
    }

    fn state() -> SharedState {
        state_with(SqliteStore::open_in_memory().unwrap())
    }

    fn device_body(mac: &str) -> Result<Json<DeviceRequest>, JsonRejection> {
        Ok(Json(DeviceRequest {
            mac_address: Some(mac.to_string()),
        }))
    }

    fn seeded() -> SharedState {
        let store = SqliteStore::open_in_memory().unwrap();
        let device = DeviceId::parse(MAC).unwrap();
        for (i, ts) in ["2024-05-01T10:00:00Z", "2024-05-01T11:00:00Z", "2024-05-02T09:00:00Z"]
            .iter()
            .enumerate()
        {
            store
                .insert(
                    &Namespace::telemetry(&device, TelemetryCategory::ProcessDetails),
                    json!({"timestamp": ts, "app": format!("app{i}")}),
                )
                .unwrap();
        }
        store
            .insert(
                &Namespace::telemetry(&device, TelemetryCategory::SystemHealth),
                json!({"timestamp": "2024-05-01T10:00:00Z", "cpu": 12.5}),
            )
            .unwrap();
        store.register_device(&device).unwrap();
        state_with(store)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_version() {
        let Json(h) = health().await;
        assert_eq!(h.status, "ok");
        assert_eq!(h.version, env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn check_mac_address_reports_registration() {
        let state = seeded();
        let Json(v) = check_mac_address(State(state.clone()), device_body(MAC))
            .await
            .unwrap();
        assert_eq!(v, json!({"found": true}));

        let Json(v) = check_mac_address(State(state), device_body("11:22:33:44:55:66"))
            .await
            .unwrap();
        assert_eq!(v, json!({"found": false}));
    }

    #[tokio::test]
    async fn missing_mac_is_bad_request() {
        let err = get_tracking(State(state()), Ok(Json(DeviceRequest::default())))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = get_tracking(State(state()), device_body("   "))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn category_endpoints_read_their_own_collection() {
        let state = seeded();
        let Json(process) = get_tracking(State(state.clone()), device_body(MAC))
            .await
            .unwrap();
        assert_eq!(process.len(), 3);
        assert_eq!(process[0]["app"], "app0");
        assert!(process[0].get("_id").is_some());

        let Json(health) = system_health(State(state.clone()), device_body(MAC))
            .await
            .unwrap();
        assert_eq!(health.len(), 1);
        assert_eq!(health[0]["cpu"], 12.5);

        let Json(empty) = browser_history(State(state.clone()), device_body(MAC))
            .await
            .unwrap();
        assert!(empty.is_empty());

        let Json(by_name) = telemetry_by_name(
            State(state),
            Path("system-health".to_string()),
            device_body(MAC),
        )
        .await
        .unwrap();
        assert_eq!(by_name, health);
    }

    #[tokio::test]
    async fn unknown_category_name_is_bad_request() {
        let err = telemetry_by_name(State(state()), Path("weather".to_string()), device_body(MAC))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_logs_requires_all_fields() {
        let err = delete_logs(
            State(state()),
            Ok(Json(DeleteLogsRequest {
                mac_address: Some(MAC.into()),
                start_timestamp: Some(json!("2024-05-01T00:00:00Z")),
                end_timestamp: None,
                category: None,
            })),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.message(), "Missing required parameters");
    }

    #[tokio::test]
    async fn delete_logs_removes_range_and_reports_count() {
        let state = seeded();
        let response = delete_logs(
            State(state.clone()),
            Ok(Json(DeleteLogsRequest {
                mac_address: Some(MAC.into()),
                start_timestamp: Some(json!("2024-05-01T10:00:00Z")),
                end_timestamp: Some(json!("2024-05-01T11:00:00Z")),
                category: None,
            })),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["deletedCount"], 2);
        assert_eq!(body["message"], "Deleted 2 logs");

        let Json(left) = get_tracking(State(state), device_body(MAC)).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0]["app"], "app2");
    }

    #[tokio::test]
    async fn delete_logs_empty_range_is_not_found_with_sample() {
        let response = delete_logs(
            State(seeded()),
            Ok(Json(DeleteLogsRequest {
                mac_address: Some(MAC.into()),
                start_timestamp: Some(json!("2023-01-01")),
                end_timestamp: Some(json!("2023-01-02")),
                category: None,
            })),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["sampleTimestamp"], "2024-05-02T09:00:00Z");
    }

    #[tokio::test]
    async fn delete_logs_rejects_inverted_range() {
        let err = delete_logs(
            State(seeded()),
            Ok(Json(DeleteLogsRequest {
                mac_address: Some(MAC.into()),
                start_timestamp: Some(json!("2024-05-02")),
                end_timestamp: Some(json!("2024-05-01")),
                category: None,
            })),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stop_without_tracking_is_bad_request() {
        let err = stop_tracking(State(state())).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.message(), "Tracking is not active");

        let response = err.into_response();
        let body = body_json(response).await;
        assert_eq!(body["message"], "Tracking is not active");
        assert_eq!(body["error"], "not_running");
    }

    #[tokio::test]
    async fn status_starts_idle() {
        let Json(status) = tracking_status(State(state())).await.unwrap();
        let v = serde_json::to_value(status).unwrap();
        assert_eq!(v, json!({"state": "idle"}));
    }

    #[tokio::test]
    async fn tracker_errors_map_to_documented_messages() {
        let err = ApiError::from(TrackerError::AlreadyRunning {
            device: DeviceId::parse(MAC).unwrap(),
            state: "running",
        });
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.message(), "Tracking already active");

        let err = ApiError::from(TrackerError::ControllerGone);
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn cheating_devices_lists_global_collection() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert(&Namespace::cheating_devices(), json!({"macAddress": MAC, "reason": "usb"}))
            .unwrap();
        let Json(docs) = cheating_devices(State(state_with(store))).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["reason"], "usb");
    }

    #[tokio::test]
    async fn chat_answers_and_records_transcript() {
        let state = state();
        let response = chat(
            State(state.clone()),
            Ok(Json(ChatRequest {
                message: "how do i delete logs".into(),
                conversation_id: Some("c1".into()),
            })),
        )
        .await
        .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["reply"], "Pick a range and press Delete.");
        assert_eq!(body["source"], "faq");
        assert_eq!(body["conversationId"], "c1");

        let Json(t) = chat_transcript(
            State(state),
            Query(TranscriptQuery {
                conversation_id: Some("c1".into()),
            }),
        )
        .await;
        assert_eq!(t["conversationId"], "c1");
        assert_eq!(t["messages"].as_array().map(Vec::len), Some(2));
        assert_eq!(t["messages"][0]["sender"], "user");
    }

    #[tokio::test]
    async fn blank_chat_message_is_bad_request() {
        let err = chat(
            State(state()),
            Ok(Json(ChatRequest {
                message: "  ".into(),
                conversation_id: None,
            })),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn oversized_chat_message_is_bad_request() {
        let err = chat(
            State(state()),
            Ok(Json(ChatRequest {
                message: "x".repeat(crate::chat::MAX_MESSAGE_CHARS + 1),
                conversation_id: None,
            })),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(err.message().contains("longer than"));
    }
}
