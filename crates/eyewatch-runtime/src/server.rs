//! HTTP server: router assembly, startup wiring and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use eyewatch_core::FaqCorpus;
use eyewatch_store::SqliteStore;

use crate::api::{self, AppState, SharedState};
use crate::chat::ChatService;
use crate::child::TrackerCommand;
use crate::cli::ServeOpts;
use crate::generator::{GeminiClient, TextGenerator};
use crate::tracker::{TrackerConfig, TrackingController};

pub fn build_router(state: SharedState, cors: bool) -> Router {
    let mut app = Router::new()
        .route("/api/health", get(api::health))
        // Device registry
        .route("/api/check-mac-address", post(api::check_mac_address))
        // Tracking
        .route("/api/start-tracking", post(api::start_tracking))
        .route("/api/stop-tracking", post(api::stop_tracking))
        .route("/api/tracking-status", get(api::tracking_status))
        // Telemetry
        .route("/api/getTracking", post(api::get_tracking))
        .route("/api/delete-logs", post(api::delete_logs))
        .route("/api/display-browser-history", post(api::browser_history))
        .route("/api/check-system-health", post(api::system_health))
        .route("/api/display-network-details", post(api::network_details))
        .route("/api/display-network-requests", post(api::network_requests))
        .route("/api/display-failure-alerts", post(api::failure_alerts))
        .route("/api/display-connected-devices", post(api::connected_devices))
        .route("/api/display-cheating-devices", get(api::cheating_devices))
        .route("/api/telemetry/{category}", post(api::telemetry_by_name))
        // Chat
        .route("/api/chat", post(api::chat))
        .route("/api/chat/transcript", get(api::chat_transcript))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if cors {
        app = app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }
    app
}

fn load_corpus(opts: &ServeOpts) -> anyhow::Result<FaqCorpus> {
    let Some(path) = opts.faq_path.as_ref() else {
        tracing::info!("no FAQ corpus configured; every question goes to the generator");
        return Ok(FaqCorpus::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read FAQ corpus {}", path.display()))?;
    let corpus = FaqCorpus::from_json(&raw)
        .with_context(|| format!("failed to parse FAQ corpus {}", path.display()))?;
    tracing::info!(entries = corpus.len(), path = %path.display(), "FAQ corpus loaded");
    Ok(corpus)
}

fn build_generator(opts: &ServeOpts) -> anyhow::Result<Option<Arc<dyn TextGenerator>>> {
    match opts.gemini_api_key.as_deref().filter(|k| !k.trim().is_empty()) {
        Some(key) => {
            let client: Arc<dyn TextGenerator> = Arc::new(
                GeminiClient::new(key, opts.gemini_model.clone())
                    .context("failed to build generator client")?,
            );
            tracing::info!(model = %opts.gemini_model, "generative fallback enabled");
            Ok(Some(client))
        }
        None => {
            tracing::warn!("GEMINI_API_KEY not set; unmatched chat questions get the canned reply");
            Ok(None)
        }
    }
}

/// Run the server until ctrl-c or SIGTERM, then stop any running tracker.
pub async fn run_server(opts: ServeOpts) -> anyhow::Result<()> {
    let db_path = opts.db.resolve();
    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "database opened");

    let chat = ChatService::new(load_corpus(&opts)?, build_generator(&opts)?)
        .with_transcript_capacity(opts.transcript_capacity)
        .with_max_conversations(opts.max_conversations);
    let tracker = TrackingController::spawn(TrackerConfig {
        command: TrackerCommand {
            program: opts.tracker_program.clone(),
            args: opts.tracker_args.clone(),
        },
        stop_grace: Duration::from_millis(opts.stop_grace_ms),
        ..TrackerConfig::default()
    });

    let state = Arc::new(AppState {
        store: Arc::new(store),
        tracker: tracker.clone(),
        chat: Arc::new(chat),
    });
    let app = build_router(state, opts.cors);

    let listener = tokio::net::TcpListener::bind(&opts.listen)
        .await
        .with_context(|| format!("failed to bind {}", opts.listen))?;
    tracing::info!(addr = %listener.local_addr()?, cors = opts.cors, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracker.shutdown().await;
    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                tracing::warn!("failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                tracing::info!("received ctrl-c, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        tracing::info!("received ctrl-c, shutting down");
    }
}
