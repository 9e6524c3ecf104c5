//! CLI definition using clap derive.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use eyewatch_core::transcript::DEFAULT_TRANSCRIPT_CAPACITY;

use crate::chat::DEFAULT_MAX_CONVERSATIONS;
use crate::generator::DEFAULT_GEMINI_MODEL;

#[derive(Parser)]
#[command(name = "eyewatch", version, about = "device monitoring dashboard backend")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the HTTP server
    Serve(ServeOpts),
    /// Show tracking status
    Status(ClientOpts),
    /// Start tracking a device
    Start(StartOpts),
    /// Stop the running tracker
    Stop(ClientOpts),
    /// Print stored telemetry for a device
    Logs(LogsOpts),
    /// Delete a device's logs inside a time range
    DeleteLogs(DeleteLogsOpts),
    /// Ask the chatbot a question
    Ask(AskOpts),
    /// Load newline-delimited JSON documents into the database (offline)
    Ingest(IngestOpts),
    /// Add a device to the registry (offline)
    Register(RegisterOpts),
}

#[derive(Args)]
pub struct ServeOpts {
    /// Address to listen on
    #[arg(long, env = "EYEWATCH_LISTEN", default_value = "0.0.0.0:8000")]
    pub listen: String,

    #[command(flatten)]
    pub db: DbOpts,

    /// Tracker executable
    #[arg(long, env = "EYEWATCH_TRACKER_PROGRAM", default_value = "python")]
    pub tracker_program: String,

    /// Tracker argument placed before the device id (repeatable)
    #[arg(
        long = "tracker-arg",
        allow_hyphen_values = true,
        default_values_t = vec!["track_apps.py".to_string()]
    )]
    pub tracker_args: Vec<String>,

    /// Milliseconds between the interrupt and the forced kill
    #[arg(long, env = "EYEWATCH_STOP_GRACE_MS", default_value = "5000")]
    pub stop_grace_ms: u64,

    /// FAQ corpus JSON (`{"questions": [...]}`); empty corpus when absent
    #[arg(long, env = "EYEWATCH_FAQ_PATH")]
    pub faq_path: Option<PathBuf>,

    /// API key for the generative fallback; chat falls back to a canned reply without it
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub gemini_api_key: Option<String>,

    #[arg(long, env = "EYEWATCH_GEMINI_MODEL", default_value = DEFAULT_GEMINI_MODEL)]
    pub gemini_model: String,

    /// Messages kept per chat conversation
    #[arg(long, default_value_t = DEFAULT_TRANSCRIPT_CAPACITY)]
    pub transcript_capacity: usize,

    /// Chat conversations kept in memory; the least recently used is dropped
    #[arg(long, default_value_t = DEFAULT_MAX_CONVERSATIONS)]
    pub max_conversations: usize,

    /// Allow cross-origin requests from any origin
    #[arg(long, env = "EYEWATCH_CORS")]
    pub cors: bool,
}

#[derive(Args)]
pub struct DbOpts {
    /// SQLite database path (default: $XDG_DATA_HOME/eyewatch/telemetry.db)
    #[arg(long, env = "EYEWATCH_DB_PATH")]
    pub db_path: Option<PathBuf>,
}

impl DbOpts {
    pub fn resolve(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(default_db_path)
    }
}

#[derive(Args, Clone)]
pub struct ClientOpts {
    /// Base URL of a running server
    #[arg(long, env = "EYEWATCH_SERVER", default_value = "http://127.0.0.1:8000")]
    pub server: String,
}

#[derive(Args)]
pub struct StartOpts {
    pub mac_address: String,
    #[command(flatten)]
    pub client: ClientOpts,
}

#[derive(Args)]
pub struct LogsOpts {
    /// e.g. process_details, browser-history, network_requests
    pub category: String,
    pub mac_address: String,
    #[command(flatten)]
    pub client: ClientOpts,
}

#[derive(Args)]
pub struct DeleteLogsOpts {
    pub mac_address: String,
    /// Range start (RFC 3339, `YYYY-MM-DDTHH:MM:SS` or `YYYY-MM-DD`)
    pub start: String,
    /// Range end, inclusive
    pub end: String,
    /// Category to delete from
    #[arg(long, default_value = "process_details")]
    pub category: String,
    #[command(flatten)]
    pub client: ClientOpts,
}

#[derive(Args)]
pub struct AskOpts {
    /// Question text; multiple words are joined
    #[arg(required = true, num_args = 1..)]
    pub question: Vec<String>,
    #[arg(long)]
    pub conversation: Option<String>,
    #[command(flatten)]
    pub client: ClientOpts,
}

#[derive(Args)]
pub struct IngestOpts {
    /// Category collection to write into
    pub category: String,
    pub mac_address: String,
    /// NDJSON file; `-` reads stdin
    pub input: PathBuf,
    #[command(flatten)]
    pub db: DbOpts,
}

#[derive(Args)]
pub struct RegisterOpts {
    pub mac_address: String,
    #[command(flatten)]
    pub db: DbOpts,
}

/// `$XDG_DATA_HOME/eyewatch/telemetry.db`, else `~/.local/share/...`, else
/// the working directory.
pub fn default_db_path() -> PathBuf {
    if let Some(dir) = std::env::var_os("XDG_DATA_HOME").filter(|d| !d.is_empty()) {
        return PathBuf::from(dir).join("eyewatch/telemetry.db");
    }
    if let Some(home) = std::env::var_os("HOME").filter(|d| !d.is_empty()) {
        return PathBuf::from(home).join(".local/share/eyewatch/telemetry.db");
    }
    PathBuf::from("eyewatch-telemetry.db")
}
