//! HTTP client for the CLI subcommands that talk to a running server.

use reqwest::{Method, StatusCode};
use serde_json::{Value, json};

pub(crate) async fn api_call(
    server: &str,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> anyhow::Result<Value> {
    let url = format!("{}{path}", server.trim_end_matches('/'));
    let mut request = reqwest::Client::new().request(method, &url);
    if let Some(body) = body {
        request = request.json(&body);
    }
    let response = request
        .send()
        .await
        .map_err(|e| anyhow::anyhow!("cannot reach server at {server}: {e}"))?;

    let status = response.status();
    let text = response.text().await?;
    let value: Value = if text.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).unwrap_or(Value::String(text))
    };

    if !status.is_success() {
        anyhow::bail!("{}", error_message(status, &value));
    }
    Ok(value)
}

/// Human-readable error line for a failed API response.
pub(crate) fn error_message(status: StatusCode, body: &Value) -> String {
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| body.as_str())
        .unwrap_or("request failed");
    let mut line = format!("{message} (HTTP {})", status.as_u16());
    if let Some(sample) = body.get("sampleTimestamp").filter(|v| !v.is_null()) {
        let sample = sample.as_str().map_or_else(|| sample.to_string(), str::to_string);
        line.push_str(&format!("; latest stored timestamp: {sample}"));
    }
    line
}

/// One-line tracking status.
pub(crate) fn format_status(status: &Value) -> String {
    let state = status["state"].as_str().unwrap_or("unknown");
    match (status["device"].as_str(), status["pid"].as_u64()) {
        (Some(device), Some(pid)) => {
            let mut line = format!("{state}: {device} (pid {pid})");
            if let Some(since) = status["startedAt"].as_str() {
                line.push_str(&format!(" since {since}"));
            }
            line
        }
        _ => state.to_string(),
    }
}

pub async fn cmd_status(server: &str) -> anyhow::Result<()> {
    let status = api_call(server, Method::GET, "/api/tracking-status", None).await?;
    println!("{}", format_status(&status));
    Ok(())
}

pub async fn cmd_start(server: &str, mac_address: &str) -> anyhow::Result<()> {
    let ack = api_call(
        server,
        Method::POST,
        "/api/start-tracking",
        Some(json!({ "macAddress": mac_address })),
    )
    .await?;
    println!(
        "Tracking started for {} (pid {})",
        ack["device"].as_str().unwrap_or(mac_address),
        ack["pid"]
    );
    Ok(())
}

pub async fn cmd_stop(server: &str) -> anyhow::Result<()> {
    let ack = api_call(server, Method::POST, "/api/stop-tracking", None).await?;
    println!(
        "Tracking stopped for {} ({})",
        ack["device"].as_str().unwrap_or("?"),
        ack["outcome"].as_str().unwrap_or("unknown")
    );
    Ok(())
}

/// Print each document as one JSON line.
pub async fn cmd_logs(server: &str, category: &str, mac_address: &str) -> anyhow::Result<()> {
    let docs = api_call(
        server,
        Method::POST,
        &format!("/api/telemetry/{category}"),
        Some(json!({ "macAddress": mac_address })),
    )
    .await?;
    for doc in docs.as_array().map(Vec::as_slice).unwrap_or_default() {
        println!("{doc}");
    }
    Ok(())
}

pub async fn cmd_delete_logs(
    server: &str,
    mac_address: &str,
    start: &str,
    end: &str,
    category: &str,
) -> anyhow::Result<()> {
    let result = api_call(
        server,
        Method::POST,
        "/api/delete-logs",
        Some(json!({
            "macAddress": mac_address,
            "startTimestamp": start,
            "endTimestamp": end,
            "category": category,
        })),
    )
    .await?;
    println!("{}", result["message"].as_str().unwrap_or("done"));
    Ok(())
}

pub async fn cmd_ask(
    server: &str,
    question: &str,
    conversation: Option<&str>,
) -> anyhow::Result<()> {
    let mut body = json!({ "message": question });
    if let Some(id) = conversation {
        body["conversationId"] = json!(id);
    }
    let reply = api_call(server, Method::POST, "/api/chat", Some(body)).await?;
    println!("{}", reply["reply"].as_str().unwrap_or_default());
    Ok(())
}
