//! Generative-text fallback for chat questions the FAQ corpus cannot answer.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash";
pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The API key goes here, never in the URL.
const API_KEY_HEADER: &str = "x-goog-api-key";

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("generator request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("generator returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("generator response contained no text")]
    EmptyResponse,
}

/// Anything that turns a prompt into free text.
#[async_trait::async_trait]
pub trait TextGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<String, GeneratorError>;
}

/// Client for the Gemini `generateContent` endpoint.
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, GeneratorError> {
        Self::with_base_url(GEMINI_BASE_URL, api_key, model)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, GeneratorError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: api_key.into(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

impl GenerateResponse {
    /// Concatenated text of the first candidate.
    fn into_text(self) -> Option<String> {
        let content = self.candidates.into_iter().next()?.content?;
        let text: String = content.parts.into_iter().filter_map(|p| p.text).collect();
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

#[async_trait::async_trait]
impl TextGenerator for GeminiClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String, GeneratorError> {
        let body = GenerateRequest {
            contents: [Content {
                parts: [Part { text: prompt }],
            }],
        };
        let resp = self
            .http
            .post(self.endpoint())
            .header(API_KEY_HEADER, &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GeneratorError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GenerateResponse = resp.json().await?;
        parsed.into_text().ok_or(GeneratorError::EmptyResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, http::HeaderMap, routing::post};

    fn parse(v: serde_json::Value) -> Option<String> {
        serde_json::from_value::<GenerateResponse>(v).unwrap().into_text()
    }

    #[test]
    fn request_body_shape() {
        let body = GenerateRequest {
            contents: [Content {
                parts: [Part { text: "hello" }],
            }],
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({"contents": [{"parts": [{"text": "hello"}]}]})
        );
    }

    #[test]
    fn response_text_joins_parts_of_first_candidate() {
        let text = parse(serde_json::json!({
            "candidates": [
                {"content": {"parts": [{"text": "Hello "}, {"text": "there."}]}},
                {"content": {"parts": [{"text": "ignored"}]}}
            ]
        }));
        assert_eq!(text.as_deref(), Some("Hello there."));
    }

    #[test]
    fn empty_or_blocked_responses_have_no_text() {
        assert_eq!(parse(serde_json::json!({})), None);
        assert_eq!(parse(serde_json::json!({"candidates": []})), None);
        assert_eq!(
            parse(serde_json::json!({"candidates": [{"finishReason": "SAFETY"}]})),
            None
        );
        assert_eq!(
            parse(serde_json::json!({"candidates": [{"content": {"parts": [{"text": "  "}]}}]})),
            None
        );
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn gemini_client_posts_prompt_with_key() {
        let app = Router::new().route(
            "/models/{model}",
            post(
                |axum::extract::Path(model): axum::extract::Path<String>,
                 headers: HeaderMap,
                 Json(body): Json<serde_json::Value>| async move {
                    let prompt = body["contents"][0]["parts"][0]["text"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string();
                    let key = headers
                        .get(API_KEY_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    Json(serde_json::json!({
                        "candidates": [{"content": {"parts": [
                            {"text": format!("{model}|{key}|{prompt}")}
                        ]}}]
                    }))
                },
            ),
        );
        let base = serve(app).await;
        let client = GeminiClient::with_base_url(base, "k123", "test-model").unwrap();
        let text = client.generate("what is up").await.unwrap();
        assert_eq!(text, "test-model:generateContent|k123|what is up");
    }

    #[tokio::test]
    async fn gemini_client_reports_http_errors() {
        let app = Router::new().route(
            "/models/{model}",
            post(|| async { (axum::http::StatusCode::FORBIDDEN, "bad key") }),
        );
        let base = serve(app).await;
        let client = GeminiClient::with_base_url(base, "nope", DEFAULT_GEMINI_MODEL).unwrap();
        match client.generate("hi").await {
            Err(GeneratorError::Status { status, body }) => {
                assert_eq!(status, 403);
                assert_eq!(body, "bad key");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_errors_do_not_leak_the_key() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client =
            GeminiClient::with_base_url(format!("http://{addr}"), "SECRETKEY123", "m").unwrap();
        let err = client.generate("hi").await.unwrap_err();
        assert!(matches!(err, GeneratorError::Http(_)));
        let logged = format!("generation failed: {err}");
        assert!(!logged.contains("SECRETKEY123"), "{logged}");
        assert!(!format!("{err:?}").contains("SECRETKEY123"));
    }
}
