//! Chat-completion client for the extraction model.
//!
//! The model is reached through an OpenAI-compatible endpoint (Groq by
//! default). Failures are classified so the extractor can tell a
//! transient rate limit from an exhausted daily quota.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("API returned error (status {status}): {body}")]
    Http { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected response: {0}")]
    Response(String),
}

/// One extraction request.
#[derive(Debug, Clone, Copy)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub system: &'a str,
    pub user: &'a str,
}

/// Anything that can answer a chat request with the model's text.
pub trait LlmClient {
    fn complete(&self, request: &ChatRequest<'_>) -> Result<String, LlmError>;
}

/// Blocking client for OpenAI-compatible chat completions.
pub struct GroqClient {
    client: Client,
    endpoint: String,
}

impl GroqClient {
    pub fn new(api_key: &str, base_url: &str, timeout: Duration) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing API key");
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
                .context("invalid API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
        })
    }
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: [Message<'a>; 2],
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl LlmClient for GroqClient {
    fn complete(&self, request: &ChatRequest<'_>) -> Result<String, LlmError> {
        let body = ChatBody {
            model: request.model,
            messages: [
                Message {
                    role: "system",
                    content: request.system,
                },
                Message {
                    role: "user",
                    content: request.user,
                },
            ],
            temperature: 0.0,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body = response.text().unwrap_or_default();
            return Err(classify_failure(status, &body, retry_after));
        }

        let parsed: ChatResponse = response
            .json()
            .map_err(|e| LlmError::Response(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::Response("no message content in reply".to_string()))
    }
}

/// Sort a failed response into the error taxonomy. A 429 that talks about
/// a quota or a per-day budget ends the run; any other 429 is a rate limit.
pub fn classify_failure(status: StatusCode, body: &str, retry_after: Option<Duration>) -> LlmError {
    let lower = body.to_lowercase();
    let daily = lower.contains("quota")
        || lower.contains("per day")
        || lower.contains("(rpd)")
        || lower.contains("(tpd)")
        || lower.contains("daily limit");

    if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::PAYMENT_REQUIRED {
        if daily || status == StatusCode::PAYMENT_REQUIRED {
            return LlmError::QuotaExhausted(truncate_body(body));
        }
        return LlmError::RateLimited { retry_after };
    }

    LlmError::Http {
        status: status.as_u16(),
        body: truncate_body(body),
    }
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .and_then(|s| Duration::try_from_secs_f64(s).ok())
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 300;
    if body.chars().count() <= MAX {
        body.to_string()
    } else {
        let cut: String = body.chars().take(MAX).collect();
        format!("{}...", cut)
    }
}
