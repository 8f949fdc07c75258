//! Model client abstraction and the chat-completions HTTP backend.
//!
//! The [`ModelClient`] trait decouples the loop from the inference endpoint.
//! Tests use scripted clients that return canned text without any network.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::response::RESPONSE_SCHEMA;
use crate::io::config::ModelConfig;
use crate::io::context::ContextBundle;

const BODY_EXCERPT_BYTES: usize = 2_000;

/// Failure to obtain completion text from the endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request to {url} timed out after {timeout_secs}s")]
    Timeout { url: String, timeout_secs: u64 },
    #[error("could not reach {url}: {message}")]
    Connect { url: String, message: String },
    #[error("{url} returned HTTP {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("unexpected completion payload: {0}")]
    Envelope(String),
}

impl TransportError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Timeout { .. } | TransportError::Connect { .. } => true,
            TransportError::Status { status, .. } => *status == 429 || *status >= 500,
            TransportError::Envelope(_) => false,
        }
    }
}

/// Everything sent to the model for one iteration.
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    pub system: &'a str,
    /// Rendered user prompt; already embeds the context bundle.
    pub prompt: &'a str,
    pub context: &'a ContextBundle,
}

/// Abstraction over inference backends.
pub trait ModelClient {
    /// Send one request and return the raw completion text.
    fn invoke(&self, request: &ModelRequest<'_>) -> Result<String, TransportError>;
}

/// Client for OpenAI-compatible `/v1/chat/completions` endpoints.
pub struct ChatCompletionsClient {
    http: reqwest::blocking::Client,
    endpoint: String,
    settings: ModelConfig,
    response_schema: Value,
}

impl ChatCompletionsClient {
    pub fn new(settings: &ModelConfig) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .context("build http client")?;
        let response_schema: Value =
            serde_json::from_str(RESPONSE_SCHEMA).context("parse response schema")?;
        Ok(Self {
            http,
            endpoint: format!(
                "{}/v1/chat/completions",
                normalize_api_base(&settings.api_base)
            ),
            settings: settings.clone(),
            response_schema,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request_body(&self, request: &ModelRequest<'_>) -> Value {
        let mut body = json!({
            "model": self.settings.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.prompt },
            ],
            "temperature": self.settings.temperature,
            "max_tokens": self.settings.max_tokens,
        });
        if self.settings.structured_output {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "evolve_response",
                    "schema": self.response_schema,
                },
            });
        }
        body
    }

    fn send_once(&self, body: &Value) -> Result<String, TransportError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(body)
            .send()
            .map_err(|err| self.classify(err))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(TransportError::Status {
                url: self.endpoint.clone(),
                status: status.as_u16(),
                body: excerpt(&text, BODY_EXCERPT_BYTES),
            });
        }

        let payload: Value = response
            .json()
            .map_err(|err| TransportError::Envelope(format!("body is not JSON: {err}")))?;
        extract_completion_text(&payload)
    }

    fn classify(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout {
                url: self.endpoint.clone(),
                timeout_secs: self.settings.timeout_secs,
            }
        } else {
            TransportError::Connect {
                url: self.endpoint.clone(),
                message: err.to_string(),
            }
        }
    }
}

impl ModelClient for ChatCompletionsClient {
    #[instrument(skip_all, fields(endpoint = %self.endpoint, model = %self.settings.model))]
    fn invoke(&self, request: &ModelRequest<'_>) -> Result<String, TransportError> {
        let body = self.request_body(request);
        let mut retries_left = self.settings.retries;
        loop {
            info!(prompt_bytes = request.prompt.len(), "sending completion request");
            match self.send_once(&body) {
                Ok(text) => {
                    debug!(bytes = text.len(), "completion received");
                    return Ok(text);
                }
                Err(err) if err.is_retryable() && retries_left > 0 => {
                    retries_left -= 1;
                    warn!(err = %err, retries_left, "retrying completion request");
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Pull the completion text out of a chat-completions payload.
///
/// Falls back from `message.content` to the first tool call's arguments and
/// then to legacy `text`.
pub fn extract_completion_text(payload: &Value) -> Result<String, TransportError> {
    let choice = payload
        .get("choices")
        .and_then(|choices| choices.get(0))
        .filter(|choice| choice.is_object())
        .ok_or_else(|| TransportError::Envelope("missing choices[0]".to_string()))?;

    let message = choice.get("message");
    let candidates = [
        message.and_then(|m| m.get("content")),
        message
            .and_then(|m| m.get("tool_calls"))
            .and_then(|calls| calls.get(0))
            .and_then(|call| call.get("function"))
            .and_then(|function| function.get("arguments")),
        choice.get("text"),
    ];
    candidates
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|text| !text.is_empty())
        .map(str::to_string)
        .ok_or_else(|| TransportError::Envelope("empty completion content".to_string()))
}

fn normalize_api_base(api_base: &str) -> &str {
    api_base.trim().trim_end_matches('/')
}

fn excerpt(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.trim().to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated {} bytes]", &text[..end], text.len() - end)
}
