//! Validation of raw model output into a [`ModelResponse`].
//!
//! The model is an untrusted source. Its text is parsed into a generic JSON
//! value and checked against the embedded response schema before anything is
//! deserialized, so callers only ever see a complete `ModelResponse` or a
//! classified error.

use std::sync::LazyLock;

use jsonschema::error::ValidationErrorKind;
use jsonschema::{Draft, ValidationError, Validator};
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::core::types::ModelResponse;

/// JSON Schema describing the accepted response shape.
///
/// Compiled once for validation and also sent to endpoints that support
/// structured output.
pub const RESPONSE_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/model_response.schema.json"
));

static RESPONSE_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(RESPONSE_SCHEMA).unwrap();
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .unwrap()
});

/// Why a response was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResponseError {
    /// The text is not a JSON document.
    #[error("response is not valid JSON: {message}")]
    Parse { message: String },
    /// Valid JSON with the wrong shape. `pointer` is a JSON pointer to the
    /// offending value (`/` for the document itself).
    #[error("response does not match schema at {pointer}: {message}")]
    Schema { pointer: String, message: String },
}

impl From<&ValidationError<'_>> for ResponseError {
    fn from(err: &ValidationError<'_>) -> Self {
        let mut pointer = err.instance_path().as_str().to_string();
        // A missing key is reported on its parent object; point at the key.
        if let ValidationErrorKind::Required { property } = err.kind()
            && let Some(name) = property.as_str()
        {
            pointer.push('/');
            pointer.push_str(name);
        }
        if pointer.is_empty() {
            pointer.push('/');
        }
        // Masked so a long desires text is not echoed into the message.
        ResponseError::Schema {
            pointer,
            message: err.masked().to_string(),
        }
    }
}

/// Parse and validate raw model output.
pub fn parse_response(raw: &str) -> Result<ModelResponse, ResponseError> {
    let text = unwrap_code_fence(raw.trim());
    if text.is_empty() {
        return Err(ResponseError::Parse {
            message: "response was empty".to_string(),
        });
    }

    let value: Value = serde_json::from_str(text).map_err(|err| ResponseError::Parse {
        message: err.to_string(),
    })?;
    if let Some(err) = RESPONSE_VALIDATOR.iter_errors(&value).next() {
        return Err(ResponseError::from(&err));
    }
    serde_json::from_value(value).map_err(|err| ResponseError::Schema {
        pointer: "/".to_string(),
        message: err.to_string(),
    })
}

/// Strip one enclosing Markdown code fence, if the whole text is fenced.
fn unwrap_code_fence(text: &str) -> &str {
    static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?s)\A```[A-Za-z0-9_-]*[ \t]*\r?\n(.*?)\r?\n?```\z").unwrap()
    });
    match FENCE_RE.captures(text).and_then(|caps| caps.get(1)) {
        Some(inner) => inner.as_str().trim(),
        None => text,
    }
}
