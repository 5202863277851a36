//! # Envelope Codec
//!
//! Every message on the pipeline's exchanges is wrapped in the same envelope:
//!
//! ```text
//! {"requestId":"r-1","pattern":"execution.algorithm","status":"OK","message":"","content":"{\"argv\":[...]}"}
//! ```
//!
//! `content` is double-encoded: the payload is serialized to a JSON string and that
//! string is the field value, so any payload shape travels transparently. Decoding checks
//! `status` before content is ever exposed; an `ERROR` envelope becomes
//! [`EnvelopeError::Rejected`]. Only the `stage` named in its content survives the
//! rejection, so a failure can still be matched to the stage that reported it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::constants::{STATUS_ERROR, STATUS_OK};

/// Envelope codec errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnvelopeError {
    /// Body is not a JSON envelope at all
    #[error("Malformed envelope: {message}")]
    Malformed { message: String },

    /// Envelope carries a non-OK status
    #[error("Envelope rejected (request {}): {message}", request_id.as_deref().unwrap_or("unknown"))]
    Rejected {
        request_id: Option<String>,
        stage: Option<String>,
        message: String,
    },

    /// Content decoded but does not have the expected shape
    #[error("Invalid {expected} content: {message}")]
    InvalidContent {
        expected: &'static str,
        message: String,
    },

    #[error("Envelope encoding failed: {message}")]
    Encoding { message: String },
}

impl EnvelopeError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    pub fn invalid_content(expected: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidContent {
            expected,
            message: message.into(),
        }
    }

    /// Request the error belongs to, when the envelope named one
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Rejected { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }

    /// Stage a rejected envelope reported for, when its content named one
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::Rejected { stage, .. } => stage.as_deref(),
            _ => None,
        }
    }
}

pub type EnvelopeResult<T> = Result<T, EnvelopeError>;

/// Envelope status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ERROR")]
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => STATUS_OK,
            Self::Error => STATUS_ERROR,
        }
    }
}

/// Wire form with content already stringified
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pattern: Option<&'a str>,
    status: Status,
    message: &'a str,
    content: String,
}

/// Lenient inbound form; `status` is kept raw so unknown values reject instead of failing to parse
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundEnvelope {
    #[serde(default, alias = "requestHash")]
    request_id: Option<String>,
    #[serde(default)]
    pattern: Option<String>,
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    content: Option<Value>,
    #[serde(default)]
    data: Option<Value>,
}

/// A decoded or to-be-encoded envelope
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub request_id: Option<String>,
    pub pattern: Option<String>,
    pub status: Status,
    pub message: String,
    pub content: Value,
}

impl Envelope {
    /// OK envelope carrying `content`
    pub fn ok(message: impl Into<String>, content: Value) -> Self {
        Self {
            request_id: None,
            pattern: None,
            status: Status::Ok,
            message: message.into(),
            content,
        }
    }

    /// ERROR envelope; content is an empty object
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            request_id: None,
            pattern: None,
            status: Status::Error,
            message: message.into(),
            content: Value::Object(Map::new()),
        }
    }

    /// OK envelope from any serializable payload
    pub fn from_payload<T: Serialize>(message: impl Into<String>, payload: &T) -> EnvelopeResult<Self> {
        let content = serde_json::to_value(payload).map_err(|e| EnvelopeError::Encoding {
            message: e.to_string(),
        })?;
        Ok(Self::ok(message, content))
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// Serialize to wire bytes, double-encoding `content`
    pub fn encode(&self) -> EnvelopeResult<Vec<u8>> {
        let content = serde_json::to_string(&self.content).map_err(|e| EnvelopeError::Encoding {
            message: e.to_string(),
        })?;
        let wire = WireEnvelope {
            request_id: self.request_id.as_deref(),
            pattern: self.pattern.as_deref(),
            status: self.status,
            message: &self.message,
            content,
        };
        serde_json::to_vec(&wire).map_err(|e| EnvelopeError::Encoding {
            message: e.to_string(),
        })
    }

    /// Parse wire bytes, rejecting any non-OK status
    ///
    /// Missing or `null` content decodes to an empty object. String content is parsed
    /// as JSON when possible and otherwise kept as the plain string.
    pub fn decode(body: &[u8]) -> EnvelopeResult<Self> {
        let inbound: InboundEnvelope =
            serde_json::from_slice(body).map_err(|e| EnvelopeError::malformed(e.to_string()))?;

        if inbound.status != STATUS_OK {
            let message = match inbound.message {
                Some(m) if !m.is_empty() => m,
                _ => format!("status {}", inbound.status),
            };
            let stage = unwrap_content(inbound.content.or(inbound.data))
                .get("stage")
                .and_then(Value::as_str)
                .map(str::to_string);
            return Err(EnvelopeError::Rejected {
                request_id: inbound.request_id,
                stage,
                message,
            });
        }

        let content = unwrap_content(inbound.content.or(inbound.data));

        Ok(Self {
            request_id: inbound.request_id,
            pattern: inbound.pattern,
            status: Status::Ok,
            message: inbound.message.unwrap_or_default(),
            content,
        })
    }

    /// Deserialize the content into a typed payload
    pub fn content_as<T: DeserializeOwned>(&self, expected: &'static str) -> EnvelopeResult<T> {
        serde_json::from_value(self.content.clone())
            .map_err(|e| EnvelopeError::invalid_content(expected, e.to_string()))
    }
}

/// Undo the double encoding; missing or `null` content becomes an empty object
fn unwrap_content(raw: Option<Value>) -> Value {
    match raw {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(Value::String(raw)) => {
            serde_json::from_str::<Value>(&raw).unwrap_or(Value::String(raw))
        }
        Some(structured) => structured,
    }
}

/// Encode an OK envelope in one call
pub fn encode(status: Status, message: &str, content: &Value) -> EnvelopeResult<Vec<u8>> {
    Envelope {
        request_id: None,
        pattern: None,
        status,
        message: message.to_string(),
        content: content.clone(),
    }
    .encode()
}

/// Decode and return only the content
pub fn decode(body: &[u8]) -> EnvelopeResult<Value> {
    Envelope::decode(body).map(|envelope| envelope.content)
}
