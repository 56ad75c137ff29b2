//! Captured exchange and usage record data models.

use std::time::Duration;

use opentelemetry::{KeyValue, Value as AttributeValue};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Span attribute keys carrying a captured exchange.
pub mod attributes {
    pub const URL: &str = "http.url";
    pub const METHOD: &str = "http.method";
    pub const STATUS_CODE: &str = "http.status_code";
    pub const REQUEST_HEADERS: &str = "http.request.headers";
    pub const REQUEST_BODY: &str = "http.request.body";
    pub const RESPONSE_HEADERS: &str = "http.response.headers";
    pub const RESPONSE_BODY: &str = "http.response.body";
    /// Set when `http.response.body` holds base64-encoded gzip bytes
    pub const RESPONSE_BODY_COMPRESSED: &str = "http.response.body.compressed";
}

/// One outgoing HTTP round trip as seen by the capture layer or a span.
///
/// Headers are JSON objects serialized to text: each value is a string, or an array of
/// strings when the header was repeated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapturedExchange {
    pub method: String,
    pub url: String,
    pub status: Option<u16>,
    pub request_headers: String,
    pub request_body: String,
    pub response_headers: String,
    pub response_body: String,
    pub response_compressed: bool,
    pub duration: Duration,
}

impl CapturedExchange {
    /// Rebuilds an exchange from span attributes. Missing attributes are left empty.
    pub fn from_attributes(attributes: &[KeyValue], duration: Duration) -> Self {
        let mut exchange = CapturedExchange {
            duration,
            ..Default::default()
        };

        for kv in attributes {
            match kv.key.as_str() {
                attributes::URL => exchange.url = kv.value.as_str().into_owned(),
                attributes::METHOD => exchange.method = kv.value.as_str().into_owned(),
                attributes::STATUS_CODE => exchange.status = attribute_as_u16(&kv.value),
                attributes::REQUEST_HEADERS => exchange.request_headers = kv.value.as_str().into_owned(),
                attributes::REQUEST_BODY => exchange.request_body = kv.value.as_str().into_owned(),
                attributes::RESPONSE_HEADERS => exchange.response_headers = kv.value.as_str().into_owned(),
                attributes::RESPONSE_BODY => exchange.response_body = kv.value.as_str().into_owned(),
                attributes::RESPONSE_BODY_COMPRESSED => exchange.response_compressed = attribute_as_bool(&kv.value),
                _ => {}
            }
        }

        exchange
    }
}

fn attribute_as_u16(value: &AttributeValue) -> Option<u16> {
    match value {
        AttributeValue::I64(n) => u16::try_from(*n).ok(),
        AttributeValue::F64(n) => u16::try_from(*n as i64).ok(),
        AttributeValue::String(s) => s.as_str().trim().parse().ok(),
        _ => None,
    }
}

fn attribute_as_bool(value: &AttributeValue) -> bool {
    match value {
        AttributeValue::Bool(b) => *b,
        AttributeValue::String(s) => s.as_str().eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// A chat message from a completion request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Any other fields, e.g. `function_call` or `tool_calls`
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Value::String(content.into()),
            name: None,
            extra: Map::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// The flat record delivered to the logging endpoint for one exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Completion id assigned by the provider, empty when the response carried none
    pub provider_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub url: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub streamed: bool,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// SHA-256 hex digest of the bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashed_key: Option<String>,
    pub completion: String,
    /// Request headers with `Authorization` removed
    pub request_headers: String,
    pub request_body: String,
    pub response_headers: String,
    /// Response body exactly as captured (still encoded when compressed)
    pub response_body: String,
    pub duration_in_ms: f64,
}
