//! Normalization of a captured exchange into a [`UsageRecord`].
//!
//! The response body arrives in one of two encodings: a single JSON document, or a
//! server-sent event stream of incremental chunks. Either may additionally be gzip
//! compressed and base64 encoded by the capture stage. Token usage comes from the
//! response's `usage` block when present and is estimated from the request messages
//! otherwise.

mod utils;

use std::borrow::Cow;

use serde::de::IgnoredAny;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::DEFAULT_USER_ID_HEADER;
use crate::errors::Error;
use crate::models::{CapturedExchange, ChatMessage, UsageRecord};
use crate::tokens::{self, DEFAULT_MODEL};

const AUTHORIZATION_HEADER: &str = "Authorization";

/// A parsed response body: the reference JSON object plus the assembled completion text.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    /// The whole document, or the last frame of an event stream
    pub body: Value,
    pub completion: String,
    pub streamed: bool,
}

/// The fields of a completion request body that matter for usage accounting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedRequest {
    pub model: String,
    pub stream: bool,
    pub messages: Option<Vec<ChatMessage>>,
}

/// Normalizes `exchange` reading the user id from the default `X-User-Id` header.
pub fn normalize(exchange: &CapturedExchange) -> Result<UsageRecord, Error> {
    normalize_with_user_header(exchange, DEFAULT_USER_ID_HEADER)
}

/// Turns one captured exchange into one usage record.
///
/// # Errors
/// Unparseable request headers, request body or response body abort the whole exchange.
/// Decompression failures and missing optional fields do not.
pub fn normalize_with_user_header(exchange: &CapturedExchange, user_id_header: &str) -> Result<UsageRecord, Error> {
    let body_text = decode_response_body(&exchange.response_body, exchange.response_compressed);
    let response = parse_response_body(&body_text)?;

    let mut request_headers = parse_headers(&exchange.request_headers)?;
    // strip the key before the headers are stored anywhere
    let authorization = utils::take_header_as_string(&mut request_headers, AUTHORIZATION_HEADER);
    let user_id = utils::extract_header_as_string(&request_headers, user_id_header);

    let request = parse_request_body(&exchange.request_body)?;
    let (prompt_tokens, completion_tokens) = token_usage(&response, &request)?;

    let request_headers = serde_json::to_string(&request_headers).map_err(Error::json("request headers"))?;

    Ok(UsageRecord {
        provider_id: response.body.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
        user_id,
        url: exchange.url.clone(),
        method: exchange.method.clone(),
        status: exchange.status,
        streamed: request.stream,
        model: request.model,
        prompt_tokens,
        completion_tokens,
        hashed_key: authorization.as_deref().and_then(hash_bearer_token),
        completion: response.completion,
        request_headers,
        request_body: exchange.request_body.clone(),
        response_headers: exchange.response_headers.clone(),
        response_body: exchange.response_body.clone(),
        duration_in_ms: exchange.duration.as_secs_f64() * 1000.0,
    })
}

/// Undoes base64 + gzip when the body is flagged compressed or is not plain JSON.
///
/// Falls back to the body as given when decoding fails.
pub fn decode_response_body(body: &str, compressed: bool) -> Cow<'_, str> {
    if !compressed && serde_json::from_str::<IgnoredAny>(body).is_ok() {
        return Cow::Borrowed(body);
    }

    match utils::decompress_body(body) {
        Ok(decompressed) => Cow::Owned(decompressed),
        Err(e) => {
            if compressed {
                debug!(error = %e, "Response flagged compressed but could not be decompressed, using it as is");
            }
            Cow::Borrowed(body)
        }
    }
}

/// Parses a response body as one JSON document, falling back to event-stream framing.
pub fn parse_response_body(body: &str) -> Result<ParsedResponse, Error> {
    if let Ok(document) = serde_json::from_str::<Value>(body) {
        let completion = document
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Ok(ParsedResponse {
            body: document,
            completion,
            streamed: false,
        });
    }

    let frames = utils::parse_sse_frames(utils::parse_sse_chunks(body)?)?;

    let completion: String = frames
        .iter()
        .filter_map(|frame| frame.pointer("/choices/0/delta/content").and_then(Value::as_str))
        .collect();

    // earlier frames may lack the id, the final one carries usage when requested
    let body = frames.into_iter().next_back().ok_or(Error::InvalidEventStream)?;

    Ok(ParsedResponse {
        body,
        completion,
        streamed: true,
    })
}

fn parse_headers(headers: &str) -> Result<Map<String, Value>, Error> {
    if headers.trim().is_empty() {
        return Ok(Map::new());
    }
    serde_json::from_str(headers).map_err(Error::json("request headers"))
}

/// Parses the request body. An empty body yields all defaults.
pub fn parse_request_body(body: &str) -> Result<ParsedRequest, Error> {
    if body.trim().is_empty() {
        return Ok(ParsedRequest::default());
    }

    let mut document: Value = serde_json::from_str(body).map_err(Error::json("request body"))?;

    let messages = match document.get_mut("messages").map(Value::take) {
        Some(Value::Null) | None => None,
        Some(messages) => Some(serde_json::from_value::<Vec<ChatMessage>>(messages).map_err(Error::json("request messages"))?),
    };

    Ok(ParsedRequest {
        model: document.get("model").and_then(Value::as_str).unwrap_or_default().to_string(),
        stream: document.get("stream").and_then(Value::as_bool).unwrap_or(false),
        messages,
    })
}

/// Prompt and completion token counts for an exchange.
fn token_usage(response: &ParsedResponse, request: &ParsedRequest) -> Result<(u64, u64), Error> {
    if let Some(usage) = response.body.get("usage").filter(|usage| usage.is_object()) {
        let prompt = usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
        let completion = usage.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0);
        return Ok((prompt, completion));
    }

    let Some(messages) = &request.messages else {
        return Ok((0, 0));
    };

    let model = if request.model.is_empty() { DEFAULT_MODEL } else { &request.model };
    let prompt = match tokens::count_message_tokens(messages, model) {
        Err(Error::UnsupportedModel { model }) => {
            warn!(model = %model, "No token accounting for model, estimating as {DEFAULT_MODEL}");
            tokens::count_message_tokens(messages, DEFAULT_MODEL)?
        }
        other => other?,
    };
    let completion = tokens::count_tokens(&response.completion)?;

    Ok((prompt, completion))
}

/// SHA-256 hex digest of the token in a `<scheme> <token>` Authorization value.
///
/// Returns `None` when there is no token, or the token is the literal `undefined` some
/// JavaScript clients send when the key is unset.
pub fn hash_bearer_token(authorization: &str) -> Option<String> {
    let token = authorization.split(' ').nth(1)?;
    if token.is_empty() || token == "undefined" {
        return None;
    }
    Some(format!("{:x}", Sha256::digest(token.as_bytes())))
}
