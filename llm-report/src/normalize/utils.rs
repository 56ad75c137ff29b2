//! Body decoding and header helpers used by the normalizer.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use flate2::read::GzDecoder;
use serde_json::{Map, Value};
use std::io::Read as _;
use thiserror::Error;

use crate::errors::Error as ReportError;

/// Errors that can occur while undoing the base64 + gzip encoding of a response body
#[derive(Debug, Error)]
pub(crate) enum DecodeError {
    #[error("Body is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Body is not valid gzip: {0}")]
    Gzip(#[from] std::io::Error),
}

/// Reverses the capture-side encoding of a compressed response: base64, then gzip.
pub(crate) fn decompress_body(body: &str) -> Result<String, DecodeError> {
    let compressed = BASE64_STANDARD.decode(body.trim())?;
    let mut decompressed = String::new();
    GzDecoder::new(compressed.as_slice()).read_to_string(&mut decompressed)?;
    Ok(decompressed)
}

/// Parse a Server-Sent Events string into a vector of data payloads
///
/// Events are separated by blank lines (LF or CRLF). Within an event, `data:` lines are
/// joined with newlines; other fields (`event:`, `id:`, comments) are ignored.
///
/// # Errors
/// - `ReportError::InvalidEventStream` if no data fields are found
pub(crate) fn parse_sse_chunks(body_str: &str) -> Result<Vec<String>, ReportError> {
    let mut chunks = Vec::new();
    let mut current_event_data: Option<String> = None;

    for line in body_str.lines() {
        let trimmed = line.trim();

        // Handle both "data: value" and "data:value" formats
        if let Some(data_part) = trimmed.strip_prefix("data:") {
            let data_part = data_part.strip_prefix(' ').unwrap_or(data_part);
            match current_event_data.as_mut() {
                Some(data) => {
                    data.push('\n');
                    data.push_str(data_part);
                }
                None => current_event_data = Some(data_part.to_string()),
            }
        } else if trimmed.is_empty()
            && let Some(data) = current_event_data.take()
        {
            chunks.push(data);
        }
    }

    // Process any remaining data (in case the stream doesn't end with empty line)
    if let Some(data) = current_event_data {
        chunks.push(data);
    }

    if chunks.is_empty() {
        return Err(ReportError::InvalidEventStream);
    }

    Ok(chunks)
}

/// Drops the terminal `[DONE]` sentinel and parses the remaining frames as JSON.
///
/// # Errors
/// - `ReportError::MalformedFrame` for the first frame that is not valid JSON
/// - `ReportError::InvalidEventStream` if there are no frames besides the sentinel
pub(crate) fn parse_sse_frames(chunks: Vec<String>) -> Result<Vec<Value>, ReportError> {
    let frames = chunks
        .into_iter()
        .filter(|chunk| chunk.trim() != "[DONE]")
        .enumerate()
        .map(|(index, chunk)| serde_json::from_str::<Value>(&chunk).map_err(|source| ReportError::MalformedFrame { index, source }))
        .collect::<Result<Vec<_>, _>>()?;

    if frames.is_empty() {
        return Err(ReportError::InvalidEventStream);
    }

    Ok(frames)
}

/// A header value as captured: a plain string, or the first entry of an array.
fn header_value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(values) => values.first().and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn find_header_key(headers: &Map<String, Value>, header_name: &str) -> Option<String> {
    headers.keys().find(|key| key.eq_ignore_ascii_case(header_name)).cloned()
}

/// Extracts a header value as a string, matching the name case-insensitively.
///
/// # Returns
/// * `Some(String)` - The string value, or the first element of an array value
/// * `None` - Header missing, empty, or not a string
pub(crate) fn extract_header_as_string(headers: &Map<String, Value>, header_name: &str) -> Option<String> {
    let key = find_header_key(headers, header_name)?;
    headers
        .get(&key)
        .and_then(header_value_as_string)
        .filter(|s| !s.is_empty())
}

/// Removes every spelling of a header and returns the first usable value.
///
/// Headers are removed even when their value is unusable.
pub(crate) fn take_header_as_string(headers: &mut Map<String, Value>, header_name: &str) -> Option<String> {
    let keys: Vec<String> = headers.keys().filter(|key| key.eq_ignore_ascii_case(header_name)).cloned().collect();
    keys.iter()
        .filter_map(|key| headers.remove(key))
        .fold(None, |found, value| found.or_else(|| header_value_as_string(&value)))
}
