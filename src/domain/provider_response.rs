//! Provider response model
//!
//! The scraping provider answers in several shapes depending on endpoint and
//! mood: a JSON object, a one-element array, a bare index id, or nothing at
//! all. Each shape has its own parser; they are tried in a fixed order and
//! the first match wins.

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Longest error body kept in a parsed `Error` message
const MAX_ERROR_MESSAGE_LEN: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub status_id: i64,
    pub description: Option<String>,
    pub index_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParsedResponse {
    Structured(ProviderStatus),
    IndexOnly(i64),
    Empty,
    Error {
        http_status: u16,
        index_id: Option<i64>,
        message: String,
    },
}

impl ParsedResponse {
    pub const fn index_id(&self) -> Option<i64> {
        match self {
            Self::Structured(status) => status.index_id,
            Self::IndexOnly(id) => Some(*id),
            Self::Error { index_id, .. } => *index_id,
            Self::Empty => None,
        }
    }

    pub const fn status_id(&self) -> Option<i64> {
        match self {
            Self::Structured(status) => Some(status.status_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResponseFormatError {
    #[error("unexpected provider response format: {body}")]
    Unexpected { body: String },
}

#[derive(Debug, Deserialize)]
struct RawStatus {
    #[serde(
        default,
        alias = "StatusId",
        alias = "statusId",
        deserialize_with = "lenient_i64"
    )]
    status_id: Option<i64>,
    #[serde(default, alias = "Status")]
    status: Option<serde_json::Value>,
    #[serde(
        default,
        alias = "IndexId",
        alias = "indexId",
        deserialize_with = "lenient_i64"
    )]
    index_id: Option<i64>,
}

/// Accepts `123`, `"123"` or `null`.
fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }))
}

fn parse_empty(body: &str) -> Option<ParsedResponse> {
    let trimmed = body.trim();
    (trimmed.is_empty() || trimmed == "null" || trimmed == "\"\"").then_some(ParsedResponse::Empty)
}

fn parse_object(body: &str) -> Option<ParsedResponse> {
    let trimmed = body.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let raw: RawStatus = serde_json::from_str(trimmed).ok()?;
    let description = raw.status.and_then(|v| match v {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    });

    match (raw.status_id, raw.index_id) {
        (Some(status_id), index_id) => Some(ParsedResponse::Structured(ProviderStatus {
            status_id,
            description,
            index_id,
        })),
        (None, Some(index_id)) => Some(ParsedResponse::IndexOnly(index_id)),
        (None, None) => None,
    }
}

fn parse_array(body: &str) -> Option<ParsedResponse> {
    let trimmed = body.trim();
    if !trimmed.starts_with('[') {
        return None;
    }
    let items: Vec<serde_json::Value> = serde_json::from_str(trimmed).ok()?;
    match items.as_slice() {
        [single] => {
            let inner = single.to_string();
            parse_object(&inner).or_else(|| parse_integer(&inner))
        }
        _ => None,
    }
}

fn parse_integer(body: &str) -> Option<ParsedResponse> {
    let trimmed = body.trim().trim_matches('"');
    trimmed.parse::<i64>().ok().map(ParsedResponse::IndexOnly)
}

/// Runs the shape parsers in priority order.
fn parse_shape(body: &str) -> Option<ParsedResponse> {
    parse_empty(body)
        .or_else(|| parse_object(body))
        .or_else(|| parse_array(body))
        .or_else(|| parse_integer(body))
}

fn truncate(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= MAX_ERROR_MESSAGE_LEN {
        return trimmed.to_string();
    }
    let mut end = MAX_ERROR_MESSAGE_LEN;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}

/// Interprets a provider reply.
///
/// Non-2xx replies always parse, as `Error`, with any index id the body
/// carries. A 2xx body that matches no known shape is a format error.
pub fn parse_response(http_status: u16, body: &str) -> Result<ParsedResponse, ResponseFormatError> {
    if !(200..300).contains(&http_status) {
        let index_id = parse_shape(body).and_then(|parsed| parsed.index_id());
        let message = if body.trim().is_empty() {
            format!("HTTP {http_status}")
        } else {
            truncate(body)
        };
        return Ok(ParsedResponse::Error {
            http_status,
            index_id,
            message,
        });
    }

    parse_shape(body).ok_or_else(|| ResponseFormatError::Unexpected {
        body: body.to_string(),
    })
}
