//! Per-request HTTP envelope validation.
//!
//! Every check runs before a message reaches a session; a failure
//! short-circuits into a JSON-RPC error body with `id: null` and the
//! matching HTTP status.

use axum::{
    Json,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};

use super::http_header::{EVENT_STREAM_MIME_TYPE, HEADER_SESSION_ID, JSON_MIME_TYPE};
use crate::{
    error::ErrorData,
    model::{ClientPayload, JsonRpcMessage},
};

/// Maximum accepted request body: 4 MiB.
pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// An envelope violation: HTTP status plus the JSON-RPC error to emit.
#[derive(Debug)]
pub struct EnvelopeError {
    pub status: StatusCode,
    pub error: ErrorData,
}

impl EnvelopeError {
    pub fn new(status: StatusCode, error: ErrorData) -> Self {
        Self { status, error }
    }

    pub fn method_not_allowed() -> Self {
        Self::new(
            StatusCode::METHOD_NOT_ALLOWED,
            ErrorData::bad_request("Method not allowed"),
        )
    }

    pub fn not_acceptable(message: &'static str) -> Self {
        Self::new(StatusCode::NOT_ACCEPTABLE, ErrorData::bad_request(message))
    }

    pub fn unsupported_media_type() -> Self {
        Self::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ErrorData::bad_request("Content-Type must be application/json"),
        )
    }

    pub fn payload_too_large() -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            ErrorData::bad_request("Request body exceeds maximum size"),
        )
    }

    pub fn parse(message: &'static str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorData::parse_error(message))
    }

    pub fn invalid_request(message: &'static str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorData::invalid_request(message))
    }

    pub fn missing_session() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            ErrorData::bad_request("Missing mcp-session-id header"),
        )
    }

    pub fn session_not_found() -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            ErrorData::session_not_found("Session not found"),
        )
    }

    pub fn session_not_initialized() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            ErrorData::session_not_found("Session not initialized"),
        )
    }
}

impl IntoResponse for EnvelopeError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(JsonRpcMessage::error(None, self.error)),
        )
            .into_response()
    }
}

/// Whether the endpoint tracks sessions across requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPolicy {
    Stateful,
    Stateless,
}

/// A POST body that passed every envelope check.
#[derive(Debug)]
pub struct ValidatedPost {
    pub messages: Vec<JsonRpcMessage>,
    pub has_initialize: bool,
    pub session_id: Option<String>,
}

pub fn session_id_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(HEADER_SESSION_ID)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

fn accept_includes(headers: &HeaderMap, mime: &str) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains(mime))
}

/// Content-Length gate, checked before the body is even looked at.
fn check_declared_length(headers: &HeaderMap) -> Result<(), EnvelopeError> {
    if let Some(length) = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok())
        && length > MAX_BODY_BYTES
    {
        return Err(EnvelopeError::payload_too_large());
    }
    Ok(())
}

/// Run the full POST check sequence for the streamable endpoint.
pub fn validate_post(
    headers: &HeaderMap,
    body: &[u8],
    policy: SessionPolicy,
) -> Result<ValidatedPost, EnvelopeError> {
    if !(accept_includes(headers, JSON_MIME_TYPE)
        && accept_includes(headers, EVENT_STREAM_MIME_TYPE))
    {
        return Err(EnvelopeError::not_acceptable(
            "Accept must include application/json and text/event-stream",
        ));
    }

    let content_type_ok = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|content_type| content_type.contains(JSON_MIME_TYPE));
    if !content_type_ok {
        return Err(EnvelopeError::unsupported_media_type());
    }

    check_declared_length(headers)?;
    if body.len() > MAX_BODY_BYTES {
        return Err(EnvelopeError::payload_too_large());
    }

    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|_| EnvelopeError::parse("Invalid JSON"))?;
    let payload: ClientPayload = serde_json::from_value(value)
        .map_err(|_| EnvelopeError::parse("Invalid JSON-RPC message"))?;

    if payload.is_empty() {
        return Err(EnvelopeError::invalid_request("Empty batch"));
    }

    let has_initialize = payload.contains_initialize();
    let session_id = session_id_header(headers);

    if has_initialize && payload.len() > 1 {
        return Err(EnvelopeError::invalid_request(
            "initialize must be the only message in its batch",
        ));
    }

    match policy {
        SessionPolicy::Stateless => {
            if session_id.is_some() {
                return Err(EnvelopeError::invalid_request(
                    "mcp-session-id is not accepted here",
                ));
            }
        }
        SessionPolicy::Stateful => {
            if has_initialize && session_id.is_some() {
                return Err(EnvelopeError::invalid_request(
                    "initialize must not carry mcp-session-id",
                ));
            }
            if !has_initialize && session_id.is_none() {
                return Err(EnvelopeError::missing_session());
            }
        }
    }

    Ok(ValidatedPost {
        messages: payload.into_messages(),
        has_initialize,
        session_id,
    })
}

/// GET listener check: the client must accept an event stream.
pub fn validate_sse_accept(headers: &HeaderMap) -> Result<(), EnvelopeError> {
    if accept_includes(headers, EVENT_STREAM_MIME_TYPE) {
        Ok(())
    } else {
        Err(EnvelopeError::not_acceptable(
            "Accept must include text/event-stream",
        ))
    }
}

/// Parse a single JSON-RPC message from a legacy message-endpoint POST.
pub fn parse_single_message(body: &[u8]) -> Result<JsonRpcMessage, EnvelopeError> {
    serde_json::from_slice(body).map_err(|_| EnvelopeError::parse("Invalid JSON-RPC message"))
}
