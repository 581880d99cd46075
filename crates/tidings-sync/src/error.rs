//! Error types for the sync engine.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors raised by a pub/sub transport.
///
/// These never reach the UI per event: the connection lifecycle recovers
/// from them by reconnecting and resubscribing.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connect handshake failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// A frame could not be queued because the connection is gone.
    #[error("not connected")]
    NotConnected,

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The credential could not be attached to the handshake.
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
}

/// Errors returned by the REST collaborator.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request was rejected as invalid (400, 422).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The session may not perform this operation (401, 403).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The target does not exist on the server (404).
    #[error("not found: {0}")]
    NotFound(String),

    /// The write conflicts with server state (409).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Any other non-success status.
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// HTTP request failed before a response arrived.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The configured base URL cannot carry request paths.
    #[error("invalid API url: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    /// Classify a non-success response by status code.
    ///
    /// `body` may be an RFC 7807 problem document, in which case its
    /// `detail` (or `title`) becomes the message.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = problem_detail(body).unwrap_or_else(|| body.trim().to_string());
        match status {
            400 | 422 => ApiError::Validation(message),
            401 | 403 => ApiError::Unauthorized(message),
            404 => ApiError::NotFound(message),
            409 => ApiError::Conflict(message),
            _ => ApiError::Server { status, message },
        }
    }
}

/// Subset of an RFC 7807 problem document.
#[derive(Debug, Deserialize)]
struct ProblemDetails {
    #[serde(default)]
    title: String,
    #[serde(default)]
    detail: Option<String>,
}

/// Pull a user-facing message out of a problem+json body.
/// Prefers `detail`, falls back to `title`.
fn problem_detail(body: &str) -> Option<String> {
    let parsed = serde_json::from_str::<ProblemDetails>(body).ok()?;
    if let Some(detail) = parsed.detail
        && !detail.trim().is_empty()
    {
        return Some(detail);
    }
    if !parsed.title.trim().is_empty() {
        return Some(parsed.title);
    }
    None
}

/// Errors decoding an inbound publication.
#[derive(Debug, Error)]
pub enum EventError {
    /// The payload is not valid JSON or does not match the event's shape.
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The `type` tag is not one this client understands.
    #[error("unknown event type: {0}")]
    UnknownType(String),
}

/// Errors surfaced to the originator of a mutation.
///
/// Every variant except `UnknownTarget` and `NotAuthenticated` means an
/// optimistic change was applied and has since been rolled back.
#[derive(Debug, Error)]
pub enum MutationError {
    /// The server rejected the write.
    #[error("mutation rejected: {0}")]
    Rejected(#[from] ApiError),

    /// No server response arrived in time.
    #[error("mutation timed out after {}ms", after.as_millis())]
    TimedOut { after: Duration },

    /// The target entity is not in the cache.
    #[error("unknown target: {id}")]
    UnknownTarget { id: String },

    /// No session is active.
    #[error("not authenticated")]
    NotAuthenticated,

    /// The engine was stopped while the mutation was in flight.
    #[error("mutation cancelled by teardown")]
    Cancelled,
}

/// Invalid engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The app id is empty.
    #[error("app id must not be empty")]
    EmptyAppId,

    /// The app id contains the topic separator.
    #[error("app id must not contain ':' (got {0:?})")]
    InvalidAppId(String),

    /// A duration setting is zero.
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    /// Backoff would shrink instead of grow.
    #[error("backoff multiplier must be at least 1.0 (got {0})")]
    InvalidBackoff(f64),
}

/// Top-level error for engine operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// REST error outside a mutation.
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// Mutation error.
    #[error("mutation error: {0}")]
    Mutation(#[from] MutationError),

    /// Event decode error.
    #[error("event error: {0}")]
    Event(#[from] EventError),

    /// The engine has no active session.
    #[error("engine not started")]
    NotStarted,
}
