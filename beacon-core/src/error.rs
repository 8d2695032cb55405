//! Error types for beacon-core

use thiserror::Error;

/// Main error type for the beacon-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport error surfaced outside of a task completion
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Result type alias for beacon-core
pub type Result<T> = std::result::Result<T, Error>;

/// Failure delivered to a task's completion.
///
/// The dispatch queue never inspects these; it forwards whatever the
/// transport produced.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The queue dispatched a task before any transport was configured
    #[error("no transport configured")]
    NotConfigured,

    /// The request could not be turned into an HTTP request
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Connection-level failure
    #[error("network error: {0}")]
    Network(String),

    /// The request did not complete within the configured timeout
    #[error("request timed out")]
    Timeout,

    /// The server answered with a status the request does not accept
    #[error("server returned {code}: {message}")]
    Status { code: u16, message: String },

    /// The response body could not be decoded
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// The task was discarded before it was sent
    #[error("request cancelled")]
    Cancelled,
}

impl TransportError {
    /// Whether resubmitting the same request may succeed.
    ///
    /// Network failures, timeouts and 5xx responses are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network(_) | TransportError::Timeout => true,
            TransportError::Status { code, .. } => (500..600).contains(code),
            _ => false,
        }
    }
}
