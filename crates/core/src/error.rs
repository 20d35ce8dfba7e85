//! Error types for the juris domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each collaborator boundary has its own error enum; the orchestrator
//! decides which of them are retried, degraded, or turned into a fallback.

use thiserror::Error;

/// The top-level error type for all juris operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Retrieval errors ---
    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    // --- Reasoning engine errors ---
    #[error("Reasoning engine error: {0}")]
    Engine(#[from] EngineError),

    // --- Session errors ---
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures of the vector-search collaborator.
///
/// `Unavailable` and `Timeout` are recoverable: the caller may retry with
/// backoff or continue without retrieval.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RetrievalError {
    #[error("Retrieval service unavailable: {0}")]
    Unavailable(String),

    #[error("Retrieval timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Invalid retrieval query: {0}")]
    InvalidQuery(String),
}

impl RetrievalError {
    /// Whether a retry (possibly with smaller parameters) makes sense.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout { .. })
    }
}

/// Failures of the reasoning engine collaborator.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("API request failed: {message} (status: {status_code})")]
    Api { status_code: u16, message: String },

    #[error("Rate limited by engine, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Engine not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid engine response: {0}")]
    InvalidResponse(String),
}

/// Failures of the conversation state store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session {0} is busy with another request")]
    Busy(String),

    #[error("Session not found: {0}")]
    NotFound(String),
}
