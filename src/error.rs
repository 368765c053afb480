//! Error types for the midstream middleware

use std::time::Duration;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the middleware.
///
/// Backend failures are classified into these kinds exactly once, at the
/// transport boundary; the core never re-inspects raw provider errors.
/// Cancellation is intentionally absent: an aborted `stream()` call
/// returns an [`AbortedResponse`](crate::AbortedResponse) through the
/// normal return path instead of raising.
#[derive(Error, Debug)]
pub enum Error {
    /// Provider rejected the request due to rate limiting (retryable).
    /// May carry a retry-after hint from the provider.
    #[error("rate limited: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Authentication or authorization failure (not retryable)
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Request exceeds the model's context window (not retryable)
    #[error("context length exceeded: {0}")]
    ContextLength(String),

    /// Provider-side 5xx failure (retryable)
    #[error("server error: {0}")]
    Server(String),

    /// Connection-level failure (retryable)
    #[error("network error: {0}")]
    Network(String),

    /// A backend round-trip exceeded the per-iteration timeout (retryable)
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The tool handler broke its contract (programmer error, not retryable)
    #[error("tool handler returned invalid results: {0}")]
    BadHandlerReturn(String),

    /// Invalid configuration or request construction
    #[error("invalid configuration: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unclassified failure (not retryable by default)
    #[error("{0}")]
    Unknown(String),
}

impl Error {
    /// Create a rate-limit error with an optional retry-after hint
    pub fn rate_limit(msg: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Error::RateLimit {
            message: msg.into(),
            retry_after,
        }
    }

    /// Create an authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Error::Auth(msg.into())
    }

    /// Create a context-length error
    pub fn context_length(msg: impl Into<String>) -> Self {
        Error::ContextLength(msg.into())
    }

    /// Create a server error
    pub fn server(msg: impl Into<String>) -> Self {
        Error::Server(msg.into())
    }

    /// Create a network error
    pub fn network(msg: impl Into<String>) -> Self {
        Error::Network(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(elapsed: Duration) -> Self {
        Error::Timeout(elapsed)
    }

    /// Create a bad-handler-return error
    pub fn bad_handler_return(msg: impl Into<String>) -> Self {
        Error::BadHandlerReturn(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create an unclassified error
    pub fn unknown(msg: impl Into<String>) -> Self {
        Error::Unknown(msg.into())
    }

    /// Whether this error kind is worth retrying.
    ///
    /// Rate limits, server failures, network failures and timeouts are
    /// transient; everything else is deterministic and retrying would only
    /// repeat the failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RateLimit { .. } | Error::Server(_) | Error::Network(_) | Error::Timeout(_)
        )
    }

    /// Retry-after hint, when the provider supplied one
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
