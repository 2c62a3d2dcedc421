//! Common error types for Keyward.

use std::time::Duration;
use thiserror::Error;

/// Fixed message used for every authentication failure.
///
/// Wrong passphrase, failed tag check and failed verifier all produce this
/// exact text so callers cannot tell which check rejected the attempt.
pub const AUTHENTICATION_FAILED: &str = "invalid passphrase or corrupted data";

/// Top-level error type for Keyward operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input or parameters.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Wrong passphrase or failed integrity check.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Malformed container or document.
    #[error("Corrupted data: {0}")]
    Corruption(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Remote storage operation failed.
    #[error("Network error: {0}")]
    Network(String),

    /// A remote call exceeded its deadline.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Unlock attempts are blocked until the lockout window lapses.
    #[error("Too many failed attempts; retry in {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    /// Local and remote copies diverged and were not resolved automatically.
    #[error("Sync conflict: {conflicts} diverged field(s)")]
    Conflict { conflicts: usize },

    /// The session is locked or expired.
    #[error("Session is locked")]
    Locked,

    /// The operation was cancelled by the caller or by a session lock.
    #[error("Operation cancelled")]
    Cancelled,

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cryptographic primitive misuse (bad key length and similar).
    #[error("Cryptographic error: {0}")]
    Crypto(String),
}

impl Error {
    /// Authentication failure with the fixed, non-revealing message.
    pub fn authentication() -> Self {
        Error::Authentication(AUTHENTICATION_FAILED.to_string())
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Network(_) | Error::Timeout(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
