//! Common error types for Stowage.

use thiserror::Error;

/// Top-level error type for Stowage operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Entry, archive, node or public handle does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists and the backend disallows duplicates.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Operation attempted in a state that does not allow it
    /// (logged-out client, cyclic or unnamed entry chain).
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Integrity verification failed.
    #[error("Corrupt data: {0}")]
    CorruptData(String),

    /// Backend is rate limiting or temporarily unavailable.
    #[error("Transient error: {0}")]
    Transient(String),

    /// Operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// Backend does not offer this capability.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// A polling budget was exhausted before the awaited state was reached.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Credentials were rejected.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Access to the resource was refused.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Transport-level failure.
    #[error("Network error: {0}")]
    Network(String),

    /// Cryptographic operation failed.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::Network(_))
    }

    /// Whether this error reports caller cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Prefix the message with the provider and entry path it concerns.
    ///
    /// `Cancelled` and `Io` are returned unchanged.
    pub fn at(self, provider: &str, path: &str) -> Self {
        let prefix = |msg: String| format!("{}:{}: {}", provider, path, msg);
        match self {
            Error::NotFound(m) => Error::NotFound(prefix(m)),
            Error::AlreadyExists(m) => Error::AlreadyExists(prefix(m)),
            Error::InvalidState(m) => Error::InvalidState(prefix(m)),
            Error::CorruptData(m) => Error::CorruptData(prefix(m)),
            Error::Transient(m) => Error::Transient(prefix(m)),
            Error::NotSupported(m) => Error::NotSupported(prefix(m)),
            Error::Timeout(m) => Error::Timeout(prefix(m)),
            Error::InvalidInput(m) => Error::InvalidInput(prefix(m)),
            Error::Authentication(m) => Error::Authentication(prefix(m)),
            Error::PermissionDenied(m) => Error::PermissionDenied(prefix(m)),
            Error::Network(m) => Error::Network(prefix(m)),
            Error::Crypto(m) => Error::Crypto(prefix(m)),
            Error::Serialization(m) => Error::Serialization(prefix(m)),
            other @ (Error::Cancelled | Error::Io(_)) => other,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_prefixes_message() {
        let err = Error::NotFound("no such archive".to_string()).at("glacier", "a/b.txt");
        assert_eq!(err.to_string(), "Not found: glacier:a/b.txt: no such archive");
    }

    #[test]
    fn test_at_keeps_cancelled() {
        assert!(Error::Cancelled.at("s3", "x").is_cancelled());
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::Transient("503".to_string()).is_transient());
        assert!(Error::Network("reset".to_string()).is_transient());
        assert!(!Error::NotFound("x".to_string()).is_transient());
        assert!(!Error::Cancelled.is_transient());
    }
}
