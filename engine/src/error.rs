//! Error types for the Tandem engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All possible errors from the Tandem engine.
///
/// Remote store clients are expected to classify their provider errors into
/// these variants so the retry policy can decide what to do with them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Session errors
    #[error("not authenticated")]
    Unauthenticated,

    // Transient remote errors
    #[error("network unavailable: {0}")]
    Network(String),

    #[error("timed out: {0}")]
    Timeout(String),

    // Permanent remote errors
    #[error("permission denied: {0}")]
    Permission(String),

    #[error("invalid data: {0}")]
    DataIntegrity(String),

    // Local errors
    #[error("local storage error: {0}")]
    Storage(String),

    #[error("sync request cancelled")]
    Cancelled,

    #[error("{0}")]
    Unknown(String),
}

/// Coarse classification used by the retry policy and exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No session was active.
    Unauthenticated,
    /// Offline, unavailable or timed out.
    NetworkTransient,
    /// Forbidden or unauthorized by the remote store.
    Permission,
    /// A stored payload could not be decoded.
    DataIntegrity,
    /// Anything else.
    Unknown,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Unauthenticated => ErrorKind::Unauthenticated,
            Error::Network(_) | Error::Timeout(_) => ErrorKind::NetworkTransient,
            Error::Permission(_) => ErrorKind::Permission,
            Error::DataIntegrity(_) => ErrorKind::DataIntegrity,
            Error::Storage(_) | Error::Cancelled | Error::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Whether a remote operation failing with this error should be retried.
    ///
    /// Unknown errors are retried like transient ones.
    pub fn is_retryable(&self) -> bool {
        if matches!(self, Error::Cancelled) {
            return false;
        }
        matches!(
            self.kind(),
            ErrorKind::NetworkTransient | ErrorKind::Unknown
        )
    }

    /// Whether a failed server read may be answered from the store's cache.
    pub fn is_offline(&self) -> bool {
        self.kind() == ErrorKind::NetworkTransient
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::DataIntegrity(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
