//! Error types and result handling for the watchdog

use thiserror::Error;

/// Result type alias for watchdog operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for watchdog operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transient fault: {0}")]
    Transient(String),

    #[error("replica is not primary")]
    NotPrimary,

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("platform client closed")]
    PlatformClosed,

    #[error("platform error: {0}")]
    Platform(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// Check if the error is retryable on the next tick
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transient(_)
                | Error::Timeout(_)
                | Error::Network(_)
                | Error::Storage(_)
                | Error::PlatformClosed
        )
    }

    /// Get error category for logging and telemetry
    pub fn category(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "invalid_argument",
            Error::Transient(_) => "transient",
            Error::NotPrimary => "not_primary",
            Error::Timeout(_) => "timeout",
            Error::NotFound(_) => "not_found",
            Error::PlatformClosed => "platform_closed",
            Error::Platform(_) => "platform",
            Error::Storage(_) => "storage",
            Error::Network(_) => "network",
            Error::Serialization(_) => "serialization",
            Error::Configuration(_) => "configuration",
            Error::Fatal(_) => "fatal",
        }
    }
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
