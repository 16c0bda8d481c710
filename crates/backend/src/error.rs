use thiserror::Error;

/// Result alias for adapter operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Backend adapter errors.
///
/// Only connection-class failures are retryable; HTTP error statuses and
/// read timeouts surface immediately.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Dial failure or connection reset before a response was decoded.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The connect or read budget was exceeded.
    #[error("Backend timed out: {0}")]
    Timeout(String),

    /// The backend answered with an HTTP error status.
    #[error("Backend API error ({status}): {message}")]
    Api {
        /// HTTP status code returned by the backend.
        status: u16,
        /// Response body, possibly truncated.
        message: String,
    },

    /// The response was not the JSON shape the dialect promises.
    #[error("Backend protocol error: {0}")]
    Protocol(String),

    /// The service answered the health probe but reports no loaded model.
    #[error("Backend is reachable but reports no loaded model")]
    NoModelLoaded,

    /// The health probe could not reach the service at all.
    #[error("Backend is not reachable: {0}")]
    Unreachable(String),
}

impl BackendError {
    /// Whether the retry policy applies to this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl BackendError {
    pub(crate) fn from_reqwest(err: reqwest::Error, context: &str) -> Self {
        if err.is_timeout() {
            Self::Timeout(format!("{context}: {err}"))
        } else if err.is_connect() || (err.status().is_none() && !err.is_decode() && !err.is_builder()) {
            Self::Connection(format!("{context}: {err}"))
        } else {
            Self::Protocol(format!("{context}: {err}"))
        }
    }
}
