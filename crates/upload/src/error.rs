//! Error types for upload operations.

use thiserror::Error;

/// Errors surfaced by the upload engine.
#[derive(Error, Debug, Clone)]
pub enum UploadError {
    /// The server rejected the request with a permanent client error
    /// (partial content mismatch, bad parameters, or an invalid/expired
    /// policy signature). Never retried.
    #[error("Request rejected with status {code}: {message}")]
    Request { code: u16, message: String },

    /// The server retry budget was exhausted; carries the last status seen.
    #[error("Server retries exhausted, last status {code}: {message}")]
    ServerRetriesExhausted { code: u16, message: String },

    /// The network retry budget was exhausted.
    #[error("Network retries exhausted: {message}")]
    NetworkRetriesExhausted { message: String },

    /// The adaptive chunk size collapsed below its floor.
    #[error("Network unusable: chunk size fell below {floor} bytes")]
    NetworkUnusable { floor: u64 },

    /// The input source failed before or while being read.
    #[error("Input error: {message}")]
    Input { message: String },

    /// Upload cancelled.
    #[error("Upload cancelled")]
    Cancelled,

    /// Other error.
    #[error("{message}")]
    Other { message: String },
}

impl UploadError {
    /// Check if this error came from a permanent client rejection.
    pub fn is_permanent_rejection(&self) -> bool {
        matches!(self, UploadError::Request { .. })
    }
}

impl From<std::io::Error> for UploadError {
    fn from(err: std::io::Error) -> Self {
        UploadError::Input {
            message: err.to_string(),
        }
    }
}

/// Failure of a single service call attempt.
///
/// The retry controller classifies these: transport failures consume the
/// network budget, status failures consume the server budget unless the
/// status is in the permanent set.
#[derive(Error, Debug, Clone)]
pub enum ServiceError {
    /// Transport-level failure - no status code was received.
    #[error("Transport failure: {message}")]
    Transport { message: String },

    /// The server answered with a non-success status code.
    #[error("Status {code}: {message}")]
    Status { code: u16, message: String },
}

impl ServiceError {
    /// Create a transport failure from any displayable cause.
    pub fn transport(cause: impl std::fmt::Display) -> Self {
        ServiceError::Transport {
            message: cause.to_string(),
        }
    }
}
