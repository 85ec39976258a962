//! Error types for the HTTP backend.

use rusty_filestore_upload::UploadError;
use thiserror::Error;

/// Errors specific to building the HTTP client.
///
/// Failures of individual service calls are reported through
/// [`rusty_filestore_upload::ServiceError`] instead, so the engine's retry
/// controller can classify them.
#[derive(Error, Debug)]
pub enum HttpError {
    /// The underlying HTTP client could not be built.
    #[error("Failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

impl From<HttpError> for UploadError {
    fn from(err: HttpError) -> Self {
        UploadError::Other {
            message: err.to_string(),
        }
    }
}
