//! Parallel multipart upload engine for the filestore API.
//!
//! The engine moves a byte source of known size through the three-phase
//! upload protocol against any [`UploadService`] implementation:
//!
//! - **Start** registers the upload and fixes the part geometry: 8 MiB
//!   parts when the server grants intelligent ingestion, 5 MiB otherwise.
//! - **Transfer** runs a fixed pool of workers that claim sequential parts
//!   from a shared read cursor and send each part as one chunk (regular
//!   mode, recording storage ETags) or as adaptively sized chunks with a
//!   per-part commit (intelligent mode). Transient network failures halve
//!   the chunk size, down to a floor.
//! - **Complete** finalizes the upload server-side; intelligent uploads are
//!   polled while the backend is still assembling parts.
//!
//! Progress arrives on a single channel of smoothed-rate updates; the
//! terminal update carries the resulting [`FileLink`].
//!
//! # Example
//!
//! ```ignore
//! use rusty_filestore_upload::{UploadRequest, Uploader};
//!
//! let uploader = Uploader::new(service, "API_KEY");
//! let request = UploadRequest::new("movie.mp4", "video/mp4").intelligent();
//! let link = uploader.upload_file("movie.mp4", request).await?;
//! ```

mod error;
mod parts;
mod progress;
mod retry;
mod session;
mod traits;
mod transfer;
mod types;
mod uploader;

pub use error::{ServiceError, UploadError};
pub use parts::{chunk_length, part_count, part_length};
pub use retry::{Retrier, RetryConfig};
pub use traits::UploadService;
pub use types::{
    CompleteResponse, FileLink, PartSpec, PartTarget, SecurityCredentials, StartResponse,
    StorageOptions, StoredChunk, UploadProgress, UploadRequest, UploadSettings,
    DEFAULT_CONCURRENCY, DEFAULT_DELAY_BASE, DEFAULT_NETWORK_RETRIES, DEFAULT_SERVER_RETRIES,
    INITIAL_CHUNK_SIZE, INTELLIGENT_PART_SIZE, MIN_CHUNK_SIZE, REGULAR_PART_SIZE,
};
pub use uploader::{UploadHandle, Uploader};
