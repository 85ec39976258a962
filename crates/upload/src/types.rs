//! Shared data structures for the upload engine.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryConfig;

/// Part size for regular multipart uploads (5 MiB).
pub const REGULAR_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Part size when the server grants intelligent ingestion (8 MiB).
pub const INTELLIGENT_PART_SIZE: u64 = 8 * 1024 * 1024;

/// Starting adaptive chunk size for intelligent ingestion (1 MiB).
pub const INITIAL_CHUNK_SIZE: u64 = 1024 * 1024;

/// Floor for the adaptive chunk size (32 KiB).
/// Halving below this aborts the upload.
pub const MIN_CHUNK_SIZE: u64 = 32 * 1024;

/// Default number of concurrent transfer workers.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default transport-failure retry budget per network call.
pub const DEFAULT_NETWORK_RETRIES: u32 = 5;

/// Default server-failure retry budget per network call.
pub const DEFAULT_SERVER_RETRIES: u32 = 5;

/// Default exponential backoff base in seconds (delay is `base^attempt`).
pub const DEFAULT_DELAY_BASE: u32 = 2;

/// Tunables for upload operations.
///
/// The defaults match the reference deployment; tests typically lower the
/// retry budgets and set `delay_base` to 0 to disable sleeping.
#[derive(Debug, Clone)]
pub struct UploadSettings {
    /// Number of concurrent transfer workers.
    pub concurrency: usize,
    /// Part size for regular multipart uploads.
    pub regular_part_size: u64,
    /// Part size when intelligent ingestion is granted.
    pub intelligent_part_size: u64,
    /// Starting adaptive chunk size for intelligent ingestion.
    pub initial_chunk_size: u64,
    /// Floor for the adaptive chunk size; halving below it aborts.
    pub min_chunk_size: u64,
    /// Transport-failure retry budget per network call.
    pub network_retries: u32,
    /// Server-failure retry budget per network call.
    pub server_retries: u32,
    /// Exponential backoff base in seconds; 0 disables sleeping.
    pub delay_base: u32,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            regular_part_size: REGULAR_PART_SIZE,
            intelligent_part_size: INTELLIGENT_PART_SIZE,
            initial_chunk_size: INITIAL_CHUNK_SIZE,
            min_chunk_size: MIN_CHUNK_SIZE,
            network_retries: DEFAULT_NETWORK_RETRIES,
            server_retries: DEFAULT_SERVER_RETRIES,
            delay_base: DEFAULT_DELAY_BASE,
        }
    }
}

impl UploadSettings {
    /// Create settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of concurrent transfer workers.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the part sizes for regular and intelligent uploads.
    pub fn with_part_sizes(mut self, regular: u64, intelligent: u64) -> Self {
        self.regular_part_size = regular;
        self.intelligent_part_size = intelligent;
        self
    }

    /// Set the initial adaptive chunk size and its floor.
    pub fn with_chunk_sizes(mut self, initial: u64, min: u64) -> Self {
        self.initial_chunk_size = initial;
        self.min_chunk_size = min;
        self
    }

    /// Set the per-call retry budgets.
    pub fn with_retries(mut self, network: u32, server: u32) -> Self {
        self.network_retries = network;
        self.server_retries = server;
        self
    }

    /// Set the backoff base in seconds (0 disables sleeping).
    pub fn with_delay_base(mut self, delay_base: u32) -> Self {
        self.delay_base = delay_base;
        self
    }

    /// Retry configuration for the start call.
    ///
    /// A lost start request can simply be resubmitted by the caller, so no
    /// network budget is granted; server 5xx is still retried.
    pub(crate) fn start_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_network_retries: 0,
            max_server_retries: self.server_retries,
            delay_base: self.delay_base,
        }
    }

    /// Retry configuration for transfer, commit, and complete calls.
    pub(crate) fn transfer_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_network_retries: self.network_retries,
            max_server_retries: self.server_retries,
            delay_base: self.delay_base,
        }
    }
}

/// Policy/signature pair attached to every API call when present.
#[derive(Debug, Clone)]
pub struct SecurityCredentials {
    pub policy: String,
    pub signature: String,
}

/// Destination options forwarded to the storage backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageOptions {
    /// Storage provider (e.g. "s3", "gcs").
    pub location: Option<String>,
    /// Provider region.
    pub region: Option<String>,
    /// Bucket or container name.
    pub container: Option<String>,
    /// Key prefix within the container.
    pub path: Option<String>,
    /// Access policy for the stored file (e.g. "public", "private").
    pub access: Option<String>,
}

impl StorageOptions {
    /// Serialize the set options into `store_*` request parameters.
    pub fn apply_to(&self, params: &mut HashMap<String, String>) {
        if let Some(ref location) = self.location {
            params.insert("store_location".to_string(), location.clone());
        }
        if let Some(ref region) = self.region {
            params.insert("store_region".to_string(), region.clone());
        }
        if let Some(ref container) = self.container {
            params.insert("store_container".to_string(), container.clone());
        }
        if let Some(ref path) = self.path {
            params.insert("store_path".to_string(), path.clone());
        }
        if let Some(ref access) = self.access {
            params.insert("store_access".to_string(), access.clone());
        }
    }
}

/// Per-upload request surface.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Name the stored file is registered under.
    pub filename: String,
    /// MIME type declared to the backend.
    pub mime_type: String,
    /// Ask the server for intelligent ingestion (it may refuse).
    pub intelligent: bool,
    /// Storage destination options.
    pub storage: StorageOptions,
}

impl UploadRequest {
    /// Create a request for a regular multipart upload.
    pub fn new(filename: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            mime_type: mime_type.into(),
            intelligent: false,
            storage: StorageOptions::default(),
        }
    }

    /// Request intelligent ingestion.
    pub fn intelligent(mut self) -> Self {
        self.intelligent = true;
        self
    }

    /// Set storage destination options.
    pub fn with_storage(mut self, storage: StorageOptions) -> Self {
        self.storage = storage;
        self
    }
}

/// Server response to a start call.
#[derive(Debug, Clone, Deserialize)]
pub struct StartResponse {
    /// Upload session URI, merged into the base parameters.
    pub uri: String,
    /// Storage region for this session.
    pub region: String,
    /// Server-issued upload identifier.
    pub upload_id: String,
    /// Set to `"intelligent_ingestion"` when the server grants that mode.
    #[serde(default)]
    pub upload_type: Option<String>,
}

impl StartResponse {
    /// Whether the server granted intelligent ingestion.
    pub fn intelligent_granted(&self) -> bool {
        self.upload_type.as_deref() == Some("intelligent_ingestion")
    }
}

/// Parameters identifying one chunk transmission to the upload API.
#[derive(Debug, Clone)]
pub struct PartSpec {
    /// 1-based part number.
    pub part_number: u64,
    /// Bytes in this transmission.
    pub size: u64,
    /// Base64 Content-MD5 of exactly the bytes sent.
    pub md5: String,
    /// Byte offset within the part (intelligent mode only).
    pub offset: Option<u64>,
}

/// Pre-signed storage destination for one chunk.
#[derive(Debug, Clone, Deserialize)]
pub struct PartTarget {
    /// Destination URL.
    pub url: String,
    /// Signing headers to send with the body.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Storage backend response to a chunk transmission.
#[derive(Debug, Clone, Default)]
pub struct StoredChunk {
    /// ETag assigned by the storage backend, when exposed.
    pub etag: Option<String>,
}

/// Server response to a complete call.
#[derive(Debug, Clone, Deserialize)]
pub struct CompleteResponse {
    /// Backend-assigned opaque file identifier.
    pub handle: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub mimetype: Option<String>,
}

/// Reference to a stored file, carried by the terminal progress update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLink {
    /// Backend-assigned opaque identifier.
    pub handle: String,
    /// Direct URL for the stored file, when the backend returns one.
    pub url: Option<String>,
    /// Stored filename.
    pub filename: Option<String>,
    /// Stored size in bytes.
    pub size: Option<u64>,
    /// Stored MIME type.
    pub mime_type: Option<String>,
}

impl From<CompleteResponse> for FileLink {
    fn from(response: CompleteResponse) -> Self {
        Self {
            handle: response.handle,
            url: response.url,
            filename: response.filename,
            size: response.size,
            mime_type: response.mimetype,
        }
    }
}

/// One outward progress update.
#[derive(Debug, Clone)]
pub struct UploadProgress {
    /// Total bytes transferred so far.
    pub bytes_transferred: u64,
    /// Declared input size.
    pub total_bytes: u64,
    /// Smoothed transfer rate in bytes per second.
    pub rate: f64,
    /// Estimated time remaining; `None` until a rate is established.
    pub eta: Option<Duration>,
    /// Wall-clock time since the upload started.
    pub elapsed: Duration,
    /// The completed file, present only on the terminal update.
    pub file: Option<FileLink>,
}

impl UploadProgress {
    /// Percentage of the input transferred (0-100).
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        self.bytes_transferred as f64 * 100.0 / self.total_bytes as f64
    }

    /// Whether this is the terminal update of a successful upload.
    pub fn is_complete(&self) -> bool {
        self.file.is_some()
    }
}
