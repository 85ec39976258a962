//! Service interface consumed by the upload engine.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::ServiceError;
use crate::types::{CompleteResponse, PartSpec, PartTarget, StartResponse, StoredChunk};

/// The upload API operations the engine depends on.
///
/// Implementations perform exactly one network call per method and translate
/// failures into [`ServiceError`] so the retry controller can classify them.
/// All retry, sequencing, and concurrency logic lives in the engine; a
/// backend stays a thin request/response marshaling layer.
#[async_trait]
pub trait UploadService: Send + Sync {
    /// Register an upload session and learn the granted mode.
    async fn start_upload(
        &self,
        params: &HashMap<String, String>,
    ) -> Result<StartResponse, ServiceError>;

    /// Obtain a pre-signed storage destination for one chunk.
    async fn upload_part(
        &self,
        params: &HashMap<String, String>,
        part: &PartSpec,
    ) -> Result<PartTarget, ServiceError>;

    /// Send chunk bytes to a pre-signed storage destination.
    async fn put_to_storage(
        &self,
        target: &PartTarget,
        body: Bytes,
    ) -> Result<StoredChunk, ServiceError>;

    /// Declare all chunks of a part received and ready for assembly
    /// (intelligent mode only).
    async fn commit_part(
        &self,
        params: &HashMap<String, String>,
        part_number: u64,
    ) -> Result<(), ServiceError>;

    /// Finalize the upload. `parts` carries the serialized part/ETag list
    /// in regular mode and is absent in intelligent mode.
    async fn complete_upload(
        &self,
        params: &HashMap<String, String>,
        parts: Option<&str>,
    ) -> Result<CompleteResponse, ServiceError>;
}
