//! Upload entry point and phase sequencing.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use futures::Stream;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::UploadError;
use crate::progress::{self, TransferEvent};
use crate::retry::Retrier;
use crate::session::{InputSource, UploadSession};
use crate::traits::UploadService;
use crate::transfer;
use crate::types::{
    FileLink, SecurityCredentials, StartResponse, UploadProgress, UploadRequest, UploadSettings,
};

/// Buffer depth for the internal event and outward update channels.
const CHANNEL_BUFFER: usize = 64;

/// Entry point for uploads against an injected [`UploadService`].
///
/// The service, API key, and optional security credentials are fixed at
/// construction; everything per-upload arrives with the request.
pub struct Uploader<S: UploadService> {
    service: Arc<S>,
    api_key: String,
    security: Option<SecurityCredentials>,
    settings: UploadSettings,
}

impl<S: UploadService + 'static> Uploader<S> {
    /// Create an uploader with default settings.
    pub fn new(service: S, api_key: impl Into<String>) -> Self {
        Self {
            service: Arc::new(service),
            api_key: api_key.into(),
            security: None,
            settings: UploadSettings::default(),
        }
    }

    /// Attach a policy/signature pair to every API call.
    pub fn with_security(mut self, security: SecurityCredentials) -> Self {
        self.security = Some(security);
        self
    }

    /// Override the default settings.
    pub fn with_settings(mut self, settings: UploadSettings) -> Self {
        self.settings = settings;
        self
    }

    /// The injected service.
    pub fn service(&self) -> &S {
        &self.service
    }

    /// Upload `size` bytes read from `source`.
    ///
    /// The start phase runs before this returns, so a rejected registration
    /// fails here with no bytes sent. Transfer and complete then run in the
    /// background; the returned handle yields one update per transmitted
    /// chunk and a terminal update carrying the [`FileLink`]. Updates must
    /// be consumed - the transfer applies backpressure once the buffer
    /// fills.
    pub async fn upload(
        &self,
        source: impl AsyncRead + Send + Unpin + 'static,
        size: u64,
        request: UploadRequest,
    ) -> Result<UploadHandle, UploadError> {
        let source: InputSource = Box::new(source);
        let session: Arc<UploadSession> = Arc::new(self.start(source, size, &request).await?);
        info!(
            size,
            intelligent = session.intelligent(),
            parts = session.part_count(),
            "upload registered"
        );

        let (event_tx, event_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (update_tx, update_rx) = mpsc::channel(CHANNEL_BUFFER);
        tokio::spawn(progress::run(size, event_rx, update_tx));

        // The aggregator's clock starts when the start phase is done.
        let _ = event_tx.send(TransferEvent::Started).await;

        let driver_session: Arc<UploadSession> = Arc::clone(&session);
        let service: Arc<S> = Arc::clone(&self.service);
        let settings: UploadSettings = self.settings.clone();
        tokio::spawn(async move {
            match drive(driver_session, service, settings, event_tx.clone()).await {
                Ok(file) => {
                    let _ = event_tx.send(TransferEvent::Completed { file }).await;
                }
                Err(error) => {
                    let _ = event_tx.send(TransferEvent::Failed { error }).await;
                }
            }
        });

        Ok(UploadHandle {
            updates: update_rx,
            session,
        })
    }

    /// Upload a file from disk.
    ///
    /// The file is opened and sized before the start call, so unreadable
    /// input surfaces as [`UploadError::Input`] with no request sent.
    pub async fn upload_file(
        &self,
        path: impl AsRef<Path>,
        request: UploadRequest,
    ) -> Result<UploadHandle, UploadError> {
        let file = tokio::fs::File::open(path.as_ref()).await?;
        let size: u64 = file.metadata().await?.len();
        self.upload(file, size, request).await
    }

    /// Upload and block until the terminal update, returning the file link.
    pub async fn upload_and_wait(
        &self,
        source: impl AsyncRead + Send + Unpin + 'static,
        size: u64,
        request: UploadRequest,
    ) -> Result<FileLink, UploadError> {
        let handle: UploadHandle = self.upload(source, size, request).await?;
        handle.wait().await
    }

    /// Start phase: register the upload and fix the part geometry.
    async fn start(
        &self,
        source: InputSource,
        size: u64,
        request: &UploadRequest,
    ) -> Result<UploadSession, UploadError> {
        let mut params: HashMap<String, String> = self.base_params(size, request);

        let mut retrier = Retrier::new(self.settings.start_retry_config());
        let response: StartResponse = retrier.run(|| self.service.start_upload(&params)).await?;

        params.insert("uri".to_string(), response.uri.clone());
        params.insert("region".to_string(), response.region.clone());
        params.insert("upload_id".to_string(), response.upload_id.clone());

        // The server has the final say on intelligent ingestion.
        let intelligent: bool = response.intelligent_granted();
        let part_size: u64 = if intelligent {
            self.settings.intelligent_part_size
        } else {
            // Don't imply a mode the server rejected on later calls.
            params.remove("multipart");
            self.settings.regular_part_size
        };
        debug!(intelligent, part_size, "start phase complete");

        Ok(UploadSession::new(
            source,
            size,
            part_size,
            intelligent,
            self.settings.initial_chunk_size,
            self.settings.min_chunk_size,
            params,
        ))
    }

    fn base_params(&self, size: u64, request: &UploadRequest) -> HashMap<String, String> {
        let mut params: HashMap<String, String> = HashMap::new();
        params.insert("apikey".to_string(), self.api_key.clone());
        params.insert("size".to_string(), size.to_string());
        params.insert("filename".to_string(), request.filename.clone());
        params.insert("mimetype".to_string(), request.mime_type.clone());
        if let Some(ref security) = self.security {
            params.insert("policy".to_string(), security.policy.clone());
            params.insert("signature".to_string(), security.signature.clone());
        }
        request.storage.apply_to(&mut params);
        if request.intelligent {
            params.insert("multipart".to_string(), "true".to_string());
        }
        params
    }
}

/// Transfer then complete, returning the resulting file link.
async fn drive<S: UploadService + 'static>(
    session: Arc<UploadSession>,
    service: Arc<S>,
    settings: UploadSettings,
    events: mpsc::Sender<TransferEvent>,
) -> Result<FileLink, UploadError> {
    transfer::run(Arc::clone(&session), Arc::clone(&service), settings.clone(), events).await?;
    complete(&session, service.as_ref(), &settings).await
}

/// Complete phase.
///
/// Regular mode sends the ordered `part:etag` list; intelligent mode sends
/// none and may be answered with "still assembling", which the backend maps
/// to a retryable status so this call polls under the server budget.
async fn complete<S: UploadService>(
    session: &UploadSession,
    service: &S,
    settings: &UploadSettings,
) -> Result<FileLink, UploadError> {
    let parts: Option<String> = if session.intelligent() {
        None
    } else {
        Some(session.parts_string()?)
    };

    let mut retrier = Retrier::new(settings.transfer_retry_config());
    let response = retrier
        .run(|| service.complete_upload(session.base_params(), parts.as_deref()))
        .await?;
    info!(handle = %response.handle, "upload complete");
    Ok(FileLink::from(response))
}

/// A running upload: the outward progress stream plus cooperative
/// cancellation.
pub struct UploadHandle {
    updates: mpsc::Receiver<Result<UploadProgress, UploadError>>,
    session: Arc<UploadSession>,
}

impl std::fmt::Debug for UploadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadHandle").finish_non_exhaustive()
    }
}

impl UploadHandle {
    /// Next progress update; `None` after the terminal update.
    pub async fn next_update(&mut self) -> Option<Result<UploadProgress, UploadError>> {
        self.updates.recv().await
    }

    /// The updates as a stream.
    pub fn into_stream(self) -> impl Stream<Item = Result<UploadProgress, UploadError>> {
        futures::stream::unfold(self.updates, |mut updates| async move {
            updates.recv().await.map(|update| (update, updates))
        })
    }

    /// Request cooperative cancellation; workers stop between chunks.
    pub fn cancel(&self) {
        self.session.cancel();
    }

    /// Drain updates until the terminal one and return the file link.
    pub async fn wait(mut self) -> Result<FileLink, UploadError> {
        let mut last: Option<UploadProgress> = None;
        while let Some(update) = self.updates.recv().await {
            last = Some(update?);
        }
        match last.and_then(|progress| progress.file) {
            Some(file) => Ok(file),
            None => Err(UploadError::Other {
                message: "upload ended without a terminal update".to_string(),
            }),
        }
    }
}
