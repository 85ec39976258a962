//! Transfer phase: the concurrent worker pool.

use std::sync::Arc;
use std::time::Instant;

use base64::engine::general_purpose;
use base64::Engine as _;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::debug;

use crate::error::{ServiceError, UploadError};
use crate::parts;
use crate::progress::TransferEvent;
use crate::retry::Retrier;
use crate::session::{Part, UploadSession};
use crate::traits::UploadService;
use crate::types::{PartSpec, UploadSettings};

/// Runs the worker pool until the input is exhausted or a worker fails.
///
/// The first fatal error aborts the phase: the failing worker flips the
/// session's cancel flag, the remaining workers observe it between chunks
/// and exit, and the error that finished first is the one propagated.
pub(crate) async fn run<S: UploadService + 'static>(
    session: Arc<UploadSession>,
    service: Arc<S>,
    settings: UploadSettings,
    events: mpsc::Sender<TransferEvent>,
) -> Result<(), UploadError> {
    let mut workers: JoinSet<Result<(), UploadError>> = JoinSet::new();
    for worker in 0..settings.concurrency.max(1) {
        workers.spawn(run_worker(
            worker,
            Arc::clone(&session),
            Arc::clone(&service),
            settings.clone(),
            events.clone(),
        ));
    }

    let mut first_error: Option<UploadError> = None;
    while let Some(joined) = workers.join_next().await {
        let result: Result<(), UploadError> = match joined {
            Ok(result) => result,
            Err(join_error) => Err(UploadError::Other {
                message: format!("transfer worker panicked: {join_error}"),
            }),
        };
        if let Err(error) = result {
            session.cancel();
            if first_error.is_none() {
                first_error = Some(error);
            }
        }
    }

    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

/// One worker: claim parts until the cursor runs dry.
///
/// A worker that claims nothing (more workers than parts) exits silently;
/// that is a normal path, not an error.
async fn run_worker<S: UploadService>(
    worker: usize,
    session: Arc<UploadSession>,
    service: Arc<S>,
    settings: UploadSettings,
    events: mpsc::Sender<TransferEvent>,
) -> Result<(), UploadError> {
    let result: Result<(), UploadError> = worker_loop(worker, &session, service.as_ref(), &settings, &events).await;
    if result.is_err() {
        // Stop the siblings before this worker's error is joined.
        session.cancel();
    }
    result
}

async fn worker_loop<S: UploadService>(
    worker: usize,
    session: &UploadSession,
    service: &S,
    settings: &UploadSettings,
    events: &mpsc::Sender<TransferEvent>,
) -> Result<(), UploadError> {
    loop {
        if session.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let part: Part = match session.claim_next_part().await? {
            Some(part) => part,
            None => {
                debug!(worker, "input exhausted");
                return Ok(());
            }
        };
        debug!(worker, part = part.number, bytes = part.bytes.len(), "claimed part");

        if session.intelligent() {
            upload_intelligent_part(session, service, settings, &part, events).await?;
        } else {
            upload_regular_part(session, service, settings, &part, events).await?;
        }
    }
}

/// Regular mode: the whole part goes up as one chunk and its storage ETag
/// is recorded for the complete call.
async fn upload_regular_part<S: UploadService>(
    session: &UploadSession,
    service: &S,
    settings: &UploadSettings,
    part: &Part,
    events: &mpsc::Sender<TransferEvent>,
) -> Result<(), UploadError> {
    let params = session.base_params();
    let number: u64 = part.number;

    let mut retrier = Retrier::new(settings.transfer_retry_config());
    let (etag, started, finished) = retrier
        .run(|| {
            let chunk = part.bytes.clone();
            async move {
                let started: Instant = Instant::now();
                let spec = PartSpec {
                    part_number: number,
                    size: chunk.len() as u64,
                    md5: content_md5(&chunk),
                    offset: None,
                };
                let target = service.upload_part(params, &spec).await?;
                let stored = service.put_to_storage(&target, chunk).await?;
                let etag: String = stored.etag.ok_or_else(|| ServiceError::Transport {
                    message: "storage response carried no ETag".to_string(),
                })?;
                Ok((etag, started, Instant::now()))
            }
        })
        .await?;

    session.record_etag(number, etag);
    send_event(
        events,
        TransferEvent::Bytes {
            started,
            finished,
            bytes: part.bytes.len() as u64,
        },
    )
    .await;
    Ok(())
}

/// Intelligent mode: the part goes up in adaptively sized chunks, each with
/// its own signed destination and Content-MD5, followed by a commit.
///
/// The chunk size is re-read from the session on every attempt because a
/// transport failure shrinks it mid-part; the failed sub-range is then
/// retried at the smaller size.
async fn upload_intelligent_part<S: UploadService>(
    session: &UploadSession,
    service: &S,
    settings: &UploadSettings,
    part: &Part,
    events: &mpsc::Sender<TransferEvent>,
) -> Result<(), UploadError> {
    let params = session.base_params();
    let number: u64 = part.number;
    let part_len: u64 = part.bytes.len() as u64;

    let mut offset: u64 = 0;
    while offset < part_len {
        if session.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let mut retrier = Retrier::new(settings.transfer_retry_config());
        let (sent, started, finished) = retrier
            .run_with_hook(
                || {
                    let len: u64 = parts::chunk_length(part_len, offset, session.chunk_size());
                    let chunk = part.bytes.slice(offset as usize..(offset + len) as usize);
                    async move {
                        let started: Instant = Instant::now();
                        let spec = PartSpec {
                            part_number: number,
                            size: len,
                            md5: content_md5(&chunk),
                            offset: Some(offset),
                        };
                        let target = service.upload_part(params, &spec).await?;
                        service.put_to_storage(&target, chunk).await?;
                        Ok((len, started, Instant::now()))
                    }
                },
                || {
                    let size: u64 = session.shrink_chunk_size()?;
                    debug!(size, "chunk size halved");
                    Ok(())
                },
            )
            .await?;

        send_event(
            events,
            TransferEvent::Bytes {
                started,
                finished,
                bytes: sent,
            },
        )
        .await;
        offset += sent;
    }

    let mut retrier = Retrier::new(settings.transfer_retry_config());
    retrier
        .run(|| service.commit_part(params, number))
        .await?;
    debug!(part = number, "part committed");
    Ok(())
}

/// Base64 Content-MD5 of exactly the bytes sent.
fn content_md5(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(md5::compute(bytes).0)
}

/// The aggregator going away must not fail the transfer.
async fn send_event(events: &mpsc::Sender<TransferEvent>, event: TransferEvent) {
    let _ = events.send(event).await;
}
