//! Progress aggregation: internal transfer events to outward updates.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::error::UploadError;
use crate::types::{FileLink, UploadProgress};

/// Smoothing factor for the exponential moving average transfer rate.
pub(crate) const SMOOTHING_FACTOR: f64 = 0.25;

/// Minimum sample duration in seconds, guarding the rate computation
/// against sub-second chunk transmissions.
const MIN_SAMPLE_SECS: f64 = 1.0;

/// Internal events merged from the start phase, every transfer worker, and
/// the complete phase.
#[derive(Debug)]
pub(crate) enum TransferEvent {
    /// Start phase finished; begins the progress clock. Produces no
    /// outward update.
    Started,
    /// One chunk fully transmitted.
    Bytes {
        started: Instant,
        finished: Instant,
        bytes: u64,
    },
    /// Complete phase finished; terminal update.
    Completed { file: FileLink },
    /// Fatal failure; terminal update.
    Failed { error: UploadError },
}

/// Folds the merged event stream into outward progress updates.
///
/// Runs until a terminal event arrives or the update receiver goes away.
pub(crate) async fn run(
    total_bytes: u64,
    mut events: mpsc::Receiver<TransferEvent>,
    updates: mpsc::Sender<Result<UploadProgress, UploadError>>,
) {
    let mut started_at: Option<Instant> = None;
    let mut transferred: u64 = 0;
    let mut rate: f64 = 0.0;

    while let Some(event) = events.recv().await {
        match event {
            TransferEvent::Started => {
                started_at = Some(Instant::now());
            }
            TransferEvent::Bytes {
                started,
                finished,
                bytes,
            } => {
                transferred += bytes;
                let elapsed: f64 = finished
                    .duration_since(started)
                    .as_secs_f64()
                    .max(MIN_SAMPLE_SECS);
                let sample: f64 = bytes as f64 / elapsed;
                rate = SMOOTHING_FACTOR * sample + (1.0 - SMOOTHING_FACTOR) * rate;

                let update = snapshot(total_bytes, transferred, rate, started_at, None);
                if updates.send(Ok(update)).await.is_err() {
                    return;
                }
            }
            TransferEvent::Completed { file } => {
                let update = snapshot(total_bytes, transferred, rate, started_at, Some(file));
                let _ = updates.send(Ok(update)).await;
                return;
            }
            TransferEvent::Failed { error } => {
                let _ = updates.send(Err(error)).await;
                return;
            }
        }
    }
}

fn snapshot(
    total_bytes: u64,
    transferred: u64,
    rate: f64,
    started_at: Option<Instant>,
    file: Option<FileLink>,
) -> UploadProgress {
    UploadProgress {
        bytes_transferred: transferred,
        total_bytes,
        rate,
        eta: eta(total_bytes, transferred, rate),
        elapsed: started_at.map(|at| at.elapsed()).unwrap_or_default(),
        file,
    }
}

/// Estimated remaining time, rounded up to whole seconds. Undefined until a
/// rate is established.
fn eta(total_bytes: u64, transferred: u64, rate: f64) -> Option<Duration> {
    if rate <= 0.0 {
        return None;
    }
    let remaining: f64 = total_bytes.saturating_sub(transferred) as f64;
    Some(Duration::from_secs((remaining / rate).ceil() as u64))
}
