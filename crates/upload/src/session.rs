//! Per-upload session state shared by transfer workers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::UploadError;
use crate::parts;

/// Boxed input source drained by the shared read cursor.
pub type InputSource = Box<dyn AsyncRead + Send + Unpin>;

/// A claimed slice of the input: the unit of transfer.
#[derive(Debug, Clone)]
pub struct Part {
    /// 1-based part number, assigned in claim order.
    pub number: u64,
    /// The part's bytes. Full part size except possibly the final part.
    pub bytes: Bytes,
}

struct Cursor {
    source: InputSource,
    next_part: u64,
    remaining: u64,
}

/// All state for one upload.
///
/// Geometry (`input_size`, `part_size`, `intelligent`, `base_params`) is
/// fixed by the start phase before the session is shared with workers and
/// is read-only from then on. The read cursor, adaptive chunk size, ETag
/// slots, and cancel flag use interior mutability.
pub struct UploadSession {
    input_size: u64,
    part_size: u64,
    intelligent: bool,
    base_params: HashMap<String, String>,
    chunk_size: Mutex<u64>,
    min_chunk_size: u64,
    cursor: tokio::sync::Mutex<Cursor>,
    etags: Mutex<Vec<Option<String>>>,
    cancelled: AtomicBool,
}

impl UploadSession {
    pub(crate) fn new(
        source: InputSource,
        input_size: u64,
        part_size: u64,
        intelligent: bool,
        initial_chunk_size: u64,
        min_chunk_size: u64,
        base_params: HashMap<String, String>,
    ) -> Self {
        let slots: usize = parts::part_count(input_size, part_size) as usize;
        Self {
            input_size,
            part_size,
            intelligent,
            base_params,
            chunk_size: Mutex::new(std::cmp::min(initial_chunk_size, part_size)),
            min_chunk_size,
            cursor: tokio::sync::Mutex::new(Cursor {
                source,
                next_part: 1,
                remaining: input_size,
            }),
            etags: Mutex::new(vec![None; slots]),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn input_size(&self) -> u64 {
        self.input_size
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// Whether the server granted intelligent ingestion.
    pub fn intelligent(&self) -> bool {
        self.intelligent
    }

    /// Parameters sent with every API call, including the server-issued
    /// session identifiers merged in by the start phase.
    pub fn base_params(&self) -> &HashMap<String, String> {
        &self.base_params
    }

    /// Total number of parts for this upload.
    pub fn part_count(&self) -> u64 {
        parts::part_count(self.input_size, self.part_size)
    }

    /// Claim the next part and read its bytes.
    ///
    /// Claiming the part number and reading its byte range happen under one
    /// lock, so no two workers can observe the same bytes. Returns `None`
    /// once the input is exhausted.
    pub async fn claim_next_part(&self) -> Result<Option<Part>, UploadError> {
        let mut cursor = self.cursor.lock().await;
        if cursor.remaining == 0 {
            return Ok(None);
        }

        let len: usize = std::cmp::min(self.part_size, cursor.remaining) as usize;
        let mut buf: Vec<u8> = vec![0u8; len];
        let mut filled: usize = 0;
        while filled < len {
            let n: usize = cursor.source.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(UploadError::Input {
                    message: format!(
                        "input ended {} bytes short of the declared size {}",
                        cursor.remaining - filled as u64,
                        self.input_size
                    ),
                });
            }
            filled += n;
        }

        let number: u64 = cursor.next_part;
        cursor.next_part += 1;
        cursor.remaining -= len as u64;

        Ok(Some(Part {
            number,
            bytes: Bytes::from(buf),
        }))
    }

    /// Current adaptive chunk size.
    pub fn chunk_size(&self) -> u64 {
        *self.chunk_size.lock().unwrap()
    }

    /// Halve the adaptive chunk size after a transport failure.
    ///
    /// The size never increases for the life of the session. Fails with
    /// [`UploadError::NetworkUnusable`] when halving would drop below the
    /// floor.
    pub fn shrink_chunk_size(&self) -> Result<u64, UploadError> {
        let mut size = self.chunk_size.lock().unwrap();
        let halved: u64 = *size / 2;
        if halved < self.min_chunk_size {
            return Err(UploadError::NetworkUnusable {
                floor: self.min_chunk_size,
            });
        }
        *size = halved;
        Ok(halved)
    }

    /// Record the storage ETag for a finished part (regular mode).
    ///
    /// Each slot is written at most once, by the worker that transmitted
    /// that part.
    pub fn record_etag(&self, part_number: u64, etag: String) {
        let mut etags = self.etags.lock().unwrap();
        let slot = &mut etags[(part_number - 1) as usize];
        debug_assert!(slot.is_none(), "part {part_number} ETag written twice");
        *slot = Some(etag);
    }

    /// Serialized `part:etag` pairs in ascending part order, as sent to the
    /// complete call in regular mode.
    pub fn parts_string(&self) -> Result<String, UploadError> {
        let etags = self.etags.lock().unwrap();
        let mut pairs: Vec<String> = Vec::with_capacity(etags.len());
        for (index, slot) in etags.iter().enumerate() {
            match slot {
                Some(etag) => pairs.push(format!("{}:{}", index + 1, etag)),
                None => {
                    return Err(UploadError::Other {
                        message: format!("part {} finished without an ETag", index + 1),
                    })
                }
            }
        }
        Ok(pairs.join(";"))
    }

    /// Request cooperative cancellation; workers stop between chunks.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}
