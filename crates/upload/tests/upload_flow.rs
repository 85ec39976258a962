//! End-to-end upload scenarios against a scripted in-memory service.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use rusty_filestore_upload::{
    CompleteResponse, PartSpec, PartTarget, ServiceError, StartResponse, StoredChunk, UploadError,
    UploadRequest, UploadService, UploadSettings, Uploader,
};

const MIB: u64 = 1024 * 1024;

#[derive(Default)]
struct CallLog {
    start_calls: u32,
    /// (part_number, size, offset, multipart flag present) per upload_part call.
    part_calls: Vec<(u64, u64, Option<u64>, bool)>,
    /// Bytes of each successful storage put.
    put_sizes: Vec<u64>,
    committed_parts: Vec<u64>,
    /// The `parts` argument of each complete call.
    complete_parts: Vec<Option<String>>,
}

/// Scripted in-memory upload API.
struct MockService {
    /// Whether start grants intelligent ingestion.
    grant_intelligent: bool,
    /// Transport failures left to inject into storage puts.
    storage_failures: AtomicU32,
    /// "Still assembling" answers left before complete succeeds.
    complete_accepted: AtomicU32,
    /// Fail every start call with this status.
    start_status: Option<u16>,
    /// Fail every upload_part call with this status.
    part_status: Option<u16>,
    calls: Mutex<CallLog>,
}

impl MockService {
    fn regular() -> Self {
        Self {
            grant_intelligent: false,
            storage_failures: AtomicU32::new(0),
            complete_accepted: AtomicU32::new(0),
            start_status: None,
            part_status: None,
            calls: Mutex::new(CallLog::default()),
        }
    }

    fn intelligent() -> Self {
        Self {
            grant_intelligent: true,
            ..Self::regular()
        }
    }

    fn with_storage_failures(self, count: u32) -> Self {
        self.storage_failures.store(count, Ordering::SeqCst);
        self
    }

    fn with_complete_accepted(self, count: u32) -> Self {
        self.complete_accepted.store(count, Ordering::SeqCst);
        self
    }

    fn log(&self) -> std::sync::MutexGuard<'_, CallLog> {
        self.calls.lock().unwrap()
    }
}

/// Consume one unit from an injected failure counter.
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl UploadService for MockService {
    async fn start_upload(
        &self,
        params: &HashMap<String, String>,
    ) -> Result<StartResponse, ServiceError> {
        self.log().start_calls += 1;
        if let Some(code) = self.start_status {
            return Err(ServiceError::Status {
                code,
                message: "start rejected".to_string(),
            });
        }
        assert!(params.contains_key("apikey"));
        assert!(params.contains_key("size"));
        Ok(StartResponse {
            uri: "/upload/uri".to_string(),
            region: "us-east-1".to_string(),
            upload_id: "upload-1".to_string(),
            upload_type: self
                .grant_intelligent
                .then(|| "intelligent_ingestion".to_string()),
        })
    }

    async fn upload_part(
        &self,
        params: &HashMap<String, String>,
        part: &PartSpec,
    ) -> Result<PartTarget, ServiceError> {
        assert_eq!(part.md5.len(), 24, "Content-MD5 must be a base64 digest");
        assert_eq!(params.get("upload_id").map(String::as_str), Some("upload-1"));
        self.log().part_calls.push((
            part.part_number,
            part.size,
            part.offset,
            params.contains_key("multipart"),
        ));
        if let Some(code) = self.part_status {
            return Err(ServiceError::Status {
                code,
                message: "part rejected".to_string(),
            });
        }
        Ok(PartTarget {
            url: format!("https://storage.test/{}", part.part_number),
            headers: HashMap::new(),
        })
    }

    async fn put_to_storage(
        &self,
        target: &PartTarget,
        body: Bytes,
    ) -> Result<StoredChunk, ServiceError> {
        if take_failure(&self.storage_failures) {
            return Err(ServiceError::Transport {
                message: "connection reset".to_string(),
            });
        }
        self.log().put_sizes.push(body.len() as u64);
        let part_number: u64 = target
            .url
            .rsplit('/')
            .next()
            .and_then(|segment| segment.parse().ok())
            .expect("target url carries the part number");
        Ok(StoredChunk {
            etag: Some(format!("etag-{part_number}")),
        })
    }

    async fn commit_part(
        &self,
        _params: &HashMap<String, String>,
        part_number: u64,
    ) -> Result<(), ServiceError> {
        self.log().committed_parts.push(part_number);
        Ok(())
    }

    async fn complete_upload(
        &self,
        _params: &HashMap<String, String>,
        parts: Option<&str>,
    ) -> Result<CompleteResponse, ServiceError> {
        self.log().complete_parts.push(parts.map(str::to_string));
        if take_failure(&self.complete_accepted) {
            return Err(ServiceError::Status {
                code: 202,
                message: "upload still processing".to_string(),
            });
        }
        Ok(CompleteResponse {
            handle: "handle".to_string(),
            url: None,
            filename: None,
            size: None,
            mimetype: None,
        })
    }
}

fn test_settings() -> UploadSettings {
    UploadSettings::default().with_delay_base(0)
}

fn uploader(service: MockService) -> Uploader<MockService> {
    Uploader::new(service, "KEY").with_settings(test_settings())
}

fn source(size: u64) -> Cursor<Vec<u8>> {
    Cursor::new(vec![0x5au8; size as usize])
}

#[tokio::test]
async fn regular_upload_two_parts() {
    let uploader = uploader(MockService::regular());
    let size: u64 = 10 * MIB;

    let link = uploader
        .upload_and_wait(source(size), size, UploadRequest::new("big.bin", "application/octet-stream"))
        .await
        .unwrap();

    assert_eq!(link.handle, "handle");

    let service = uploader.service();
    let log = service.log();
    assert_eq!(log.start_calls, 1);

    // Two 5 MiB parts, each sent as a single chunk with no offset.
    let mut parts: Vec<(u64, u64, Option<u64>)> = log
        .part_calls
        .iter()
        .map(|&(number, size, offset, _)| (number, size, offset))
        .collect();
    parts.sort();
    assert_eq!(parts, vec![(1, 5 * MIB, None), (2, 5 * MIB, None)]);

    // No commits in regular mode; complete carries the ordered ETag list.
    assert!(log.committed_parts.is_empty());
    assert_eq!(
        log.complete_parts,
        vec![Some("1:etag-1;2:etag-2".to_string())]
    );
}

#[tokio::test]
async fn regular_upload_final_part_is_short() {
    let uploader = uploader(MockService::regular());
    let size: u64 = 12 * MIB;

    uploader
        .upload_and_wait(source(size), size, UploadRequest::new("odd.bin", "application/octet-stream"))
        .await
        .unwrap();

    let service = uploader.service();
    let log = service.log();
    let mut sizes: Vec<(u64, u64)> = log
        .part_calls
        .iter()
        .map(|&(number, size, _, _)| (number, size))
        .collect();
    sizes.sort();
    assert_eq!(sizes, vec![(1, 5 * MIB), (2, 5 * MIB), (3, 2 * MIB)]);
}

#[tokio::test]
async fn intelligent_upload_halves_chunk_on_transient_failure() {
    let service = MockService::intelligent()
        .with_storage_failures(1)
        .with_complete_accepted(1);
    let uploader = uploader(service);
    let size: u64 = 2 * MIB;

    let link = uploader
        .upload_and_wait(
            source(size),
            size,
            UploadRequest::new("video.mp4", "video/mp4").intelligent(),
        )
        .await
        .unwrap();

    assert_eq!(link.handle, "handle");

    let service = uploader.service();
    let log = service.log();

    // First attempt went out at the initial 1 MiB; after the transport
    // failure the rest of the part moved in 512 KiB chunks.
    let sizes: Vec<u64> = log.part_calls.iter().map(|&(_, size, _, _)| size).collect();
    assert_eq!(sizes[0], MIB);
    assert!(sizes[1..].iter().all(|&size| size == MIB / 2));

    // The failed attempt never reached storage; the successful chunks
    // cover the whole input.
    assert_eq!(log.put_sizes, vec![MIB / 2; 4]);
    assert_eq!(log.put_sizes.iter().sum::<u64>(), size);

    // Every chunk carried an intra-part offset and the multipart flag.
    assert!(log.part_calls.iter().all(|&(_, _, offset, _)| offset.is_some()));
    assert!(log.part_calls.iter().all(|&(_, _, _, multipart)| multipart));

    // One commit for the single part; complete was polled once.
    assert_eq!(log.committed_parts, vec![1]);
    assert_eq!(log.complete_parts, vec![None, None]);
}

#[tokio::test]
async fn intelligent_refused_falls_back_to_regular() {
    // Intelligent requested, server refuses.
    let uploader = uploader(MockService::regular());
    let size: u64 = 10 * MIB;

    uploader
        .upload_and_wait(
            source(size),
            size,
            UploadRequest::new("big.bin", "application/octet-stream").intelligent(),
        )
        .await
        .unwrap();

    let service = uploader.service();
    let log = service.log();

    // 5 MiB geometry, no commits, and the multipart flag was stripped
    // before any transfer call went out.
    assert_eq!(log.part_calls.len(), 2);
    assert!(log.part_calls.iter().all(|&(_, size, _, _)| size == 5 * MIB));
    assert!(log.part_calls.iter().all(|&(_, _, _, multipart)| !multipart));
    assert!(log.committed_parts.is_empty());
}

#[tokio::test]
async fn more_workers_than_parts_is_a_normal_path() {
    let uploader = uploader(MockService::regular());
    let size: u64 = MIB;

    let link = uploader
        .upload_and_wait(source(size), size, UploadRequest::new("small.bin", "application/octet-stream"))
        .await
        .unwrap();

    assert_eq!(link.handle, "handle");
    let service = uploader.service();
    assert_eq!(service.log().part_calls.len(), 1);
}

#[tokio::test]
async fn progress_is_monotonic_and_ends_at_input_size() {
    let uploader = uploader(MockService::regular());
    let size: u64 = 10 * MIB;

    let handle = uploader
        .upload(source(size), size, UploadRequest::new("big.bin", "application/octet-stream"))
        .await
        .unwrap();

    let updates: Vec<_> = handle.into_stream().collect().await;
    assert!(!updates.is_empty());

    let mut previous: u64 = 0;
    for update in &updates {
        let progress = update.as_ref().unwrap();
        assert!(progress.bytes_transferred >= previous);
        assert_eq!(progress.total_bytes, size);
        previous = progress.bytes_transferred;
    }

    let last = updates.last().unwrap().as_ref().unwrap();
    assert_eq!(last.bytes_transferred, size);
    assert!(last.is_complete());
    assert_eq!(last.file.as_ref().unwrap().handle, "handle");
}

#[tokio::test]
async fn exhausted_network_budget_aborts_the_upload() {
    let service = MockService::regular().with_storage_failures(u32::MAX);
    let uploader = Uploader::new(service, "KEY")
        .with_settings(test_settings().with_retries(1, 1));
    let size: u64 = 10 * MIB;

    let result = uploader
        .upload_and_wait(source(size), size, UploadRequest::new("big.bin", "application/octet-stream"))
        .await;

    assert!(matches!(
        result,
        Err(UploadError::NetworkRetriesExhausted { .. })
    ));
}

#[tokio::test]
async fn permanent_status_aborts_without_retries() {
    let mut service = MockService::regular();
    service.part_status = Some(403);
    let uploader = uploader(service);
    let size: u64 = 10 * MIB;

    let result = uploader
        .upload_and_wait(source(size), size, UploadRequest::new("big.bin", "application/octet-stream"))
        .await;

    match result {
        Err(UploadError::Request { code, .. }) => assert_eq!(code, 403),
        other => panic!("unexpected result: {other:?}"),
    }

    // No storage traffic and no completion happened.
    let service = uploader.service();
    let log = service.log();
    assert!(log.put_sizes.is_empty());
    assert!(log.complete_parts.is_empty());
}

#[tokio::test]
async fn chunk_size_collapse_is_fatal() {
    let service = MockService::intelligent().with_storage_failures(u32::MAX);
    let uploader = Uploader::new(service, "KEY")
        .with_settings(test_settings().with_retries(10, 5));
    // From 1 MiB, five halvings reach the 32 KiB floor; the sixth collapses.
    let size: u64 = 256 * 1024;

    let result = uploader
        .upload_and_wait(
            source(size),
            size,
            UploadRequest::new("small.bin", "application/octet-stream").intelligent(),
        )
        .await;

    assert!(matches!(
        result,
        Err(UploadError::NetworkUnusable { floor }) if floor == 32 * 1024
    ));
}

#[tokio::test]
async fn start_failure_aborts_before_any_transfer() {
    let mut service = MockService::regular();
    service.start_status = Some(400);
    let uploader = uploader(service);
    let size: u64 = 10 * MIB;

    let result = uploader
        .upload(source(size), size, UploadRequest::new("big.bin", "application/octet-stream"))
        .await;

    match result {
        Err(UploadError::Request { code, .. }) => assert_eq!(code, 400),
        other => panic!("unexpected result: {other:?}"),
    }

    let service = uploader.service();
    let log = service.log();
    assert_eq!(log.start_calls, 1);
    assert!(log.part_calls.is_empty());
}

#[tokio::test]
async fn upload_file_reads_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("payload.bin");
    tokio::fs::write(&path, vec![1u8; 1024]).await.unwrap();

    let uploader = uploader(MockService::regular());
    let handle = uploader
        .upload_file(&path, UploadRequest::new("payload.bin", "application/octet-stream"))
        .await
        .unwrap();

    let link = handle.wait().await.unwrap();
    assert_eq!(link.handle, "handle");

    let service = uploader.service();
    assert_eq!(service.log().put_sizes, vec![1024]);
}

#[tokio::test]
async fn missing_input_file_fails_before_start() {
    let uploader = uploader(MockService::regular());

    let result = uploader
        .upload_file("/no/such/file.bin", UploadRequest::new("x", "application/octet-stream"))
        .await;

    assert!(matches!(result, Err(UploadError::Input { .. })));
    let service = uploader.service();
    assert_eq!(service.log().start_calls, 0);
}
