//! Job processor and delivery settlement tests with in-memory engine,
//! storage, record store and broker.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use vpipe_media::{write_master_playlist, MediaError, MediaResult, Rendition, TranscodeOutput, TranscodeRequest, Transcoder, VideoInfo};
use vpipe_models::encoding::{RenditionTier, THUMBNAIL_NAME, TIER_PLAYLIST_NAME};
use vpipe_models::{ReadyUpdate, TranscodeJob, VideoId, VideoRecord, VideoStatus};
use vpipe_queue::{Delivery, QueueError, QueueResult};
use vpipe_storage::{StorageError, StorageGateway, StorageResult, UploadedObject};
use vpipe_worker::{
    DeliveryHandler, DeliveryLimits, DeliverySettler, Disposition, JobOutcome, JobProcessor, ProcessorConfig,
    VideoStore, WorkerResult,
};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

struct FakeTranscoder {
    duration: f64,
    width: u32,
    height: u32,
    fail: bool,
    transcodes: AtomicU32,
}

impl FakeTranscoder {
    fn new(duration: f64, width: u32, height: u32) -> Self {
        Self {
            duration,
            width,
            height,
            fail: false,
            transcodes: AtomicU32::new(0),
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(30.0, 1080, 1920)
        }
    }

    fn transcodes(&self) -> u32 {
        self.transcodes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn probe(&self, _source: &Path) -> MediaResult<VideoInfo> {
        Ok(VideoInfo {
            duration: self.duration,
            width: self.width,
            height: self.height,
            fps: 30.0,
            codec: "h264".to_string(),
            size: 1024,
            bitrate: 4_000_000,
            has_audio: true,
        })
    }

    async fn transcode(&self, request: &TranscodeRequest) -> MediaResult<TranscodeOutput> {
        self.transcodes.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(MediaError::ffmpeg_failed(
                "encode failed",
                Some("frame=1\nInvalid data found when processing input\n".to_string()),
                Some(1),
            ));
        }

        let out = &request.output_dir;
        let mut renditions = Vec::new();
        for tier in RenditionTier::default_ladder() {
            let tier_dir = out.join(&tier.name);
            tokio::fs::create_dir_all(&tier_dir).await?;
            tokio::fs::write(tier_dir.join(TIER_PLAYLIST_NAME), "#EXTM3U\nsegment_000.ts\n").await?;
            tokio::fs::write(tier_dir.join("segment_000.ts"), b"ts").await?;

            let (width, height) = tier.output_dimensions(request.info.width, request.info.height);
            renditions.push(Rendition {
                width,
                height,
                bandwidth: tier.bandwidth(),
                average_bandwidth: tier.average_bandwidth(),
                playlist: format!("{}/{}", tier.name, TIER_PLAYLIST_NAME),
                segments: vec![format!("{}/segment_000.ts", tier.name)],
                tier,
            });
        }

        let thumbnail = if request.generate_thumbnail {
            let path = out.join(THUMBNAIL_NAME);
            tokio::fs::write(&path, b"jpg").await?;
            Some(path)
        } else {
            None
        };

        let master_playlist = write_master_playlist(out, &renditions).await?;
        Ok(TranscodeOutput {
            output_dir: out.clone(),
            renditions,
            master_playlist,
            thumbnail,
        })
    }
}

#[derive(Default)]
struct FakeStorage {
    enabled: bool,
    /// Objects available for download
    objects: Mutex<HashMap<String, Vec<u8>>>,
    uploads: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    /// Uploads of keys ending with this suffix fail
    fail_suffix: Option<String>,
}

impl FakeStorage {
    fn uploads(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }

    fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl StorageGateway for FakeStorage {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn public_url(&self, key: &str) -> String {
        format!("https://cdn.test/{}", key)
    }

    async fn upload(&self, _local: &Path, key: &str) -> StorageResult<UploadedObject> {
        if let Some(suffix) = &self.fail_suffix {
            if key.ends_with(suffix.as_str()) {
                return Err(StorageError::upload_failed(format!("{}: connection reset", key)));
            }
        }
        self.uploads.lock().unwrap().push(key.to_string());
        Ok(UploadedObject {
            url: self.public_url(key),
            bucket: "test".to_string(),
            key: key.to_string(),
            size: 2,
        })
    }

    async fn download(&self, key: &str, local: &Path) -> StorageResult<()> {
        let data = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::not_found(key))?;
        tokio::fs::write(local, data).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.deleted.lock().unwrap().push(key.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct FakeStore {
    records: Mutex<HashMap<String, VideoRecord>>,
}

impl FakeStore {
    fn with_video(video_id: &str) -> Self {
        let store = Self::default();
        store.records.lock().unwrap().insert(
            video_id.to_string(),
            VideoRecord::new(VideoId::from(video_id), "owner-1"),
        );
        store
    }

    fn record(&self, video_id: &str) -> VideoRecord {
        self.records.lock().unwrap()[video_id].clone()
    }
}

#[async_trait]
impl VideoStore for FakeStore {
    async fn get(&self, video_id: &VideoId) -> WorkerResult<Option<VideoRecord>> {
        Ok(self.records.lock().unwrap().get(video_id.as_str()).cloned())
    }

    async fn mark_processing(&self, video_id: &VideoId) -> WorkerResult<()> {
        if let Some(r) = self.records.lock().unwrap().get_mut(video_id.as_str()) {
            r.status = VideoStatus::Processing;
        }
        Ok(())
    }

    async fn mark_ready(&self, video_id: &VideoId, update: &ReadyUpdate) -> WorkerResult<()> {
        if let Some(r) = self.records.lock().unwrap().get_mut(video_id.as_str()) {
            r.status = VideoStatus::Ready;
            r.manifest_url = Some(update.manifest_url.clone());
            r.error_message = None;
            if let Some(url) = &update.thumbnail_url {
                r.thumbnail_url = Some(url.clone());
            }
        }
        Ok(())
    }

    async fn mark_failed(&self, video_id: &VideoId, error_message: &str) -> WorkerResult<()> {
        if let Some(r) = self.records.lock().unwrap().get_mut(video_id.as_str()) {
            r.status = VideoStatus::Failed;
            r.manifest_url = None;
            r.error_message = Some(error_message.to_string());
        }
        Ok(())
    }
}

/// Records how each delivery was settled.
#[derive(Default)]
struct FakeSettler {
    acked: Mutex<Vec<String>>,
    rejected: Mutex<Vec<(String, String)>>,
    fail_acks: bool,
}

impl FakeSettler {
    fn acked(&self) -> Vec<String> {
        self.acked.lock().unwrap().clone()
    }

    fn rejected(&self) -> Vec<(String, String)> {
        self.rejected.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliverySettler for FakeSettler {
    async fn ack(&self, message_id: &str) -> QueueResult<()> {
        if self.fail_acks {
            return Err(QueueError::connection_failed("connection reset"));
        }
        self.acked.lock().unwrap().push(message_id.to_string());
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery, reason: &str) -> QueueResult<()> {
        self.rejected
            .lock()
            .unwrap()
            .push((delivery.message_id.clone(), reason.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    dir: TempDir,
    transcoder: Arc<FakeTranscoder>,
    storage: Arc<FakeStorage>,
    store: Arc<FakeStore>,
    config: ProcessorConfig,
}

impl Harness {
    fn new(transcoder: FakeTranscoder, storage: FakeStorage) -> Self {
        let dir = TempDir::new().unwrap();
        let config = ProcessorConfig {
            work_dir: dir.path().join("work"),
            source_dir: Some(dir.path().join("sources")),
            output_prefix: "videos".to_string(),
            max_duration_secs: 600.0,
            max_source_bytes: None,
        };
        Self {
            dir,
            transcoder: Arc::new(transcoder),
            storage: Arc::new(storage),
            store: Arc::new(FakeStore::with_video("v1")),
            config,
        }
    }

    fn processor(&self) -> JobProcessor {
        JobProcessor::new(
            self.transcoder.clone(),
            self.storage.clone(),
            self.store.clone(),
            self.config.clone(),
        )
    }

    /// Write a source file under the source dir and return its relative path.
    fn write_source(&self, name: &str, bytes: usize) -> String {
        let sources = self.dir.path().join("sources");
        std::fs::create_dir_all(&sources).unwrap();
        std::fs::write(sources.join(name), vec![0u8; bytes]).unwrap();
        name.to_string()
    }

    fn work_dir_is_empty(&self) -> bool {
        let work: PathBuf = self.config.work_dir.clone();
        !work.exists() || std::fs::read_dir(work).unwrap().next().is_none()
    }
}

impl Harness {
    fn handler(&self, settler: Arc<FakeSettler>) -> DeliveryHandler {
        DeliveryHandler::new(
            settler,
            Arc::new(self.processor()),
            DeliveryLimits {
                max_deliveries: 3,
                message_ttl: Duration::from_secs(3600),
            },
        )
    }
}

/// A delivery enqueued just now.
fn delivery(payload: &str, deliveries: u32) -> Delivery {
    let id = format!("{}-0", chrono::Utc::now().timestamp_millis());
    Delivery::new(id, Some(payload.to_string()), deliveries)
}

fn payload(file_path: &str) -> String {
    format!(r#"{{"videoId":"v1","filePath":"{}","fileName":"raw.mp4"}}"#, file_path)
}

fn job(file_path: &str) -> TranscodeJob {
    TranscodeJob::new("v1", file_path, "raw.mp4")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_portrait_source_becomes_ready() {
    let h = Harness::new(FakeTranscoder::new(30.0, 1080, 1920), FakeStorage::default());
    let path = h.write_source("raw.mp4", 64);

    let outcome = h.processor().process(&job(&path)).await;

    assert_eq!(outcome, JobOutcome::Ready);
    assert_eq!(outcome.disposition(), Disposition::Ack);

    let record = h.store.record("v1");
    assert_eq!(record.status, VideoStatus::Ready);
    assert_eq!(
        record.manifest_url.as_deref(),
        Some("https://cdn.test/videos/v1/hls/master.m3u8")
    );
    assert_eq!(
        record.thumbnail_url.as_deref(),
        Some("https://cdn.test/videos/v1/hls/thumbnail.jpg")
    );
    assert!(record.error_message.is_none());

    let uploads = h.storage.uploads();
    for tier in ["1080p", "720p", "480p"] {
        assert!(uploads.contains(&format!("videos/v1/hls/{}/index.m3u8", tier)));
        assert!(uploads.contains(&format!("videos/v1/hls/{}/segment_000.ts", tier)));
    }
    assert_eq!(uploads.last().map(String::as_str), Some("videos/v1/hls/master.m3u8"));
    assert_eq!(uploads[uploads.len() - 2], "videos/v1/hls/thumbnail.jpg");
    assert!(h.work_dir_is_empty());
}

#[tokio::test]
async fn test_long_source_fails_without_transcoding() {
    let h = Harness::new(FakeTranscoder::new(700.0, 1920, 1080), FakeStorage::default());
    let path = h.write_source("raw.mp4", 64);

    let outcome = h.processor().process(&job(&path)).await;

    match &outcome {
        JobOutcome::Failed(message) => assert!(message.contains("exceeds maximum")),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(outcome.disposition(), Disposition::Ack);
    assert_eq!(h.transcoder.transcodes(), 0);
    assert!(h.storage.uploads().is_empty());

    let record = h.store.record("v1");
    assert_eq!(record.status, VideoStatus::Failed);
    assert!(record.manifest_url.is_none());
    assert!(record.error_message.unwrap().contains("exceeds maximum"));
}

#[tokio::test]
async fn test_missing_record_is_acknowledged() {
    let h = Harness::new(FakeTranscoder::new(30.0, 1920, 1080), FakeStorage::default());
    let path = h.write_source("raw.mp4", 64);

    let outcome = h
        .processor()
        .process(&TranscodeJob::new("unknown", path, "raw.mp4"))
        .await;

    assert_eq!(outcome, JobOutcome::MissingRecord);
    assert_eq!(outcome.disposition(), Disposition::Ack);
    assert_eq!(h.transcoder.transcodes(), 0);
}

#[tokio::test]
async fn test_engine_failure_marks_failed() {
    let h = Harness::new(FakeTranscoder::failing(), FakeStorage::default());
    let path = h.write_source("raw.mp4", 64);

    let outcome = h.processor().process(&job(&path)).await;

    assert!(matches!(outcome, JobOutcome::Failed(_)));
    let record = h.store.record("v1");
    assert_eq!(record.status, VideoStatus::Failed);
    assert!(record.manifest_url.is_none());
    assert!(record
        .error_message
        .unwrap()
        .contains("Invalid data found when processing input"));
    assert!(h.storage.uploads().is_empty());
    assert!(h.work_dir_is_empty());
}

#[tokio::test]
async fn test_upload_failure_is_transient_and_cleans_up() {
    let storage = FakeStorage {
        fail_suffix: Some("master.m3u8".to_string()),
        ..Default::default()
    };
    let h = Harness::new(FakeTranscoder::new(30.0, 1920, 1080), storage);
    let path = h.write_source("raw.mp4", 64);

    let outcome = h.processor().process(&job(&path)).await;

    assert!(matches!(outcome, JobOutcome::Transient(_)));
    assert!(matches!(outcome.disposition(), Disposition::DeadLetter(_)));

    // Everything uploaded before the master playlist is removed again
    let mut uploaded = h.storage.uploads();
    let mut deleted = h.storage.deleted();
    uploaded.sort();
    deleted.sort();
    assert!(!uploaded.is_empty());
    assert_eq!(uploaded, deleted);

    let record = h.store.record("v1");
    assert_eq!(record.status, VideoStatus::Failed);
    assert!(record.manifest_url.is_none());
}

#[tokio::test]
async fn test_missing_source_fails() {
    let h = Harness::new(FakeTranscoder::new(30.0, 1920, 1080), FakeStorage::default());

    let outcome = h.processor().process(&job("uploads/absent.mp4")).await;

    match outcome {
        JobOutcome::Failed(message) => assert!(message.contains("Source file not found")),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(h.transcoder.transcodes(), 0);
}

#[tokio::test]
async fn test_source_downloaded_from_storage() {
    let storage = FakeStorage {
        enabled: true,
        ..Default::default()
    };
    storage
        .objects
        .lock()
        .unwrap()
        .insert("uploads/v1/raw.mp4".to_string(), vec![0u8; 32]);
    let h = Harness::new(FakeTranscoder::new(30.0, 1920, 1080), storage);

    let outcome = h.processor().process(&job("uploads/v1/raw.mp4")).await;

    assert_eq!(outcome, JobOutcome::Ready);
    assert_eq!(h.transcoder.transcodes(), 1);
    assert!(h.work_dir_is_empty());
}

#[tokio::test]
async fn test_redelivery_of_ready_video_stays_ready() {
    let h = Harness::new(FakeTranscoder::new(30.0, 1920, 1080), FakeStorage::default());
    let path = h.write_source("raw.mp4", 64);
    let processor = h.processor();

    assert_eq!(processor.process(&job(&path)).await, JobOutcome::Ready);
    assert_eq!(processor.process(&job(&path)).await, JobOutcome::Ready);

    let record = h.store.record("v1");
    assert_eq!(record.status, VideoStatus::Ready);
    assert!(record.manifest_url.is_some());
    assert_eq!(h.transcoder.transcodes(), 2);
}

#[tokio::test]
async fn test_skip_thumbnail() {
    let h = Harness::new(FakeTranscoder::new(30.0, 1920, 1080), FakeStorage::default());
    let path = h.write_source("raw.mp4", 64);

    let outcome = h
        .processor()
        .process(&job(&path).with_skip_thumbnail(true))
        .await;

    assert_eq!(outcome, JobOutcome::Ready);
    assert!(h.store.record("v1").thumbnail_url.is_none());
    assert!(!h.storage.uploads().iter().any(|k| k.ends_with(THUMBNAIL_NAME)));
}

#[tokio::test]
async fn test_oversized_source_fails() {
    let mut h = Harness::new(FakeTranscoder::new(30.0, 1920, 1080), FakeStorage::default());
    h.config.max_source_bytes = Some(16);
    let path = h.write_source("raw.mp4", 64);

    let outcome = h.processor().process(&job(&path)).await;

    match outcome {
        JobOutcome::Failed(message) => assert!(message.contains("exceeds maximum")),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(h.transcoder.transcodes(), 0);
}

#[tokio::test]
async fn test_ready_job_is_acked_once() {
    let h = Harness::new(FakeTranscoder::new(30.0, 1920, 1080), FakeStorage::default());
    let path = h.write_source("raw.mp4", 64);
    let settler = Arc::new(FakeSettler::default());
    let handler = h.handler(settler.clone());

    let d = delivery(&payload(&path), 1);
    handler.handle(d.clone()).await;

    assert_eq!(settler.acked(), vec![d.message_id]);
    assert!(settler.rejected().is_empty());
    assert_eq!(h.store.record("v1").status, VideoStatus::Ready);
    assert!(handler.in_flight().await.is_empty());
}

#[tokio::test]
async fn test_failed_and_missing_record_jobs_are_acked() {
    let h = Harness::new(FakeTranscoder::failing(), FakeStorage::default());
    let path = h.write_source("raw.mp4", 64);
    let settler = Arc::new(FakeSettler::default());
    let handler = h.handler(settler.clone());

    handler.handle(delivery(&payload(&path), 1)).await;
    let unknown = format!(r#"{{"videoId":"unknown","filePath":"{}","fileName":"raw.mp4"}}"#, path);
    handler.handle(delivery(&unknown, 1)).await;

    assert_eq!(settler.acked().len(), 2);
    assert!(settler.rejected().is_empty());
    assert_eq!(h.store.record("v1").status, VideoStatus::Failed);
}

#[tokio::test]
async fn test_transient_failure_is_dead_lettered() {
    let storage = FakeStorage {
        fail_suffix: Some("master.m3u8".to_string()),
        ..Default::default()
    };
    let h = Harness::new(FakeTranscoder::new(30.0, 1920, 1080), storage);
    let path = h.write_source("raw.mp4", 64);
    let settler = Arc::new(FakeSettler::default());

    let d = delivery(&payload(&path), 1);
    h.handler(settler.clone()).handle(d.clone()).await;

    assert!(settler.acked().is_empty());
    let rejected = settler.rejected();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].0, d.message_id);
    assert!(rejected[0].1.contains("connection reset"));
}

#[tokio::test]
async fn test_malformed_payload_is_rejected_without_processing() {
    let h = Harness::new(FakeTranscoder::new(30.0, 1920, 1080), FakeStorage::default());
    let settler = Arc::new(FakeSettler::default());
    let handler = h.handler(settler.clone());

    handler.handle(delivery("{not json", 1)).await;
    let mut missing_field = delivery("", 1);
    missing_field.payload = None;
    handler.handle(missing_field).await;

    assert!(settler.acked().is_empty());
    let rejected = settler.rejected();
    assert_eq!(rejected.len(), 2);
    assert!(rejected.iter().all(|(_, reason)| reason.starts_with("invalid payload")));
    assert_eq!(h.transcoder.transcodes(), 0);
    assert_eq!(h.store.record("v1").status, VideoStatus::Uploading);
}

#[tokio::test]
async fn test_delivery_limit_marks_record_failed() {
    let h = Harness::new(FakeTranscoder::new(30.0, 1920, 1080), FakeStorage::default());
    let path = h.write_source("raw.mp4", 64);
    h.store
        .records
        .lock()
        .unwrap()
        .get_mut("v1")
        .unwrap()
        .status = VideoStatus::Processing;
    let settler = Arc::new(FakeSettler::default());

    h.handler(settler.clone()).handle(delivery(&payload(&path), 4)).await;

    assert_eq!(h.transcoder.transcodes(), 0);
    assert!(settler.acked().is_empty());
    let rejected = settler.rejected();
    assert_eq!(rejected.len(), 1);
    assert!(rejected[0].1.contains("delivery limit"));

    let record = h.store.record("v1");
    assert_eq!(record.status, VideoStatus::Failed);
    assert!(record.error_message.unwrap().contains("delivery limit"));
}

#[tokio::test]
async fn test_expired_message_leaves_ready_record() {
    let h = Harness::new(FakeTranscoder::new(30.0, 1920, 1080), FakeStorage::default());
    let path = h.write_source("raw.mp4", 64);
    let settler = Arc::new(FakeSettler::default());
    let handler = h.handler(settler.clone());

    handler.handle(delivery(&payload(&path), 1)).await;
    assert_eq!(h.store.record("v1").status, VideoStatus::Ready);

    // Enqueued two hours ago with a one hour TTL
    let old = chrono::Utc::now().timestamp_millis() - 2 * 3600 * 1000;
    let stale = Delivery::new(format!("{}-0", old), Some(payload(&path)), 1);
    handler.handle(stale).await;

    let rejected = settler.rejected();
    assert_eq!(rejected.len(), 1);
    assert!(rejected[0].1.contains("expired"));
    assert_eq!(h.store.record("v1").status, VideoStatus::Ready);
    assert_eq!(h.transcoder.transcodes(), 1);
}

#[tokio::test]
async fn test_failed_ack_is_not_retried_as_reject() {
    let h = Harness::new(FakeTranscoder::new(30.0, 1920, 1080), FakeStorage::default());
    let path = h.write_source("raw.mp4", 64);
    let settler = Arc::new(FakeSettler {
        fail_acks: true,
        ..Default::default()
    });
    let handler = h.handler(settler.clone());

    handler.handle(delivery(&payload(&path), 1)).await;

    assert!(settler.rejected().is_empty());
    assert!(handler.in_flight().await.is_empty());
    assert_eq!(h.store.record("v1").status, VideoStatus::Ready);
}
