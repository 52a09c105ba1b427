//! Transcode job processing.
//!
//! One job runs end to end: look up the record, resolve the source, check
//! limits, transcode, publish and finalize. The caller settles the queue
//! message according to the returned [`JobOutcome`].

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, info_span, warn, Instrument};

use vpipe_media::{MediaError, TranscodeOutput, TranscodeRequest, Transcoder};
use vpipe_models::encoding::{MASTER_PLAYLIST_NAME, THUMBNAIL_NAME};
use vpipe_models::{ReadyUpdate, TranscodeJob, VideoId, VideoStatus};
use vpipe_storage::{join_key, StorageError, StorageGateway};

use crate::config::ProcessorConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::store::VideoStore;

/// How a job attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Record is `ready`
    Ready,
    /// Record is `failed`; retrying would not help
    Failed(String),
    /// No record for the job's video
    MissingRecord,
    /// Infrastructure failure; the message is dead-lettered
    Transient(String),
}

/// What to do with the queue message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    DeadLetter(String),
}

impl JobOutcome {
    /// Metrics label.
    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Ready => "ready",
            JobOutcome::Failed(_) => "failed",
            JobOutcome::MissingRecord => "missing_record",
            JobOutcome::Transient(_) => "transient",
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            JobOutcome::Transient(reason) => Disposition::DeadLetter(reason.clone()),
            _ => Disposition::Ack,
        }
    }
}

/// Runs transcode jobs against the engine, storage and record store.
pub struct JobProcessor {
    transcoder: Arc<dyn Transcoder>,
    storage: Arc<dyn StorageGateway>,
    store: Arc<dyn VideoStore>,
    config: ProcessorConfig,
}

impl JobProcessor {
    pub fn new(
        transcoder: Arc<dyn Transcoder>,
        storage: Arc<dyn StorageGateway>,
        store: Arc<dyn VideoStore>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            transcoder,
            storage,
            store,
            config,
        }
    }

    /// Process one job. Never fails; errors are folded into the outcome.
    pub async fn process(&self, job: &TranscodeJob) -> JobOutcome {
        let span = info_span!("transcode_job", video_id = %job.video_id);
        self.process_inner(job).instrument(span).await
    }

    /// Mark the record failed for a job that is dropped without processing.
    ///
    /// Missing and already-ready records are left alone.
    pub async fn abandon(&self, video_id: &VideoId, reason: &str) {
        match self.store.get(video_id).await {
            Ok(Some(record)) if record.status != VideoStatus::Ready => {
                let message = format!("Transcoding abandoned: {}", reason);
                match self.store.mark_failed(video_id, &message).await {
                    Ok(()) => warn!(video_id = %video_id, "Marked abandoned job failed: {}", reason),
                    Err(e) => error!(video_id = %video_id, "Failed to mark abandoned job failed: {}", e),
                }
            }
            Ok(_) => {}
            Err(e) => error!(video_id = %video_id, "Failed to load record for abandoned job: {}", e),
        }
    }

    async fn process_inner(&self, job: &TranscodeJob) -> JobOutcome {
        let video_id = &job.video_id;

        match self.store.get(video_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!("No video record for job, dropping it");
                return JobOutcome::MissingRecord;
            }
            Err(e) if e.is_transient() => return JobOutcome::Transient(e.to_string()),
            Err(e) => {
                error!("Failed to load video record: {}", e);
                return JobOutcome::Failed(e.to_string());
            }
        }

        if let Err(e) = self.store.mark_processing(video_id).await {
            warn!("Failed to mark video processing: {}", e);
        }

        info!(file_path = %job.file_path, "Processing video");

        let result = match self.run(job).await {
            Ok(update) => self.store.mark_ready(video_id, &update).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                info!("Video ready");
                JobOutcome::Ready
            }
            Err(e) => {
                let message = e.user_message();
                error!("Job failed: {}", message);
                if let Err(store_err) = self.store.mark_failed(video_id, &message).await {
                    error!("Failed to mark video failed: {}", store_err);
                }
                if e.is_transient() {
                    JobOutcome::Transient(message)
                } else {
                    JobOutcome::Failed(message)
                }
            }
        }
    }

    /// Transcode and publish. The scratch directory is removed on return.
    async fn run(&self, job: &TranscodeJob) -> WorkerResult<ReadyUpdate> {
        tokio::fs::create_dir_all(&self.config.work_dir).await?;
        let scratch = tempfile::Builder::new()
            .prefix("vpipe-job-")
            .tempdir_in(&self.config.work_dir)?;

        let source = self.resolve_source(job, scratch.path()).await?;
        self.check_size(&source).await?;

        let info = self.transcoder.probe(&source).await?;
        if info.duration > self.config.max_duration_secs {
            return Err(MediaError::DurationExceeded {
                actual: info.duration,
                max: self.config.max_duration_secs,
            }
            .into());
        }

        let request = TranscodeRequest {
            source,
            info,
            output_dir: scratch.path().join("output"),
            generate_thumbnail: !job.skip_thumbnail_generation,
        };
        let output = self.transcoder.transcode(&request).await?;

        self.publish(&job.video_id, &output).await
    }

    /// Find the source locally, or download it when object storage is enabled.
    async fn resolve_source(&self, job: &TranscodeJob, scratch: &Path) -> WorkerResult<PathBuf> {
        if let Some(local) = self.local_source_path(&job.file_path) {
            if tokio::fs::try_exists(&local).await.unwrap_or(false) {
                return Ok(local);
            }
        }

        if !self.storage.is_enabled() {
            return Err(WorkerError::source_not_found(&job.file_path));
        }

        let target = scratch.join(&job.file_name);
        match self.storage.download(&job.file_path, &target).await {
            Ok(()) => {
                info!(key = %job.file_path, "Downloaded source");
                Ok(target)
            }
            Err(StorageError::NotFound(_)) | Err(StorageError::InvalidKey(_)) => {
                Err(WorkerError::source_not_found(&job.file_path))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Absolute paths as-is; relative ones under the source dir. Paths that
    /// climb out with `..` are not resolved locally.
    fn local_source_path(&self, file_path: &str) -> Option<PathBuf> {
        let path = Path::new(file_path);
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return None;
        }
        if path.is_absolute() {
            return Some(path.to_path_buf());
        }
        Some(match &self.config.source_dir {
            Some(dir) => dir.join(path),
            None => path.to_path_buf(),
        })
    }

    async fn check_size(&self, source: &Path) -> WorkerResult<()> {
        let Some(max) = self.config.max_source_bytes else {
            return Ok(());
        };
        let size = tokio::fs::metadata(source).await?.len();
        if size > max {
            return Err(WorkerError::limit_exceeded(format!(
                "Source file size {} bytes exceeds maximum of {} bytes",
                size, max
            )));
        }
        Ok(())
    }

    /// Upload renditions, then the thumbnail, then the master playlist.
    ///
    /// On failure everything uploaded so far is deleted, best effort.
    async fn publish(&self, video_id: &VideoId, output: &TranscodeOutput) -> WorkerResult<ReadyUpdate> {
        let prefix = join_key(&self.config.output_prefix, &format!("{}/hls", video_id));
        let mut uploaded = Vec::new();

        match self.upload_outputs(&prefix, output, &mut uploaded).await {
            Ok(update) => {
                info!(objects = uploaded.len(), prefix = %prefix, "Published outputs");
                Ok(update)
            }
            Err(e) => {
                for key in &uploaded {
                    if let Err(del_err) = self.storage.delete(key).await {
                        warn!(key = %key, "Failed to remove partial output: {}", del_err);
                    }
                }
                Err(e)
            }
        }
    }

    async fn upload_outputs(
        &self,
        prefix: &str,
        output: &TranscodeOutput,
        uploaded: &mut Vec<String>,
    ) -> WorkerResult<ReadyUpdate> {
        for rendition in &output.renditions {
            let tier_dir = output.output_dir.join(&rendition.tier.name);
            let objects = self
                .storage
                .upload_directory(&tier_dir, &join_key(prefix, &rendition.tier.name))
                .await?;
            uploaded.extend(objects.into_iter().map(|o| o.key));
        }

        let thumbnail_url = match &output.thumbnail {
            Some(path) => {
                let object = self.storage.upload(path, &join_key(prefix, THUMBNAIL_NAME)).await?;
                uploaded.push(object.key);
                Some(object.url)
            }
            None => None,
        };

        let master = self
            .storage
            .upload(&output.master_playlist, &join_key(prefix, MASTER_PLAYLIST_NAME))
            .await?;
        uploaded.push(master.key);

        Ok(ReadyUpdate {
            manifest_url: master.url,
            thumbnail_url,
        })
    }
}
