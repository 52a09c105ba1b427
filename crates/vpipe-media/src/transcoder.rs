//! Transcoding engine: probe, ladder encode, thumbnail, master playlist.

use async_trait::async_trait;
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use vpipe_models::encoding::{
    fit_ladder, EncodingProfile, RenditionTier, DEFAULT_PRESET, DEFAULT_SEGMENT_SECONDS,
    DEFAULT_THUMBNAIL_OFFSET_SECS, THUMBNAIL_NAME,
};

use crate::error::{MediaError, MediaResult};
use crate::hls::{encode_rendition, write_master_playlist, Rendition};
use crate::probe::{probe_video, VideoInfo};
use crate::thumbnail::{generate_thumbnail, thumbnail_offset};
use crate::workdir::OutputDir;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct TranscodeConfig {
    /// Tiers to produce, highest first
    pub ladder: Vec<RenditionTier>,
    /// Encoder settings shared by all tiers
    pub profile: EncodingProfile,
    /// Maximum tiers encoded at once
    pub max_parallel: usize,
    /// Preferred thumbnail seek position
    pub thumbnail_offset_secs: f64,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            ladder: RenditionTier::default_ladder(),
            profile: EncodingProfile::default(),
            max_parallel: 1,
            thumbnail_offset_secs: DEFAULT_THUMBNAIL_OFFSET_SECS,
        }
    }
}

impl TranscodeConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let segment_seconds = std::env::var("HLS_SEGMENT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_SEGMENT_SECONDS);
        let preset = std::env::var("TRANSCODE_PRESET").unwrap_or_else(|_| DEFAULT_PRESET.to_string());

        let ladder = match std::env::var("TRANSCODE_TIERS") {
            Ok(names) => RenditionTier::select_from_default(&names).unwrap_or_else(|| {
                warn!("TRANSCODE_TIERS={} matched no tier, using the default ladder", names);
                RenditionTier::default_ladder()
            }),
            Err(_) => RenditionTier::default_ladder(),
        };

        Self {
            ladder,
            profile: EncodingProfile::default()
                .with_preset(preset)
                .with_segment_seconds(segment_seconds),
            max_parallel: std::env::var("TRANSCODE_MAX_PARALLEL")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1usize)
                .max(1),
            thumbnail_offset_secs: std::env::var("THUMBNAIL_OFFSET_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_THUMBNAIL_OFFSET_SECS),
        }
    }
}

/// Input to one transcode run.
#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    /// Local source file
    pub source: PathBuf,
    /// Probe result for the source
    pub info: VideoInfo,
    /// Directory that receives tier folders, thumbnail and master playlist
    pub output_dir: PathBuf,
    /// Extract a thumbnail frame
    pub generate_thumbnail: bool,
}

/// Files produced by a successful run, all under `output_dir`.
#[derive(Debug, Clone)]
pub struct TranscodeOutput {
    pub output_dir: PathBuf,
    /// Renditions in ladder order
    pub renditions: Vec<Rendition>,
    pub master_playlist: PathBuf,
    pub thumbnail: Option<PathBuf>,
}

/// The transcoding engine seam used by the worker.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Inspect a source file.
    async fn probe(&self, source: &Path) -> MediaResult<VideoInfo>;

    /// Produce every rendition, the thumbnail and the master playlist.
    ///
    /// On error nothing is left in `output_dir`.
    async fn transcode(&self, request: &TranscodeRequest) -> MediaResult<TranscodeOutput>;
}

/// FFmpeg-backed engine.
#[derive(Debug, Clone, Default)]
pub struct FfmpegTranscoder {
    config: TranscodeConfig,
}

impl FfmpegTranscoder {
    pub fn new(config: TranscodeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TranscodeConfig {
        &self.config
    }

    async fn encode_ladder(&self, request: &TranscodeRequest, output_dir: &Path) -> MediaResult<Vec<Rendition>> {
        let sem = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));

        let tiers = fit_ladder(&self.config.ladder, request.info.width, request.info.height);
        if tiers.len() < self.config.ladder.len() {
            debug!(
                tiers = tiers.len(),
                configured = self.config.ladder.len(),
                "Dropped tiers that duplicate a resolution"
            );
        }

        let futures: Vec<_> = tiers
            .iter()
            .map(|tier| {
                let sem = sem.clone();
                let profile = &self.config.profile;
                async move {
                    let _permit = sem
                        .acquire()
                        .await
                        .map_err(|_| MediaError::internal("encode semaphore closed"))?;
                    let started = Instant::now();
                    let rendition =
                        encode_rendition(&request.source, &request.info, tier, profile, output_dir).await?;
                    metrics::histogram!("vpipe_transcode_tier_duration_seconds", "tier" => tier.name.clone())
                        .record(started.elapsed().as_secs_f64());
                    Ok::<_, MediaError>(rendition)
                }
            })
            .collect();

        // join_all keeps ladder order
        join_all(futures).await.into_iter().collect()
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn probe(&self, source: &Path) -> MediaResult<VideoInfo> {
        probe_video(source).await
    }

    async fn transcode(&self, request: &TranscodeRequest) -> MediaResult<TranscodeOutput> {
        if self.config.ladder.is_empty() {
            return Err(MediaError::internal("rendition ladder is empty"));
        }

        let guard = OutputDir::create(&request.output_dir).await?;
        let started = Instant::now();

        info!(
            source = %request.source.display(),
            width = request.info.width,
            height = request.info.height,
            orientation = request.info.orientation().as_str(),
            tiers = self.config.ladder.len(),
            "Starting transcode"
        );

        let renditions = self.encode_ladder(request, guard.path()).await?;

        let thumbnail = if request.generate_thumbnail {
            let path = guard.path().join(THUMBNAIL_NAME);
            let offset = thumbnail_offset(request.info.duration, self.config.thumbnail_offset_secs);
            generate_thumbnail(&request.source, &path, offset).await?;
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Err(MediaError::internal("thumbnail was not produced"));
            }
            Some(path)
        } else {
            None
        };

        let master_playlist = write_master_playlist(guard.path(), &renditions).await?;

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            renditions = renditions.len(),
            "Transcode complete"
        );

        Ok(TranscodeOutput {
            output_dir: guard.keep(),
            renditions,
            master_playlist,
            thumbnail,
        })
    }
}
