//! HLS rendition encoding and master playlist generation.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use vpipe_models::encoding::{EncodingProfile, RenditionTier, HLS_CODECS, MASTER_PLAYLIST_NAME, TIER_PLAYLIST_NAME};

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};
use crate::probe::VideoInfo;

/// One encoded tier on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rendition {
    pub tier: RenditionTier,
    pub width: u32,
    pub height: u32,
    /// Peak bandwidth in bits/second
    pub bandwidth: u64,
    /// Average bandwidth in bits/second
    pub average_bandwidth: u64,
    /// Playlist path relative to the output directory (e.g. `720p/index.m3u8`)
    pub playlist: String,
    /// Segment paths relative to the output directory
    pub segments: Vec<String>,
}

impl Rendition {
    /// Every file of this rendition, relative to the output directory.
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map(String::as_str).chain(std::iter::once(self.playlist.as_str()))
    }
}

/// Build the FFmpeg command for one tier.
pub fn rendition_command(
    input: &Path,
    info: &VideoInfo,
    tier: &RenditionTier,
    profile: &EncodingProfile,
    tier_dir: &Path,
) -> FfmpegCommand {
    let (width, height) = tier.output_dimensions(info.width, info.height);

    let mut cmd = FfmpegCommand::new(input, tier_dir.join(TIER_PLAYLIST_NAME))
        .map("0:v:0")
        .video_filter(format!("scale={}:{}", width, height))
        .output_args(profile.video_args(tier, info.fps));

    cmd = if info.has_audio {
        cmd.map("0:a:0").output_args(profile.audio_args(tier))
    } else {
        cmd.no_audio()
    };

    cmd.output_args([
        "-f".to_string(),
        "hls".to_string(),
        "-hls_time".to_string(),
        profile.segment_seconds.to_string(),
        "-hls_playlist_type".to_string(),
        "vod".to_string(),
        "-hls_flags".to_string(),
        "independent_segments".to_string(),
        "-hls_segment_type".to_string(),
        "mpegts".to_string(),
        "-hls_segment_filename".to_string(),
        tier_dir.join("segment_%03d.ts").to_string_lossy().to_string(),
    ])
}

/// Encode one tier into `<output_dir>/<tier>/`.
pub async fn encode_rendition(
    input: &Path,
    info: &VideoInfo,
    tier: &RenditionTier,
    profile: &EncodingProfile,
    output_dir: &Path,
) -> MediaResult<Rendition> {
    let tier_dir = output_dir.join(&tier.name);
    tokio::fs::create_dir_all(&tier_dir).await?;

    let (width, height) = tier.output_dimensions(info.width, info.height);
    info!(tier = %tier.name, width, height, "Encoding rendition");

    let cmd = rendition_command(input, info, tier, profile, &tier_dir);
    let tier_name = tier.name.clone();
    FfmpegRunner::new()
        .run_with_progress(&cmd, move |p| {
            if p.is_complete {
                debug!(tier = %tier_name, frames = p.frame, "Rendition encode complete");
            }
        })
        .await?;

    let playlist_path = tier_dir.join(TIER_PLAYLIST_NAME);
    let playlist_text = tokio::fs::read_to_string(&playlist_path).await.map_err(|_| {
        MediaError::manifest_incomplete(format!("missing playlist for tier {}", tier.name))
    })?;

    let segments: Vec<String> = parse_segment_uris(&playlist_text)
        .into_iter()
        .map(|uri| format!("{}/{}", tier.name, uri))
        .collect();
    if segments.is_empty() {
        return Err(MediaError::manifest_incomplete(format!(
            "tier {} produced no segments",
            tier.name
        )));
    }

    Ok(Rendition {
        tier: tier.clone(),
        width,
        height,
        bandwidth: tier.bandwidth(),
        average_bandwidth: tier.average_bandwidth(),
        playlist: format!("{}/{}", tier.name, TIER_PLAYLIST_NAME),
        segments,
    })
}

/// Segment URIs listed in a media playlist.
pub fn parse_segment_uris(playlist: &str) -> Vec<String> {
    playlist
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| l.rsplit('/').next().unwrap_or(l).to_string())
        .collect()
}

/// Render the master playlist, variants ordered by descending bandwidth.
pub fn render_master_playlist(renditions: &[Rendition]) -> String {
    let mut sorted: Vec<&Rendition> = renditions.iter().collect();
    sorted.sort_by(|a, b| b.bandwidth.cmp(&a.bandwidth));

    let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
    for r in sorted {
        let _ = writeln!(
            out,
            "#EXT-X-STREAM-INF:BANDWIDTH={},AVERAGE-BANDWIDTH={},RESOLUTION={}x{},CODECS=\"{}\"",
            r.bandwidth, r.average_bandwidth, r.width, r.height, HLS_CODECS
        );
        let _ = writeln!(out, "{}", r.playlist);
    }
    out
}

/// Check that every playlist and segment a rendition references exists.
pub async fn verify_renditions(output_dir: &Path, renditions: &[Rendition]) -> MediaResult<()> {
    if renditions.is_empty() {
        return Err(MediaError::manifest_incomplete("no renditions"));
    }
    for rendition in renditions {
        if rendition.segments.is_empty() {
            return Err(MediaError::manifest_incomplete(format!(
                "tier {} has no segments",
                rendition.tier.name
            )));
        }
        for file in rendition.files() {
            let path = output_dir.join(file);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Err(MediaError::manifest_incomplete(format!("missing {}", file)));
            }
        }
    }
    Ok(())
}

/// Write `master.m3u8` once every referenced file exists on disk.
pub async fn write_master_playlist(output_dir: &Path, renditions: &[Rendition]) -> MediaResult<PathBuf> {
    verify_renditions(output_dir, renditions).await?;

    let path = output_dir.join(MASTER_PLAYLIST_NAME);
    let tmp = output_dir.join(format!("{}.tmp", MASTER_PLAYLIST_NAME));
    tokio::fs::write(&tmp, render_master_playlist(renditions)).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(path)
}
