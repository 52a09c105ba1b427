//! Rendition ladder and encoding configuration.

use serde::{Deserialize, Serialize};

use crate::video::Orientation;

/// Default video codec (H.264)
pub const DEFAULT_VIDEO_CODEC: &str = "libx264";
/// Default audio codec
pub const DEFAULT_AUDIO_CODEC: &str = "aac";
/// Default encoding preset
pub const DEFAULT_PRESET: &str = "veryfast";
/// Default HLS segment duration in seconds
pub const DEFAULT_SEGMENT_SECONDS: u32 = 6;
/// Codec string advertised in the master playlist (H.264 High 4.0 + AAC-LC)
pub const HLS_CODECS: &str = "avc1.640028,mp4a.40.2";

/// Thumbnail generation settings
pub const THUMBNAIL_SCALE_WIDTH: u32 = 480;
pub const DEFAULT_THUMBNAIL_OFFSET_SECS: f64 = 2.0;

/// Master playlist file name
pub const MASTER_PLAYLIST_NAME: &str = "master.m3u8";
/// Per-tier playlist file name
pub const TIER_PLAYLIST_NAME: &str = "index.m3u8";
/// Thumbnail file name
pub const THUMBNAIL_NAME: &str = "thumbnail.jpg";

/// One resolution/bitrate variant of the ladder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenditionTier {
    /// Tier name, also the output sub-directory (e.g. "720p")
    pub name: String,
    /// Bounding box width for landscape sources
    pub max_width: u32,
    /// Bounding box height for landscape sources
    pub max_height: u32,
    /// Target video bitrate in kbit/s
    pub video_kbps: u32,
    /// Peak video bitrate in kbit/s
    pub maxrate_kbps: u32,
    /// Rate control buffer in kbit
    pub bufsize_kbps: u32,
    /// Audio bitrate in kbit/s
    pub audio_kbps: u32,
}

impl RenditionTier {
    pub fn new(name: impl Into<String>, max_width: u32, max_height: u32, video_kbps: u32, audio_kbps: u32) -> Self {
        Self {
            name: name.into(),
            max_width,
            max_height,
            video_kbps,
            maxrate_kbps: video_kbps * 107 / 100,
            bufsize_kbps: video_kbps * 3 / 2,
            audio_kbps,
        }
    }

    /// The three-tier default ladder, highest first.
    pub fn default_ladder() -> Vec<RenditionTier> {
        vec![
            RenditionTier::new("1080p", 1920, 1080, 5000, 128),
            RenditionTier::new("720p", 1280, 720, 2800, 128),
            RenditionTier::new("480p", 854, 480, 1400, 96),
        ]
    }

    /// Pick tiers from the default ladder by name, e.g. `"1080p,480p"`.
    ///
    /// Unknown names are ignored. Returns `None` when nothing matches.
    pub fn select_from_default(names: &str) -> Option<Vec<RenditionTier>> {
        let wanted: Vec<&str> = names.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
        let ladder: Vec<RenditionTier> = Self::default_ladder()
            .into_iter()
            .filter(|tier| wanted.contains(&tier.name.as_str()))
            .collect();
        if ladder.is_empty() {
            None
        } else {
            Some(ladder)
        }
    }

    /// Bandwidth advertised in the master playlist, in bits per second.
    pub fn bandwidth(&self) -> u64 {
        (self.maxrate_kbps as u64 + self.audio_kbps as u64) * 1000
    }

    /// Average bandwidth advertised in the master playlist, in bits per second.
    pub fn average_bandwidth(&self) -> u64 {
        (self.video_kbps as u64 + self.audio_kbps as u64) * 1000
    }

    /// Output dimensions for a source with the given display dimensions.
    ///
    /// Portrait sources are fitted into the transposed box. The source is
    /// never upscaled and both dimensions are rounded down to even numbers.
    pub fn output_dimensions(&self, src_width: u32, src_height: u32) -> (u32, u32) {
        if src_width == 0 || src_height == 0 {
            return (even(self.max_width), even(self.max_height));
        }

        let (box_w, box_h) = match Orientation::from_dimensions(src_width, src_height) {
            Orientation::Landscape => (self.max_width, self.max_height),
            Orientation::Portrait => (self.max_height, self.max_width),
        };

        if src_width <= box_w && src_height <= box_h {
            return (even(src_width), even(src_height));
        }

        let (sw, sh, bw, bh) = (src_width as u64, src_height as u64, box_w as u64, box_h as u64);
        let (w, h) = if bw * sh <= bh * sw {
            (bw, sh * bw / sw)
        } else {
            (sw * bh / sh, bh)
        };
        (even(w as u32), even(h as u32))
    }
}

/// Tiers worth encoding for a source, in ladder order.
///
/// Tiers that fit the source to the same dimensions collapse into the last
/// of them, so a small source gets one variant per distinct resolution at
/// the lowest bitrate that reaches it.
pub fn fit_ladder(ladder: &[RenditionTier], src_width: u32, src_height: u32) -> Vec<RenditionTier> {
    let dims: Vec<(u32, u32)> = ladder
        .iter()
        .map(|tier| tier.output_dimensions(src_width, src_height))
        .collect();
    ladder
        .iter()
        .enumerate()
        .filter(|(i, _)| !dims[i + 1..].contains(&dims[*i]))
        .map(|(_, tier)| tier.clone())
        .collect()
}

fn even(v: u32) -> u32 {
    (v & !1).max(2)
}

/// Encoder settings shared by every tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodingProfile {
    /// Video codec (e.g., "libx264")
    #[serde(default = "default_video_codec")]
    pub codec: String,

    /// Encoding preset (e.g., "veryfast", "medium")
    #[serde(default = "default_preset")]
    pub preset: String,

    /// Audio codec
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,

    /// HLS segment duration in seconds
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u32,
}

fn default_video_codec() -> String {
    DEFAULT_VIDEO_CODEC.to_string()
}
fn default_preset() -> String {
    DEFAULT_PRESET.to_string()
}
fn default_audio_codec() -> String {
    DEFAULT_AUDIO_CODEC.to_string()
}
fn default_segment_seconds() -> u32 {
    DEFAULT_SEGMENT_SECONDS
}

impl Default for EncodingProfile {
    fn default() -> Self {
        Self {
            codec: DEFAULT_VIDEO_CODEC.to_string(),
            preset: DEFAULT_PRESET.to_string(),
            audio_codec: DEFAULT_AUDIO_CODEC.to_string(),
            segment_seconds: DEFAULT_SEGMENT_SECONDS,
        }
    }
}

impl EncodingProfile {
    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.preset = preset.into();
        self
    }

    pub fn with_segment_seconds(mut self, seconds: u32) -> Self {
        self.segment_seconds = seconds.max(1);
        self
    }

    /// Keyframe interval in frames so every segment starts on an IDR frame.
    pub fn gop_frames(&self, fps: f64) -> u32 {
        let fps = if fps.is_finite() && fps > 0.0 { fps } else { 30.0 };
        ((fps * self.segment_seconds as f64).round() as u32).max(1)
    }

    /// FFmpeg video arguments for one tier (capped VBR).
    pub fn video_args(&self, tier: &RenditionTier, fps: f64) -> Vec<String> {
        let gop = self.gop_frames(fps).to_string();
        vec![
            "-c:v".to_string(),
            self.codec.clone(),
            "-preset".to_string(),
            self.preset.clone(),
            "-profile:v".to_string(),
            "high".to_string(),
            "-b:v".to_string(),
            format!("{}k", tier.video_kbps),
            "-maxrate".to_string(),
            format!("{}k", tier.maxrate_kbps),
            "-bufsize".to_string(),
            format!("{}k", tier.bufsize_kbps),
            "-g".to_string(),
            gop.clone(),
            "-keyint_min".to_string(),
            gop,
            "-sc_threshold".to_string(),
            "0".to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
        ]
    }

    /// FFmpeg audio arguments for one tier.
    pub fn audio_args(&self, tier: &RenditionTier) -> Vec<String> {
        vec![
            "-c:a".to_string(),
            self.audio_codec.clone(),
            "-b:a".to_string(),
            format!("{}k", tier.audio_kbps),
            "-ac".to_string(),
            "2".to_string(),
        ]
    }
}
