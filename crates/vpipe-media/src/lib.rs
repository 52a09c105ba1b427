//! FFmpeg CLI wrapper for HLS transcoding.
//!
//! This crate provides:
//! - Type-safe FFmpeg command building
//! - Progress parsing from `-progress pipe:2`
//! - Source probing with rotation-aware display dimensions
//! - Per-tier HLS encoding and master playlist generation
//! - Thumbnail extraction
//! - The [`Transcoder`] seam used by the worker

pub mod command;
pub mod error;
pub mod hls;
pub mod probe;
pub mod progress;
pub mod thumbnail;
pub mod transcoder;
pub mod workdir;

pub use command::{check_ffmpeg, check_ffprobe, FfmpegCommand, FfmpegRunner};
pub use error::{MediaError, MediaResult};
pub use hls::{encode_rendition, render_master_playlist, write_master_playlist, Rendition};
pub use probe::{probe_video, VideoInfo};
pub use progress::FfmpegProgress;
pub use thumbnail::generate_thumbnail;
pub use transcoder::{FfmpegTranscoder, TranscodeConfig, TranscodeOutput, TranscodeRequest, Transcoder};
pub use workdir::OutputDir;
