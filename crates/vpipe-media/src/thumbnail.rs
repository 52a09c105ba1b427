//! Thumbnail generation.

use std::path::Path;

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::MediaResult;
use vpipe_models::encoding::THUMBNAIL_SCALE_WIDTH;

/// Seek position for the thumbnail frame: the configured offset, or 10% of
/// the duration for short clips.
pub fn thumbnail_offset(duration_secs: f64, configured_offset_secs: f64) -> f64 {
    configured_offset_secs.min(duration_secs * 0.1).max(0.0)
}

/// Generate a JPEG thumbnail from a video file.
pub async fn generate_thumbnail(
    video_path: impl AsRef<Path>,
    output_path: impl AsRef<Path>,
    offset_secs: f64,
) -> MediaResult<()> {
    let cmd = thumbnail_command(video_path.as_ref(), output_path.as_ref(), offset_secs);
    FfmpegRunner::new().run(&cmd).await
}

fn thumbnail_command(video_path: &Path, output_path: &Path, offset_secs: f64) -> FfmpegCommand {
    FfmpegCommand::new(video_path, output_path)
        .seek(offset_secs)
        .single_frame()
        .video_filter(format!("scale={}:-2", THUMBNAIL_SCALE_WIDTH))
        .output_arg("-q:v")
        .output_arg("3")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_uses_configured_value_for_long_videos() {
        assert!((thumbnail_offset(30.0, 2.0) - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_offset_uses_tenth_of_short_videos() {
        assert!((thumbnail_offset(5.0, 2.0) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_thumbnail_command() {
        let cmd = thumbnail_command(Path::new("in.mp4"), Path::new("thumbnail.jpg"), 2.0);
        let args = cmd.build_args();
        assert!(args.contains(&"scale=480:-2".to_string()));
        assert!(args.contains(&"2.000".to_string()));
        assert!(args.contains(&"-frames:v".to_string()));
    }
}
