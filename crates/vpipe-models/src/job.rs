//! Transcode job message carried on the queue.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::video::VideoId;

/// Reasons a job message is rejected before any processing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobValidationError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid file name: {0}")]
    InvalidFileName(String),
}

/// Job to transcode one uploaded video.
///
/// Wire format is the upload service's JSON:
/// `{"videoId": "...", "filePath": "...", "fileName": "...", "skipThumbnailGeneration": false}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeJob {
    /// Video record this job belongs to
    pub video_id: VideoId,
    /// Source file path (local path or object key)
    pub file_path: String,
    /// Original file name of the upload
    pub file_name: String,
    /// Caller already has a thumbnail
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skip_thumbnail_generation: bool,
}

impl TranscodeJob {
    pub fn new(
        video_id: impl Into<VideoId>,
        file_path: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            video_id: video_id.into(),
            file_path: file_path.into(),
            file_name: file_name.into(),
            skip_thumbnail_generation: false,
        }
    }

    /// Skip thumbnail extraction.
    pub fn with_skip_thumbnail(mut self, skip: bool) -> Self {
        self.skip_thumbnail_generation = skip;
        self
    }

    /// Parse and validate a raw queue payload.
    pub fn from_payload(payload: &str) -> Result<Self, String> {
        let job: TranscodeJob =
            serde_json::from_str(payload).map_err(|e| format!("malformed payload: {}", e))?;
        job.validate().map_err(|e| e.to_string())?;
        Ok(job)
    }

    /// Check required fields and that `file_name` is a bare file name.
    pub fn validate(&self) -> Result<(), JobValidationError> {
        if self.video_id.as_str().trim().is_empty() {
            return Err(JobValidationError::MissingField("videoId"));
        }
        if self.file_path.trim().is_empty() {
            return Err(JobValidationError::MissingField("filePath"));
        }
        if self.file_name.trim().is_empty() {
            return Err(JobValidationError::MissingField("fileName"));
        }
        if self.file_name.contains('/')
            || self.file_name.contains('\\')
            || self.file_name == ".."
            || self.file_name == "."
        {
            return Err(JobValidationError::InvalidFileName(self.file_name.clone()));
        }
        Ok(())
    }
}
