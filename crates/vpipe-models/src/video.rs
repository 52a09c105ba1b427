//! Video record models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a video record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VideoId(pub String);

impl VideoId {
    /// Generate a new random video ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for VideoId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for VideoId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VideoId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Video processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VideoStatus {
    /// Source file is still being uploaded by the client
    #[default]
    Uploading,
    /// A worker is transcoding the source
    Processing,
    /// Renditions and manifest are published
    Ready,
    /// Transcoding failed; see the error message
    Failed,
}

impl VideoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoStatus::Uploading => "uploading",
            VideoStatus::Processing => "processing",
            VideoStatus::Ready => "ready",
            VideoStatus::Failed => "failed",
        }
    }

    /// Parse a stored status string. Unknown values map to `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uploading" => Some(VideoStatus::Uploading),
            "processing" => Some(VideoStatus::Processing),
            "ready" => Some(VideoStatus::Ready),
            "failed" => Some(VideoStatus::Failed),
            _ => None,
        }
    }

    /// Whether the status is the end of a job attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(self, VideoStatus::Ready | VideoStatus::Failed)
    }
}

impl fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Display orientation of a source video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    Portrait,
    Landscape,
}

impl Orientation {
    /// Classify from display dimensions. Square frames count as landscape.
    pub fn from_dimensions(width: u32, height: u32) -> Self {
        if height > width {
            Orientation::Portrait
        } else {
            Orientation::Landscape
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Orientation::Portrait => "portrait",
            Orientation::Landscape => "landscape",
        }
    }
}

/// Video record as stored by the CRUD layer.
///
/// The transcoding core only ever writes `status`, `manifest_url`,
/// `thumbnail_url` and `error_message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoRecord {
    /// Unique video ID
    pub video_id: VideoId,

    /// Owner (user) ID
    pub owner_id: String,

    /// Video title
    #[serde(default)]
    pub title: String,

    /// Video description
    #[serde(default)]
    pub description: String,

    /// Reference to the uploaded source file
    #[serde(default)]
    pub source_file: String,

    /// Processing status
    #[serde(default)]
    pub status: VideoStatus,

    /// Master playlist URL (set when ready)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_url: Option<String>,

    /// Thumbnail URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,

    /// Duration in seconds
    #[serde(default)]
    pub duration_secs: f64,

    /// Source file size in bytes
    #[serde(default)]
    pub file_size: u64,

    /// Error message (if failed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl VideoRecord {
    /// Create a freshly uploaded record.
    pub fn new(video_id: VideoId, owner_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            video_id,
            owner_id: owner_id.into(),
            title: String::new(),
            description: String::new(),
            source_file: String::new(),
            status: VideoStatus::Uploading,
            manifest_url: None,
            thumbnail_url: None,
            duration_secs: 0.0,
            file_size: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the source file reference.
    pub fn with_source_file(mut self, source_file: impl Into<String>) -> Self {
        self.source_file = source_file.into();
        self
    }

    /// Set the title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }
}

/// Fields written when a job attempt succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadyUpdate {
    /// Public URL of the master playlist
    pub manifest_url: String,
    /// Public URL of the thumbnail, if one was generated this attempt
    pub thumbnail_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            VideoStatus::Uploading,
            VideoStatus::Processing,
            VideoStatus::Ready,
            VideoStatus::Failed,
        ] {
            assert_eq!(VideoStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(VideoStatus::parse("completed"), None);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&VideoStatus::Ready).unwrap();
        assert_eq!(json, "\"ready\"");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(VideoStatus::Ready.is_terminal());
        assert!(VideoStatus::Failed.is_terminal());
        assert!(!VideoStatus::Processing.is_terminal());
        assert!(!VideoStatus::Uploading.is_terminal());
    }

    #[test]
    fn test_orientation() {
        assert_eq!(Orientation::from_dimensions(1080, 1920), Orientation::Portrait);
        assert_eq!(Orientation::from_dimensions(1920, 1080), Orientation::Landscape);
        assert_eq!(Orientation::from_dimensions(720, 720), Orientation::Landscape);
    }

    #[test]
    fn test_new_record_is_uploading() {
        let record = VideoRecord::new(VideoId::from("v1"), "user-1").with_source_file("in/v1.mp4");
        assert_eq!(record.status, VideoStatus::Uploading);
        assert_eq!(record.source_file, "in/v1.mp4");
        assert!(record.manifest_url.is_none());
    }
}
