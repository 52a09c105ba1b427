//! Shared data models for the vpipe transcoding pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Video records and their processing status
//! - Transcode job messages carried on the queue
//! - The rendition ladder and encoding constants
//! - Autoscaling metrics and batch worker jobs

pub mod encoding;
pub mod job;
pub mod scaling;
pub mod video;

// Re-export common types
pub use encoding::{EncodingProfile, RenditionTier};
pub use job::{JobValidationError, TranscodeJob};
pub use scaling::{BatchJob, BatchJobStatus, ScaleAction, ScaleActionKind, ScalingMetrics};
pub use video::{Orientation, ReadyUpdate, VideoId, VideoRecord, VideoStatus};
