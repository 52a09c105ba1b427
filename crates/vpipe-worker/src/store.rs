//! Video record access used by the processor.

use async_trait::async_trait;

use vpipe_firestore::VideoRepository;
use vpipe_models::{ReadyUpdate, VideoId, VideoRecord};

use crate::error::WorkerResult;

/// The record store seam. Only status fields are ever written.
#[async_trait]
pub trait VideoStore: Send + Sync {
    async fn get(&self, video_id: &VideoId) -> WorkerResult<Option<VideoRecord>>;

    async fn mark_processing(&self, video_id: &VideoId) -> WorkerResult<()>;

    async fn mark_ready(&self, video_id: &VideoId, update: &ReadyUpdate) -> WorkerResult<()>;

    async fn mark_failed(&self, video_id: &VideoId, error_message: &str) -> WorkerResult<()>;
}

#[async_trait]
impl VideoStore for VideoRepository {
    async fn get(&self, video_id: &VideoId) -> WorkerResult<Option<VideoRecord>> {
        Ok(VideoRepository::get(self, video_id).await?)
    }

    async fn mark_processing(&self, video_id: &VideoId) -> WorkerResult<()> {
        Ok(VideoRepository::mark_processing(self, video_id).await?)
    }

    async fn mark_ready(&self, video_id: &VideoId, update: &ReadyUpdate) -> WorkerResult<()> {
        Ok(VideoRepository::mark_ready(self, video_id, update).await?)
    }

    async fn mark_failed(&self, video_id: &VideoId, error_message: &str) -> WorkerResult<()> {
        Ok(VideoRepository::mark_failed(self, video_id, error_message).await?)
    }
}
