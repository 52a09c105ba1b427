//! Queue observation seam.

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use vpipe_queue::{JobQueue, QueueConfig};

use crate::error::ScalerResult;

/// What the controller needs to know about the backlog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Backlog {
    /// Messages not yet delivered to any consumer
    pub depth: u64,
    /// Consumers active within the queue's activity window
    pub active_consumers: u32,
}

#[async_trait]
pub trait QueueInspector: Send + Sync {
    async fn backlog(&self) -> ScalerResult<Backlog>;
}

#[async_trait]
impl QueueInspector for JobQueue {
    async fn backlog(&self) -> ScalerResult<Backlog> {
        let stats = match self.stats().await {
            Ok(stats) => stats,
            Err(e) if e.is_connection_error() => {
                warn!("Queue connection lost, reconnecting: {}", e);
                self.reconnect().await?;
                self.stats().await?
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Backlog {
            depth: stats.depth,
            active_consumers: stats.consumers,
        })
    }
}

/// Redis inspector that connects on first use, so the controller starts
/// while the broker is down.
pub struct RedisInspector {
    config: QueueConfig,
    queue: OnceCell<JobQueue>,
}

impl RedisInspector {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            queue: OnceCell::new(),
        }
    }
}

#[async_trait]
impl QueueInspector for RedisInspector {
    async fn backlog(&self) -> ScalerResult<Backlog> {
        let queue = self
            .queue
            .get_or_try_init(|| async {
                let queue = JobQueue::connect(self.config.clone()).await?;
                info!(stream = %self.config.stream_name, "Queue inspector connected");
                Ok::<_, vpipe_queue::QueueError>(queue)
            })
            .await?;
        queue.backlog().await
    }
}
