//! Queue operations used to settle deliveries.

use async_trait::async_trait;

use vpipe_queue::{Delivery, JobQueue, QueueResult};

/// The settlement seam between the delivery handler and the broker.
#[async_trait]
pub trait DeliverySettler: Send + Sync {
    /// Acknowledge and remove a delivery.
    async fn ack(&self, message_id: &str) -> QueueResult<()>;

    /// Settle without requeue, dead-lettering when the topology allows it.
    async fn reject(&self, delivery: &Delivery, reason: &str) -> QueueResult<()>;
}

#[async_trait]
impl DeliverySettler for JobQueue {
    async fn ack(&self, message_id: &str) -> QueueResult<()> {
        JobQueue::ack(self, message_id).await
    }

    async fn reject(&self, delivery: &Delivery, reason: &str) -> QueueResult<()> {
        JobQueue::reject(self, delivery, reason).await
    }
}
