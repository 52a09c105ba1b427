//! Redis Streams transcode job queue.
//!
//! This crate provides:
//! - Job enqueueing via Redis Streams
//! - Consumer-group consumption with bounded prefetch
//! - Dead-lettering by delivery count and message age
//! - Stale delivery reclaim and queue statistics for autoscaling

pub mod delivery;
pub mod error;
pub mod queue;
pub mod topology;

pub use delivery::{message_timestamp_ms, Delivery, JOB_FIELD};
pub use error::{QueueError, QueueResult};
pub use queue::{JobQueue, QueueConfig, QueueStats};
pub use topology::Topology;
