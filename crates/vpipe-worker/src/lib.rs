//! Transcoding worker.
//!
//! Consumes transcode jobs from the Redis Streams queue, runs the HLS
//! pipeline and finalizes video records. Exposes the pieces the binary wires
//! together so they can be exercised with fakes.

pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod processor;
pub mod retry;
pub mod settle;
pub mod store;

pub use config::{ProcessorConfig, WorkerConfig};
pub use error::{WorkerError, WorkerResult};
pub use executor::{connect_queue, DeliveryHandler, DeliveryLimits, ExitReason, JobExecutor};
pub use processor::{Disposition, JobOutcome, JobProcessor};
pub use settle::DeliverySettler;
pub use store::VideoStore;
