//! Autoscaling controller for batch transcoding workers.
//!
//! This crate provides:
//! - The poll loop that sizes the batch worker pool from queue backlog
//! - AWS Batch job submission and listing behind the [`BatchCompute`] trait
//! - Queue observation behind the [`QueueInspector`] trait
//! - The HTTP status and trigger API

pub mod batch;
pub mod config;
pub mod controller;
pub mod error;
pub mod handlers;
pub mod inspector;
pub mod metrics;
pub mod routes;
pub mod state;

pub use batch::{AwsBatchClient, BatchCompute};
pub use config::{BatchConfig, ScalerConfig};
pub use controller::{Backends, ScalingController, TriggerOutcome};
pub use error::{ScalerError, ScalerResult};
pub use inspector::{Backlog, QueueInspector, RedisInspector};
pub use routes::create_router;
pub use state::AppState;
