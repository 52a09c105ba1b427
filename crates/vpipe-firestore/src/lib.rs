//! Firestore REST API client for video records.
//!
//! This crate provides:
//! - A small REST client (get, masked patch) with retry and metrics
//! - Service account authentication via gcp_auth with a shared token cache
//! - `VideoRepository`, the single mutation path for video status

pub mod client;
pub mod error;
pub mod metrics;
pub mod retry;
pub mod token_cache;
pub mod types;
pub mod video_repo;

pub use client::{FirestoreClient, FirestoreConfig};
pub use error::{FirestoreError, FirestoreResult};
pub use retry::RetryConfig;
pub use types::{Document, FromFirestoreValue, ToFirestoreValue, Value};
pub use video_repo::{VideoRepository, DEFAULT_VIDEOS_COLLECTION};
