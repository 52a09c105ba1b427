//! Worker error types.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Source file not found: {0}")]
    SourceNotFound(String),

    #[error("{0}")]
    LimitExceeded(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Reconnect failed after {attempts} attempts: {message}")]
    ReconnectExhausted { attempts: u32, message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] vpipe_storage::StorageError),

    #[error("Firestore error: {0}")]
    Firestore(#[from] vpipe_firestore::FirestoreError),

    #[error("Media error: {0}")]
    Media(#[from] vpipe_media::MediaError),

    #[error("Queue error: {0}")]
    Queue(#[from] vpipe_queue::QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn source_not_found(path: impl Into<String>) -> Self {
        Self::SourceNotFound(path.into())
    }

    pub fn limit_exceeded(msg: impl Into<String>) -> Self {
        Self::LimitExceeded(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Infrastructure errors worth another attempt on a later delivery.
    ///
    /// Problems with the video itself (missing source, invalid media, limits)
    /// are never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            WorkerError::Storage(e) => e.is_transient(),
            WorkerError::Firestore(e) => e.is_retryable(),
            WorkerError::Queue(_) => true,
            _ => false,
        }
    }

    /// Message stored on a failed video record.
    pub fn user_message(&self) -> String {
        match self {
            WorkerError::Media(e) => e.user_message(),
            other => other.to_string(),
        }
    }
}
