//! Queue error types.

use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Enqueue failed: {0}")]
    EnqueueFailed(String),

    #[error("Dequeue failed: {0}")]
    DequeueFailed(String),

    #[error("Acknowledgment failed: {0}")]
    AckFailed(String),

    #[error("Timed out after {0:?}: {1}")]
    Timeout(std::time::Duration, String),

    #[error("Queue is closed")]
    Closed,

    #[error("Dead-letter purge failed: {0}")]
    PurgeFailed(#[source] Box<QueueError>),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    pub fn enqueue_failed(msg: impl Into<String>) -> Self {
        Self::EnqueueFailed(msg.into())
    }

    pub fn dequeue_failed(msg: impl Into<String>) -> Self {
        Self::DequeueFailed(msg.into())
    }

    pub fn timeout(after: std::time::Duration, operation: impl Into<String>) -> Self {
        Self::Timeout(after, operation.into())
    }

    /// Wrap a purger failure so the collector can report it as its own.
    pub fn purge_failed(source: QueueError) -> Self {
        Self::PurgeFailed(Box::new(source))
    }
}
