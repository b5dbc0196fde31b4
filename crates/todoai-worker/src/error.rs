//! Worker error types.

use std::time::Duration;

use thiserror::Error;
use todoai_ai::AiError;
use todoai_queue::QueueError;
use todoai_store::StoreError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Malformed job: {0}")]
    MalformedJob(String),

    #[error("No processor registered for job type '{0}'")]
    UnknownJobType(String),

    /// The consumer should pause before dispatching its next job.
    #[error("Rate limited, pausing consumer for {0:?}")]
    RateLimitPacing(Duration),

    #[error("Processor panicked: {0}")]
    ProcessorPanicked(String),

    #[error("Job {job_id} exceeded max retries ({max_retries})")]
    MaxRetriesExceeded { job_id: String, max_retries: u32 },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("AI error: {0}")]
    Ai(#[from] AiError),
}

impl WorkerError {
    pub fn malformed_job(msg: impl Into<String>) -> Self {
        Self::MalformedJob(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Retrying cannot help; the job goes straight to the dead-letter queue.
    pub fn is_permanent(&self) -> bool {
        match self {
            WorkerError::MalformedJob(_) | WorkerError::UnknownJobType(_) => true,
            WorkerError::Store(e) => e.is_not_found(),
            WorkerError::Ai(AiError::Config(_)) => true,
            _ => false,
        }
    }

    pub fn is_quota_exhausted(&self) -> bool {
        self.ai_error().is_some_and(todoai_ai::is_quota_error)
    }

    pub fn is_rate_limited(&self) -> bool {
        self.ai_error().is_some_and(todoai_ai::is_rate_limit_error)
    }

    pub fn ai_error(&self) -> Option<&AiError> {
        match self {
            WorkerError::Ai(e) => Some(e),
            _ => None,
        }
    }

    /// Backoff before retrying after this error on attempt `retry_count`.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        self.ai_error()
            .map(|e| todoai_ai::retry_delay(e, retry_count))
            .unwrap_or(Duration::ZERO)
    }
}
