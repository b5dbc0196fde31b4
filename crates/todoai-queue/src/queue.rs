//! Queue contracts.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use todoai_models::Job;

use crate::error::QueueResult;
use crate::message::{Consumer, Message};

/// A job queue with delayed delivery and dead-lettering.
///
/// Jobs whose `not_before` lies in the future are held by the queue and become
/// visible once due. Jobs carrying `not_after` expire: a consumer drops them
/// instead of delivering them late.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Publish a job.
    async fn enqueue(&self, job: &Job) -> QueueResult<()>;

    /// Publish a job unless a job with the same id went through this method
    /// within the last `window`. Returns whether the job was published.
    async fn enqueue_once(&self, job: &Job, window: Duration) -> QueueResult<bool>;

    /// Start a consumer holding at most `prefetch` unsettled deliveries.
    ///
    /// The consumer stops when `cancel` fires or the queue is closed; any
    /// message it fetched but could not hand over is requeued.
    async fn consume(&self, prefetch: usize, cancel: CancellationToken) -> QueueResult<Consumer>;

    /// Poll for a single message; `None` when the queue is empty.
    #[deprecated(note = "use `consume`, which bounds in-flight deliveries")]
    async fn dequeue(&self) -> QueueResult<Option<Message>>;

    /// Stop accepting jobs and stop all consumers.
    async fn close(&self) -> QueueResult<()>;

    /// Check that the broker is reachable.
    async fn health_check(&self) -> QueueResult<()>;

    /// Whether future `not_before` jobs go through a delayed-delivery path.
    fn supports_delayed_delivery(&self) -> bool;
}

/// Removes dead-lettered entries older than a retention window.
#[async_trait]
pub trait DeadLetterPurger: Send + Sync {
    /// Returns how many entries were removed.
    async fn purge_dead_letters(&self, older_than: Duration) -> QueueResult<u64>;
}
