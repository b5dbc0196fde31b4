//! Settling deliveries.
//!
//! [`settle`] is the only place that acknowledges a processed delivery. It
//! maps a processor outcome onto ack, requeue, dead-letter or a delayed
//! re-enqueue, and owns the retry and backoff policy.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use todoai_models::{Job, JobId};
use todoai_queue::{JobQueue, Message};

use crate::error::{WorkerError, WorkerResult};

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Processed successfully.
    Acked,
    /// Acked and replaced by a delayed copy.
    Rescheduled { job_id: JobId, delay: Duration },
    /// Nacked back onto the queue with its retry counter bumped.
    Requeued,
    /// Routed to the dead-letter queue.
    DeadLettered,
    /// Not yet due; held until `not_before`.
    Deferred,
    /// Past `not_after`; dropped.
    Expired,
}

impl Disposition {
    /// Metric label.
    pub fn outcome(&self) -> &'static str {
        match self {
            Disposition::Acked => "acked",
            Disposition::Rescheduled { .. } => "rescheduled",
            Disposition::Requeued => "requeued",
            Disposition::DeadLettered => "dead_lettered",
            Disposition::Deferred => "deferred",
            Disposition::Expired => "expired",
        }
    }
}

/// The queue to re-enqueue through, if it answers a health check.
async fn reachable(queue: Option<&dyn JobQueue>) -> Option<&dyn JobQueue> {
    let queue = queue?;
    match queue.health_check().await {
        Ok(()) => Some(queue),
        Err(e) => {
            warn!("Queue unreachable for re-enqueue: {}", e);
            None
        }
    }
}

/// Ack `msg` and publish a copy due after `delay`.
async fn reschedule(
    msg: Message,
    queue: &dyn JobQueue,
    delay: Duration,
    now: DateTime<Utc>,
) -> WorkerResult<Disposition> {
    let next = msg.job().reschedule(delay, now);
    msg.ack().await?;
    queue.enqueue(&next).await?;
    info!(
        job_id = %next.id,
        retry_count = next.retry_count,
        delay_secs = delay.as_secs(),
        "Job rescheduled"
    );
    Ok(Disposition::Rescheduled {
        job_id: next.id,
        delay,
    })
}

async fn dead_letter(msg: Message, reason: &str) -> WorkerResult<Disposition> {
    warn!(job_id = %msg.job().id, reason, "Dead-lettering job");
    msg.nack_with_reason(false, reason).await?;
    Ok(Disposition::DeadLettered)
}

/// Settle a processed delivery.
///
/// `requeue_via` is the queue used for delayed re-enqueues. Returns
/// `Err(RateLimitPacing)` when the consumer should pause before its next job
/// and `Err(MaxRetriesExceeded)` after dead-lettering an exhausted job.
pub async fn settle(
    mut msg: Message,
    outcome: WorkerResult<()>,
    requeue_via: Option<&dyn JobQueue>,
    now: DateTime<Utc>,
) -> WorkerResult<Disposition> {
    let err = match outcome {
        Ok(()) => {
            msg.ack().await?;
            return Ok(Disposition::Acked);
        }
        Err(e) => e,
    };

    let reason = err.to_string();
    let retry_count = msg.job().retry_count;

    if err.is_permanent() {
        return dead_letter(msg, &reason).await;
    }

    if err.is_quota_exhausted() {
        let Some(queue) = reachable(requeue_via).await else {
            return dead_letter(msg, &reason).await;
        };
        let delay = err.retry_delay(retry_count);
        return reschedule(msg, queue, delay, now).await;
    }

    if err.is_rate_limited() {
        if !msg.job().can_retry() {
            return dead_letter(msg, &reason).await;
        }
        let delay = err.retry_delay(retry_count);
        if let Some(queue) = reachable(requeue_via).await {
            return reschedule(msg, queue, delay, now).await;
        }
        msg.job_mut().increment_retry();
        msg.nack_with_reason(true, &reason).await?;
        return Err(WorkerError::RateLimitPacing(delay));
    }

    if msg.job().can_retry() {
        msg.job_mut().increment_retry();
        debug!(
            job_id = %msg.job().id,
            retry_count = msg.job().retry_count,
            max_retries = msg.job().max_retries,
            "Requeueing failed job"
        );
        msg.nack_with_reason(true, &reason).await?;
        return Ok(Disposition::Requeued);
    }

    let job_id = msg.job().id.to_string();
    let max_retries = msg.job().max_retries;
    dead_letter(msg, &reason).await?;
    Err(WorkerError::MaxRetriesExceeded {
        job_id,
        max_retries,
    })
}

/// Hold a delivery whose `not_before` lies in the future.
///
/// With delayed delivery the job is re-published unchanged and the broker
/// holds it. Without it the delivery is acked and re-published from a local
/// timer; that hold does not survive a restart.
pub async fn defer(msg: Message, queue: &Arc<dyn JobQueue>) -> WorkerResult<Disposition> {
    let job = msg.job().clone();

    if queue.supports_delayed_delivery() {
        if let Err(e) = queue.enqueue(&job).await {
            msg.nack(true).await?;
            return Err(e.into());
        }
        msg.ack().await?;
        debug!(job_id = %job.id, "Premature job handed back to delayed delivery");
        return Ok(Disposition::Deferred);
    }

    msg.ack().await?;
    hold_locally(job, Arc::clone(queue));
    Ok(Disposition::Deferred)
}

fn hold_locally(job: Job, queue: Arc<dyn JobQueue>) {
    let delay = job.delay_from(Utc::now()).unwrap_or_default();
    debug!(job_id = %job.id, delay_ms = delay.as_millis() as u64, "Holding premature job locally");
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Err(e) = queue.enqueue(&job).await {
            warn!(job_id = %job.id, "Failed to re-enqueue held job: {}", e);
        }
    });
}

#[cfg(test)]
#[allow(deprecated)]
mod tests {
    use super::*;
    use todoai_ai::AiError;
    use todoai_queue::MemoryJobQueue;
    use todoai_store::StoreError;

    async fn deliver(queue: &MemoryJobQueue, job: Job) -> Message {
        queue.enqueue(&job).await.unwrap();
        queue.dequeue().await.unwrap().expect("job delivered")
    }

    fn quota() -> WorkerResult<()> {
        Err(AiError::quota_exhausted("quota", None).into())
    }

    fn rate_limited() -> WorkerResult<()> {
        Err(AiError::rate_limited("slow down", None).into())
    }

    #[tokio::test]
    async fn test_success_acks() {
        let queue = MemoryJobQueue::new();
        let msg = deliver(&queue, Job::tag_analysis("u1")).await;

        let d = settle(msg, Ok(()), Some(&queue), Utc::now()).await.unwrap();
        assert_eq!(d, Disposition::Acked);
        assert_eq!(queue.acked_count(), 1);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_quota_acks_once_and_reschedules_clone() {
        let queue = MemoryJobQueue::new();
        let original = Job::task_analysis("u1", "t1");
        let msg = deliver(&queue, original.clone()).await;
        let now = Utc::now();

        let d = settle(msg, quota(), Some(&queue), now).await.unwrap();

        let Disposition::Rescheduled { job_id, delay } = d else {
            panic!("expected reschedule, got {d:?}");
        };
        assert_eq!(delay, Duration::from_secs(3600));
        assert_eq!(queue.acked_count(), 1);
        assert!(queue.dead_letters().is_empty());

        let delayed = queue.delayed_jobs();
        assert_eq!(delayed.len(), 1);
        let clone = &delayed[0];
        assert_eq!(clone.id, job_id);
        assert_ne!(clone.id, original.id);
        assert_eq!(clone.retry_count, original.retry_count + 1);
        assert!(clone.not_before.is_some_and(|t| t > now));
    }

    #[tokio::test]
    async fn test_quota_without_queue_dead_letters() {
        let queue = MemoryJobQueue::new();
        let msg = deliver(&queue, Job::task_analysis("u1", "t1")).await;

        let d = settle(msg, quota(), None, Utc::now()).await.unwrap();
        assert_eq!(d, Disposition::DeadLettered);
        assert_eq!(queue.dead_letters().len(), 1);
        assert_eq!(queue.acked_count(), 0);
    }

    #[tokio::test]
    async fn test_rate_limit_paces_without_queue() {
        let queue = MemoryJobQueue::new();
        let msg = deliver(&queue, Job::task_analysis("u1", "t1")).await;

        let err = settle(msg, rate_limited(), None, Utc::now()).await.unwrap_err();
        assert!(matches!(err, WorkerError::RateLimitPacing(d) if d == Duration::from_secs(30)));

        let requeued = queue.ready_jobs();
        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_rate_limit_reschedules_with_queue() {
        let queue = MemoryJobQueue::new();
        let msg = deliver(&queue, Job::task_analysis("u1", "t1")).await;

        let d = settle(msg, rate_limited(), Some(&queue), Utc::now()).await.unwrap();
        assert!(matches!(d, Disposition::Rescheduled { delay, .. } if delay == Duration::from_secs(30)));
        assert_eq!(queue.delayed_jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_exhausted_dead_letters() {
        let queue = MemoryJobQueue::new();
        let mut job = Job::task_analysis("u1", "t1");
        job.retry_count = job.max_retries;
        let msg = deliver(&queue, job).await;

        let d = settle(msg, rate_limited(), Some(&queue), Utc::now()).await.unwrap();
        assert_eq!(d, Disposition::DeadLettered);
        assert!(queue.delayed_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_generic_failure_retries_then_dead_letters() {
        let queue = MemoryJobQueue::new();
        let failure = || -> WorkerResult<()> { Err(StoreError::unavailable("db down").into()) };
        queue.enqueue(&Job::tag_analysis("u1").with_max_retries(2)).await.unwrap();

        for attempt in 1..=2 {
            let msg = queue.dequeue().await.unwrap().unwrap();
            let d = settle(msg, failure(), Some(&queue), Utc::now()).await.unwrap();
            assert_eq!(d, Disposition::Requeued);
            assert_eq!(queue.ready_jobs()[0].retry_count, attempt);
        }

        let msg = queue.dequeue().await.unwrap().unwrap();
        let err = settle(msg, failure(), Some(&queue), Utc::now()).await.unwrap_err();
        assert!(matches!(err, WorkerError::MaxRetriesExceeded { max_retries: 2, .. }));
        assert!(queue.ready_jobs().is_empty());
        assert_eq!(queue.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_retries() {
        let queue = MemoryJobQueue::new();
        let msg = deliver(&queue, Job::task_analysis("u1", "gone")).await;

        let outcome = Err(StoreError::not_found("todo gone").into());
        let d = settle(msg, outcome, Some(&queue), Utc::now()).await.unwrap();
        assert_eq!(d, Disposition::DeadLettered);
        assert!(queue.dead_letters()[0].reason.contains("not found"));
    }

    #[tokio::test]
    async fn test_defer_with_delayed_delivery() {
        let memory = MemoryJobQueue::new();
        let queue: Arc<dyn JobQueue> = Arc::new(memory.clone());
        let job = Job::tag_analysis("u1");
        memory.enqueue(&job).await.unwrap();
        let msg = memory.dequeue().await.unwrap().unwrap();

        // Became premature after delivery, e.g. a clock skew between workers
        let mut msg = msg;
        msg.job_mut().not_before = Some(Utc::now() + chrono::Duration::hours(1));

        let d = defer(msg, &queue).await.unwrap();
        assert_eq!(d, Disposition::Deferred);
        assert_eq!(memory.acked_count(), 1);
        assert_eq!(memory.delayed_jobs().len(), 1);
        assert_eq!(memory.delayed_jobs()[0].id, job.id);
    }

    #[tokio::test]
    async fn test_defer_without_delayed_delivery_holds_locally() {
        let memory = MemoryJobQueue::without_delayed_delivery();
        let queue: Arc<dyn JobQueue> = Arc::new(memory.clone());
        let job = Job::tag_analysis("u1")
            .with_not_before(Utc::now() + chrono::Duration::milliseconds(50));
        memory.enqueue(&job).await.unwrap();
        let msg = memory.dequeue().await.unwrap().unwrap();

        assert_eq!(defer(msg, &queue).await.unwrap(), Disposition::Deferred);
        assert!(memory.ready_jobs().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let ready = memory.ready_jobs();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, job.id);
    }
}
