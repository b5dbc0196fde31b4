//! Job executor.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use todoai_models::Job;
use todoai_queue::{JobQueue, Message};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::disposition::{defer, settle, Disposition};
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics;
use crate::registry::ProcessorRegistry;

/// Consumer-wide pause set after a rate limit.
#[derive(Debug, Default)]
struct Pacing {
    until: Mutex<Option<Instant>>,
}

impl Pacing {
    fn pause(&self, delay: Duration) {
        let until = Instant::now() + delay;
        let mut current = self.until.lock().unwrap_or_else(PoisonError::into_inner);
        if current.map_or(true, |c| c < until) {
            *current = Some(until);
        }
    }

    fn remaining(&self) -> Option<Duration> {
        let current = self.until.lock().unwrap_or_else(PoisonError::into_inner);
        current
            .and_then(|until| until.checked_duration_since(Instant::now()))
            .filter(|d| !d.is_zero())
    }
}

/// State shared by the per-delivery tasks.
struct Shared {
    queue: Arc<dyn JobQueue>,
    registry: Arc<ProcessorRegistry>,
    pacing: Pacing,
    pacing_cap: Duration,
}

/// Pulls deliveries from the queue and runs each in its own task, bounded by
/// the consumer's prefetch.
pub struct JobExecutor {
    config: WorkerConfig,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    worker_name: String,
}

impl JobExecutor {
    pub fn new(config: WorkerConfig, queue: Arc<dyn JobQueue>, registry: ProcessorRegistry) -> Self {
        let shared = Arc::new(Shared {
            queue,
            registry: Arc::new(registry),
            pacing: Pacing::default(),
            pacing_cap: config.rate_limit_pacing,
        });
        Self {
            config,
            shared,
            shutdown: CancellationToken::new(),
            worker_name: format!("worker-{}", Uuid::new_v4()),
        }
    }

    /// Token that stops the executor when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Consume until shutdown, then wait up to `shutdown_timeout` for
    /// in-flight jobs.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            worker = %self.worker_name,
            prefetch = self.config.prefetch,
            "Starting job executor"
        );

        let mut consumer = self
            .shared
            .queue
            .consume(self.config.prefetch, self.shutdown.child_token())
            .await?;
        let tracker = TaskTracker::new();
        let mut errors_open = true;

        loop {
            let message = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping executor");
                    break;
                }
                err = consumer.errors.recv(), if errors_open => {
                    match err {
                        Some(e) => warn!("Consumer error: {}", e),
                        None => errors_open = false,
                    }
                    continue;
                }
                message = consumer.messages.recv() => match message {
                    Some(message) => message,
                    None => {
                        info!("Consumer closed, stopping executor");
                        break;
                    }
                },
            };

            if let Some(wait) = self.shared.pacing.remaining() {
                info!(pause_ms = wait.as_millis() as u64, "Rate limited, pausing dispatch");
                let cancelled = tokio::select! {
                    _ = self.shutdown.cancelled() => true,
                    _ = tokio::time::sleep(wait) => false,
                };
                if cancelled {
                    requeue(message).await;
                    break;
                }
            }

            tracker.spawn(handle_message(Arc::clone(&self.shared), message));
        }

        // Deliveries buffered but never dispatched go back to the queue
        consumer.messages.close();
        while let Ok(message) = consumer.messages.try_recv() {
            requeue(message).await;
        }

        tracker.close();
        info!(in_flight = tracker.len(), "Waiting for in-flight jobs to complete");
        if tokio::time::timeout(self.config.shutdown_timeout, tracker.wait())
            .await
            .is_err()
        {
            warn!(
                in_flight = tracker.len(),
                "Shutdown timeout elapsed with jobs still running"
            );
        }

        info!("Job executor stopped");
        Ok(())
    }
}

async fn requeue(message: Message) {
    let job_id = message.job().id.clone();
    if let Err(e) = message.nack(true).await {
        warn!(job_id = %job_id, "Failed to requeue undispatched job: {}", e);
    }
}

/// Run the processor in its own task so a panic surfaces as a failed
/// outcome and the delivery still gets settled.
async fn dispatch_isolated(registry: &Arc<ProcessorRegistry>, job: Job) -> WorkerResult<()> {
    let registry = Arc::clone(registry);
    let task = tokio::spawn(async move { registry.dispatch(job).await }.in_current_span());
    match task.await {
        Ok(outcome) => outcome,
        Err(e) => Err(WorkerError::ProcessorPanicked(e.to_string())),
    }
}

/// Gate, dispatch and settle one delivery.
async fn handle_message(shared: Arc<Shared>, message: Message) {
    let job = message.job().clone();
    let logger = JobLogger::new(&job);
    let span = logger.create_span();

    async move {
        let job_type = job.job_type.as_str();
        let now = Utc::now();

        let settled = if job.is_expired_at(now) {
            message
                .ack()
                .await
                .map(|_| Disposition::Expired)
                .map_err(WorkerError::from)
        } else if job.is_premature_at(now) {
            defer(message, &shared.queue).await
        } else {
            logger.log_start("dispatching");
            let started = Instant::now();
            let outcome = dispatch_isolated(&shared.registry, job.clone()).await;
            metrics::record_job_duration(job_type, started.elapsed().as_secs_f64());
            if let Err(e) = &outcome {
                logger.log_warning(&format!("processing failed: {}", e));
            }
            settle(message, outcome, Some(shared.queue.as_ref()), Utc::now()).await
        };

        match settled {
            Ok(disposition) => {
                metrics::record_job(job_type, disposition.outcome());
                match disposition {
                    Disposition::Acked => logger.log_completion("acked"),
                    other => logger.log_progress(other.outcome()),
                }
            }
            Err(WorkerError::RateLimitPacing(delay)) => {
                metrics::record_job(job_type, Disposition::Requeued.outcome());
                let pause = delay.min(shared.pacing_cap);
                shared.pacing.pause(pause);
                logger.log_warning(&format!("rate limited, consumer paused for {:?}", pause));
            }
            Err(e @ WorkerError::MaxRetriesExceeded { .. }) => {
                metrics::record_job(job_type, Disposition::DeadLettered.outcome());
                logger.log_error(&e.to_string());
            }
            Err(e) => {
                metrics::record_job(job_type, "settle_failed");
                logger.log_error(&format!("failed to settle delivery: {}", e));
            }
        }
    }
    .instrument(span)
    .await
}
