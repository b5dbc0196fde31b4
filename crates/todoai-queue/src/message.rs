//! Delivered jobs and their acknowledgment handles.

use async_trait::async_trait;
use tokio::sync::mpsc;
use todoai_models::Job;

use crate::error::{QueueError, QueueResult};

/// Broker-side handle for one delivery.
///
/// Each method consumes the handle, so a delivery is settled at most once.
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Remove the delivery permanently.
    async fn ack(self: Box<Self>) -> QueueResult<()>;

    /// Reject the delivery. `requeue` publishes `job` again for another
    /// attempt; otherwise it is routed to the dead-letter destination.
    async fn nack(self: Box<Self>, job: &Job, requeue: bool, reason: &str) -> QueueResult<()>;
}

/// A job delivered by the queue, plus the handle to settle it.
///
/// Dropping a message without settling it leaves the delivery pending on the
/// broker until it is reclaimed.
pub struct Message {
    job: Job,
    delivery_tag: String,
    delivery: Box<dyn Delivery>,
}

impl Message {
    pub fn new(job: Job, delivery_tag: impl Into<String>, delivery: Box<dyn Delivery>) -> Self {
        Self {
            job,
            delivery_tag: delivery_tag.into(),
            delivery,
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Mutable access, e.g. to bump the retry counter before a requeue.
    pub fn job_mut(&mut self) -> &mut Job {
        &mut self.job
    }

    /// Broker identifier of this delivery.
    pub fn delivery_tag(&self) -> &str {
        &self.delivery_tag
    }

    pub async fn ack(self) -> QueueResult<()> {
        self.delivery.ack().await
    }

    pub async fn nack(self, requeue: bool) -> QueueResult<()> {
        let reason = if requeue { "requeued" } else { "rejected" };
        self.nack_with_reason(requeue, reason).await
    }

    pub async fn nack_with_reason(self, requeue: bool, reason: &str) -> QueueResult<()> {
        self.delivery.nack(&self.job, requeue, reason).await
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("delivery_tag", &self.delivery_tag)
            .field("job", &self.job)
            .finish()
    }
}

/// Push-based consumption handle returned by [`crate::JobQueue::consume`].
///
/// `messages` closes when the consumer loop stops; broker errors that did not
/// stop the loop are reported on `errors`.
pub struct Consumer {
    pub messages: mpsc::Receiver<Message>,
    pub errors: mpsc::Receiver<QueueError>,
}

/// Sending half used by queue implementations.
pub(crate) struct ConsumerSink {
    pub messages: mpsc::Sender<Message>,
    pub errors: mpsc::Sender<QueueError>,
}

pub(crate) fn consumer_channel(prefetch: usize) -> (ConsumerSink, Consumer) {
    let (msg_tx, msg_rx) = mpsc::channel(prefetch.max(1));
    let (err_tx, err_rx) = mpsc::channel(16);
    (
        ConsumerSink {
            messages: msg_tx,
            errors: err_tx,
        },
        Consumer {
            messages: msg_rx,
            errors: err_rx,
        },
    )
}

impl ConsumerSink {
    /// Report a non-fatal error; dropped when nobody keeps up with the stream.
    pub fn report(&self, error: QueueError) {
        let _ = self.errors.try_send(error);
    }
}
