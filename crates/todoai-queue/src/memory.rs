//! In-process job queue.
//!
//! Mirrors the Redis topology with local structures: a ready deque for the
//! main queue, a time-ordered heap as the delayed-delivery holding area, and a
//! dead-letter list. Used for local runs and tests.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use todoai_models::{to_chrono, Job};

use crate::config::JOBS_ROUTING_KEY;
use crate::envelope::{Decoded, Envelope};
use crate::error::{QueueError, QueueResult};
use crate::message::{consumer_channel, Consumer, Delivery, Message};
use crate::queue::{DeadLetterPurger, JobQueue};

/// Upper bound on how long an idle consumer sleeps between checks.
const IDLE_WAIT: Duration = Duration::from_millis(500);

/// A dead-lettered entry.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// Raw job payload
    pub payload: String,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Decode the payload, if it is a valid job.
    pub fn job(&self) -> Option<Job> {
        serde_json::from_str(&self.payload).ok()
    }
}

struct DelayedEntry {
    due: DateTime<Utc>,
    seq: u64,
    envelope: Envelope,
}

// Min-heap on (due, seq).
impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for DelayedEntry {}

#[derive(Default)]
struct State {
    ready: VecDeque<Envelope>,
    delayed: BinaryHeap<DelayedEntry>,
    dead: Vec<DeadLetter>,
    seq: u64,
    in_flight: usize,
    acked: u64,
    /// Job id to the end of its `enqueue_once` window
    published_once: HashMap<String, DateTime<Utc>>,
}

impl State {
    fn promote_due(&mut self, now: DateTime<Utc>) {
        while self.delayed.peek().is_some_and(|e| e.due <= now) {
            if let Some(entry) = self.delayed.pop() {
                self.ready.push_back(entry.envelope);
            }
        }
    }

    fn next_due(&self) -> Option<DateTime<Utc>> {
        self.delayed.peek().map(|e| e.due)
    }
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
    shutdown: CancellationToken,
    routing_key: String,
    delayed_delivery: bool,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, envelope: Envelope, due: Option<DateTime<Utc>>) {
        {
            let mut state = self.lock();
            match due {
                Some(due) => {
                    state.seq += 1;
                    let seq = state.seq;
                    state.delayed.push(DelayedEntry { due, seq, envelope });
                }
                None => state.ready.push_back(envelope),
            }
        }
        self.notify.notify_waiters();
    }

    fn dead_letter(&self, payload: String, reason: &str) {
        warn!(reason = %reason, "Routing message to dead-letter queue");
        self.lock().dead.push(DeadLetter {
            payload,
            reason: reason.to_string(),
            dead_lettered_at: Utc::now(),
        });
    }
}

/// Pop the next deliverable message. Expired, malformed and unroutable entries
/// are settled on the way. Returns the next delayed due time when nothing is
/// ready.
fn take_next(
    inner: &Arc<Inner>,
    permit: &mut Option<OwnedSemaphorePermit>,
) -> (Option<Message>, Option<DateTime<Utc>>) {
    loop {
        let now = Utc::now();
        let envelope = {
            let mut state = inner.lock();
            state.promote_due(now);
            match state.ready.pop_front() {
                Some(env) => env,
                None => return (None, state.next_due()),
            }
        };

        match envelope.decode(&inner.routing_key, now) {
            Decoded::Deliver(job) => {
                let tag = {
                    let mut state = inner.lock();
                    state.seq += 1;
                    state.in_flight += 1;
                    format!("mem-{}", state.seq)
                };
                let delivery = MemoryDelivery {
                    inner: Arc::clone(inner),
                    _permit: permit.take(),
                };
                return (Some(Message::new(job, tag, Box::new(delivery))), None);
            }
            Decoded::Expired(job) => {
                debug!(job_id = %job.id, "Dropping expired job");
            }
            Decoded::Malformed(reason) | Decoded::Unroutable(reason) => {
                inner.dead_letter(envelope.job, &reason);
            }
        }
    }
}

struct MemoryDelivery {
    inner: Arc<Inner>,
    _permit: Option<OwnedSemaphorePermit>,
}

#[async_trait]
impl Delivery for MemoryDelivery {
    async fn ack(self: Box<Self>) -> QueueResult<()> {
        let mut state = self.inner.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        state.acked += 1;
        Ok(())
    }

    async fn nack(self: Box<Self>, job: &Job, requeue: bool, reason: &str) -> QueueResult<()> {
        let envelope = Envelope::encode(job, &self.inner.routing_key)?;
        {
            let mut state = self.inner.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        if requeue {
            self.inner.publish(envelope, None);
        } else {
            self.inner.dead_letter(envelope.job, reason);
        }
        Ok(())
    }
}

/// In-process [`JobQueue`].
#[derive(Clone)]
pub struct MemoryJobQueue {
    inner: Arc<Inner>,
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::build(true)
    }

    /// A queue lacking the delayed-delivery path; future jobs are published
    /// immediately.
    pub fn without_delayed_delivery() -> Self {
        Self::build(false)
    }

    fn build(delayed_delivery: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                shutdown: CancellationToken::new(),
                routing_key: JOBS_ROUTING_KEY.to_string(),
                delayed_delivery,
            }),
        }
    }

    /// Publish a raw payload under an arbitrary routing key.
    pub fn publish_raw(&self, routing_key: &str, payload: &str) {
        let envelope = Envelope {
            job: payload.to_string(),
            routing_key: routing_key.to_string(),
            expires_at: None,
            delay_ms: None,
        };
        self.inner.publish(envelope, None);
    }

    /// Jobs visible to consumers right now.
    pub fn ready_jobs(&self) -> Vec<Job> {
        let state = self.inner.lock();
        state
            .ready
            .iter()
            .filter_map(|e| serde_json::from_str(&e.job).ok())
            .collect()
    }

    /// Jobs waiting in the delayed holding area, soonest first.
    pub fn delayed_jobs(&self) -> Vec<Job> {
        let state = self.inner.lock();
        let mut entries: Vec<&DelayedEntry> = state.delayed.iter().collect();
        entries.sort_by_key(|e| (e.due, e.seq));
        entries
            .into_iter()
            .filter_map(|e| serde_json::from_str(&e.envelope.job).ok())
            .collect()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.lock().dead.clone()
    }

    /// Deliveries handed out and not yet settled.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }

    /// Number of acknowledged deliveries.
    pub fn acked_count(&self) -> u64 {
        self.inner.lock().acked
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(QueueError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: &Job) -> QueueResult<()> {
        self.ensure_open()?;
        let now = Utc::now();
        let envelope = Envelope::encode(job, &self.inner.routing_key)?;

        match job.delay_from(now) {
            Some(delay) if self.inner.delayed_delivery => {
                debug!(job_id = %job.id, delay_ms = delay.as_millis() as u64, "Holding delayed job");
                let envelope = envelope.with_delay_ms(delay.as_millis() as u64);
                self.inner.publish(envelope, Some(now + to_chrono(delay)));
            }
            Some(_) => {
                warn!(job_id = %job.id, "Delayed delivery unavailable, publishing immediately");
                self.inner.publish(envelope, None);
            }
            None => self.inner.publish(envelope, None),
        }
        Ok(())
    }

    async fn enqueue_once(&self, job: &Job, window: Duration) -> QueueResult<bool> {
        self.ensure_open()?;
        let now = Utc::now();
        let key = job.id.to_string();
        {
            let mut state = self.inner.lock();
            state.published_once.retain(|_, until| *until > now);
            if state.published_once.contains_key(&key) {
                debug!(job_id = %job.id, "Job already published, skipping");
                return Ok(false);
            }
            state.published_once.insert(key.clone(), now + to_chrono(window));
        }
        if let Err(e) = self.enqueue(job).await {
            self.inner.lock().published_once.remove(&key);
            return Err(e);
        }
        Ok(true)
    }

    async fn consume(&self, prefetch: usize, cancel: CancellationToken) -> QueueResult<Consumer> {
        self.ensure_open()?;
        let prefetch = prefetch.max(1);
        let (sink, consumer) = consumer_channel(prefetch);
        let inner = Arc::clone(&self.inner);
        let semaphore = Arc::new(Semaphore::new(prefetch));

        tokio::spawn(async move {
            let stop = inner.shutdown.clone();
            loop {
                let permit = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = stop.cancelled() => break,
                    permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => break,
                    },
                };
                let mut permit = Some(permit);

                let message = loop {
                    let notified = inner.notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();

                    let (message, next_due) = take_next(&inner, &mut permit);
                    if let Some(message) = message {
                        break Some(message);
                    }

                    let wait = next_due
                        .and_then(|due| (due - Utc::now()).to_std().ok())
                        .map(|d| d.min(IDLE_WAIT))
                        .unwrap_or(IDLE_WAIT);
                    tokio::select! {
                        _ = cancel.cancelled() => break None,
                        _ = stop.cancelled() => break None,
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                };
                let Some(message) = message else { break };

                tokio::select! {
                    slot = sink.messages.reserve() => match slot {
                        Ok(slot) => slot.send(message),
                        Err(_) => {
                            let _ = message.nack(true).await;
                            break;
                        }
                    },
                    _ = cancel.cancelled() => {
                        let _ = message.nack(true).await;
                        break;
                    }
                }
            }
            debug!("Memory consumer stopped");
        });

        Ok(consumer)
    }

    async fn dequeue(&self) -> QueueResult<Option<Message>> {
        self.ensure_open()?;
        let (message, _) = take_next(&self.inner, &mut None);
        Ok(message)
    }

    async fn close(&self) -> QueueResult<()> {
        self.inner.shutdown.cancel();
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn health_check(&self) -> QueueResult<()> {
        self.ensure_open()
    }

    fn supports_delayed_delivery(&self) -> bool {
        self.inner.delayed_delivery
    }
}

#[async_trait]
impl DeadLetterPurger for MemoryJobQueue {
    async fn purge_dead_letters(&self, older_than: Duration) -> QueueResult<u64> {
        let cutoff = Utc::now() - to_chrono(older_than);
        let mut state = self.inner.lock();
        let before = state.dead.len();
        state.dead.retain(|d| d.dead_lettered_at > cutoff);
        Ok((before - state.dead.len()) as u64)
    }
}

#[cfg(test)]
#[allow(deprecated)]
mod tests {
    use super::*;

    async fn recv(consumer: &mut Consumer) -> Message {
        tokio::time::timeout(Duration::from_secs(2), consumer.messages.recv())
            .await
            .expect("timed out waiting for message")
            .expect("consumer closed")
    }

    #[tokio::test]
    async fn test_enqueue_consume_ack() {
        let queue = MemoryJobQueue::new();
        let job = Job::tag_analysis("u1");
        queue.enqueue(&job).await.unwrap();

        let mut consumer = queue.consume(1, CancellationToken::new()).await.unwrap();
        let message = recv(&mut consumer).await;
        assert_eq!(message.job().id, job.id);
        assert_eq!(queue.in_flight(), 1);

        message.ack().await.unwrap();
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.acked_count(), 1);
    }

    #[tokio::test]
    async fn test_delayed_job_held_until_due() {
        let queue = MemoryJobQueue::new();
        let job = Job::tag_analysis("u1")
            .with_not_before(Utc::now() + chrono::Duration::milliseconds(150));
        queue.enqueue(&job).await.unwrap();

        assert!(queue.ready_jobs().is_empty());
        assert_eq!(queue.delayed_jobs().len(), 1);
        assert!(queue.dequeue().await.unwrap().is_none());

        let mut consumer = queue.consume(1, CancellationToken::new()).await.unwrap();
        let message = recv(&mut consumer).await;
        assert_eq!(message.job().id, job.id);
        assert!(Utc::now() >= job.not_before.unwrap());
    }

    #[tokio::test]
    async fn test_without_delayed_delivery_publishes_immediately() {
        let queue = MemoryJobQueue::without_delayed_delivery();
        let job = Job::tag_analysis("u1").with_not_before(Utc::now() + chrono::Duration::hours(1));
        queue.enqueue(&job).await.unwrap();

        assert!(!queue.supports_delayed_delivery());
        assert_eq!(queue.ready_jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_job_disappears() {
        let queue = MemoryJobQueue::new();
        let job = Job::tag_analysis("u1").with_not_after(Utc::now() - chrono::Duration::seconds(1));
        queue.enqueue(&job).await.unwrap();

        assert!(queue.dequeue().await.unwrap().is_none());
        assert!(queue.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_and_unroutable_are_dead_lettered() {
        let queue = MemoryJobQueue::new();
        queue.publish_raw("jobs", "{broken");
        let valid = serde_json::to_string(&Job::tag_analysis("u1")).unwrap();
        queue.publish_raw("elsewhere", &valid);

        assert!(queue.dequeue().await.unwrap().is_none());
        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 2);
        assert!(dead[0].reason.contains("invalid job payload"));
        assert!(dead[1].reason.contains("elsewhere"));
        assert!(dead[1].job().is_some());
    }

    #[tokio::test]
    async fn test_nack_requeue_and_dead_letter() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(&Job::reprocess_user("u1")).await.unwrap();

        let mut message = queue.dequeue().await.unwrap().unwrap();
        message.job_mut().increment_retry();
        message.nack(true).await.unwrap();

        let message = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(message.job().retry_count, 1);
        message.nack(false).await.unwrap();

        assert!(queue.dequeue().await.unwrap().is_none());
        assert_eq!(queue.dead_letters().len(), 1);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_prefetch_bounds_unsettled_deliveries() {
        let queue = MemoryJobQueue::new();
        for i in 0..3 {
            queue.enqueue(&Job::tag_analysis(format!("u{i}"))).await.unwrap();
        }

        let mut consumer = queue.consume(2, CancellationToken::new()).await.unwrap();
        let first = recv(&mut consumer).await;
        let _second = recv(&mut consumer).await;

        let third = tokio::time::timeout(Duration::from_millis(200), consumer.messages.recv()).await;
        assert!(third.is_err(), "third delivery must wait for a free prefetch slot");

        first.ack().await.unwrap();
        let third = recv(&mut consumer).await;
        assert_eq!(third.job().user_id, "u2");
    }

    #[tokio::test]
    async fn test_cancel_stops_consumer() {
        let queue = MemoryJobQueue::new();
        let cancel = CancellationToken::new();
        let mut consumer = queue.consume(1, cancel.clone()).await.unwrap();
        cancel.cancel();

        let closed = tokio::time::timeout(Duration::from_secs(2), consumer.messages.recv()).await;
        assert!(matches!(closed, Ok(None)));
    }

    #[tokio::test]
    async fn test_close_rejects_enqueue() {
        let queue = MemoryJobQueue::new();
        tokio_test::assert_ok!(queue.close().await);
        assert!(matches!(
            queue.enqueue(&Job::tag_analysis("u1")).await,
            Err(QueueError::Closed)
        ));
        tokio_test::assert_err!(queue.health_check().await);
    }

    #[tokio::test]
    async fn test_purge_dead_letters() {
        let queue = MemoryJobQueue::new();
        queue.publish_raw("jobs", "{broken");
        queue.publish_raw("jobs", "{broken");
        assert!(queue.dequeue().await.unwrap().is_none());

        assert_eq!(queue.purge_dead_letters(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(queue.purge_dead_letters(Duration::ZERO).await.unwrap(), 2);
        assert!(queue.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_once_skips_repeats_within_window() {
        let queue = MemoryJobQueue::new();
        let job = Job::reprocess_user("u1").with_id("reprocess:u1:1700000000");

        assert!(queue.enqueue_once(&job, Duration::from_secs(60)).await.unwrap());
        assert!(!queue.enqueue_once(&job, Duration::from_secs(60)).await.unwrap());
        assert_eq!(queue.ready_jobs().len(), 1);

        let other = Job::reprocess_user("u1").with_id("reprocess:u1:1700043200");
        assert!(queue.enqueue_once(&other, Duration::ZERO).await.unwrap());
        assert!(queue.enqueue_once(&other, Duration::ZERO).await.unwrap());
        assert_eq!(queue.ready_jobs().len(), 3);
    }
}
