//! Job queue using Redis Streams.
//!
//! Topology:
//! - `stream_name` is the main queue, bound to `routing_key` and read through
//!   a consumer group; entries carry `job`, `routing_key` and, when the job has
//!   a `not_after`, an `expires_at` header.
//! - `dlq_stream_name` receives rejected entries with `reason` and
//!   `original_id`. Stream ids encode the time of dead-lettering.
//! - `delayed_set_name` holds jobs whose `not_before` lies in the future,
//!   scored by due time. Consumers move due entries onto the main stream with
//!   an atomic script before each read.
//!
//! `{stream_name}:once:{job_id}` keys expire with their window and mark jobs
//! published through `enqueue_once`.
//!
//! Entries left pending longer than `claim_min_idle` are reclaimed by other
//! consumers. While a delivery is unsettled its owner re-claims the entry for
//! itself every `heartbeat_interval()`, which resets the idle time, so only
//! deliveries of dead consumers go stale.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamAutoClaimReply, StreamId, StreamReadReply};
use redis::Script;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;
use todoai_models::Job;

use crate::config::QueueConfig;
use crate::envelope::{Decoded, Envelope};
use crate::error::{QueueError, QueueResult};
use crate::message::{consumer_channel, Consumer, ConsumerSink, Delivery, Message};
use crate::queue::{DeadLetterPurger, JobQueue};

/// Most entries a consumer asks for in one read.
const MAX_READ_BATCH: usize = 32;

/// Pause after a failed read before trying again.
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(2);

const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, member in ipairs(due) do
    local env = cjson.decode(member)
    local fields = {'job', env['job'], 'routing_key', env['routing_key']}
    if env['expires_at'] then
        table.insert(fields, 'expires_at')
        table.insert(fields, env['expires_at'])
    end
    if env['x-delay'] then
        table.insert(fields, 'x-delay')
        table.insert(fields, env['x-delay'])
    end
    redis.call('XADD', KEYS[2], '*', unpack(fields))
    redis.call('ZREM', KEYS[1], member)
end
return #due
"#;

/// Run a broker operation under a deadline.
async fn bounded<T, E, F>(limit: Duration, operation: &str, fut: F) -> QueueResult<T>
where
    F: Future<Output = Result<T, E>>,
    QueueError: From<E>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(QueueError::from),
        Err(_) => Err(QueueError::timeout(limit, operation)),
    }
}

fn add_xadd(pipe: &mut redis::Pipeline, stream: &str, envelope: &Envelope) {
    pipe.cmd("XADD")
        .arg(stream)
        .arg("*")
        .arg("job")
        .arg(&envelope.job)
        .arg("routing_key")
        .arg(&envelope.routing_key);
    if let Some(expires_at) = &envelope.expires_at {
        pipe.arg("expires_at").arg(expires_at);
    }
    if let Some(delay) = &envelope.delay_ms {
        pipe.arg("x-delay").arg(delay);
    }
    pipe.ignore();
}

fn add_remove(pipe: &mut redis::Pipeline, config: &QueueConfig, entry_id: &str) {
    pipe.cmd("XACK")
        .arg(&config.stream_name)
        .arg(&config.consumer_group)
        .arg(entry_id)
        .ignore();
    pipe.cmd("XDEL")
        .arg(&config.stream_name)
        .arg(entry_id)
        .ignore();
}

fn envelope_from_entry(entry: &StreamId) -> Envelope {
    Envelope {
        job: entry.get::<String>("job").unwrap_or_default(),
        routing_key: entry.get::<String>("routing_key").unwrap_or_default(),
        expires_at: entry.get::<String>("expires_at"),
        delay_ms: entry.get::<String>("x-delay"),
    }
}

/// Publisher-side state shared by the queue, its consumers and deliveries.
#[derive(Clone)]
struct Shared {
    publisher: MultiplexedConnection,
    config: Arc<QueueConfig>,
}

impl Shared {
    async fn publish(&self, envelope: &Envelope) -> QueueResult<()> {
        let mut conn = self.publisher.clone();
        let mut pipe = redis::pipe();
        add_xadd(&mut pipe, &self.config.stream_name, envelope);
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn ack_entry(&self, entry_id: &str) -> QueueResult<()> {
        let mut conn = self.publisher.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        add_remove(&mut pipe, &self.config, entry_id);
        let _: () = pipe.query_async(&mut conn).await?;
        debug!(entry_id = %entry_id, "Acknowledged entry");
        Ok(())
    }

    async fn requeue_entry(&self, entry_id: &str, envelope: &Envelope) -> QueueResult<()> {
        let mut conn = self.publisher.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        add_xadd(&mut pipe, &self.config.stream_name, envelope);
        add_remove(&mut pipe, &self.config, entry_id);
        let _: () = pipe.query_async(&mut conn).await?;
        debug!(entry_id = %entry_id, "Requeued entry");
        Ok(())
    }

    async fn dead_letter_entry(&self, entry_id: &str, payload: &str, reason: &str) -> QueueResult<()> {
        let mut conn = self.publisher.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("XADD")
            .arg(&self.config.dlq_stream_name)
            .arg("*")
            .arg("job")
            .arg(payload)
            .arg("reason")
            .arg(reason)
            .arg("original_id")
            .arg(entry_id)
            .ignore();
        add_remove(&mut pipe, &self.config, entry_id);
        let _: () = pipe.query_async(&mut conn).await?;
        warn!(entry_id = %entry_id, reason = %reason, "Moved entry to DLQ");
        Ok(())
    }

    /// Reset the idle time of a pending entry owned by `consumer`. Returns
    /// false once the entry is no longer pending.
    async fn touch_entry(&self, consumer: &str, entry_id: &str) -> QueueResult<bool> {
        let mut conn = self.publisher.clone();
        let claimed: Vec<String> = redis::cmd("XCLAIM")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg(0)
            .arg(entry_id)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await?;
        Ok(!claimed.is_empty())
    }

    /// Move due delayed jobs onto the main stream.
    async fn promote_due(&self, conn: &mut MultiplexedConnection) -> QueueResult<u64> {
        let promoted: u64 = Script::new(PROMOTE_SCRIPT)
            .key(&self.config.delayed_set_name)
            .key(&self.config.stream_name)
            .arg(Utc::now().timestamp_millis())
            .arg(self.config.promote_batch)
            .invoke_async(conn)
            .await?;
        if promoted > 0 {
            debug!(promoted, "Promoted delayed jobs");
        }
        Ok(promoted)
    }

    async fn read_group(
        &self,
        conn: &mut MultiplexedConnection,
        consumer_name: &str,
        count: usize,
        block: Option<Duration>,
    ) -> QueueResult<Vec<StreamId>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(consumer_name)
            .arg("COUNT")
            .arg(count);
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }
        cmd.arg("STREAMS").arg(&self.config.stream_name).arg(">");

        let reply: Option<StreamReadReply> = cmd.query_async(conn).await?;
        Ok(reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default())
    }

    async fn auto_claim(
        &self,
        conn: &mut MultiplexedConnection,
        consumer_name: &str,
        min_idle: Duration,
        count: usize,
    ) -> QueueResult<Vec<StreamId>> {
        let reply: StreamAutoClaimReply = redis::cmd("XAUTOCLAIM")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(consumer_name)
            .arg(min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(conn)
            .await?;
        if !reply.claimed.is_empty() {
            info!(count = reply.claimed.len(), "Claimed pending entries from idle consumers");
        }
        Ok(reply.claimed)
    }

    /// Turn a stream entry into a message, settling entries that must not be
    /// delivered.
    async fn admit(
        &self,
        entry: StreamId,
        consumer: &str,
        permit: Option<OwnedSemaphorePermit>,
    ) -> QueueResult<Option<Message>> {
        let envelope = envelope_from_entry(&entry);
        match envelope.decode(&self.config.routing_key, Utc::now()) {
            Decoded::Deliver(job) => {
                debug!(job_id = %job.id, entry_id = %entry.id, "Consumed job from stream");
                let delivery = RedisDelivery {
                    shared: self.clone(),
                    entry_id: entry.id.clone(),
                    _heartbeat: keep_alive(self.clone(), consumer.to_string(), entry.id.clone()),
                    _permit: permit,
                };
                Ok(Some(Message::new(job, entry.id, Box::new(delivery))))
            }
            Decoded::Expired(job) => {
                debug!(job_id = %job.id, "Dropping expired job");
                self.ack_entry(&entry.id).await?;
                Ok(None)
            }
            Decoded::Malformed(reason) | Decoded::Unroutable(reason) => {
                self.dead_letter_entry(&entry.id, &envelope.job, &reason).await?;
                Ok(None)
            }
        }
    }
}

/// Refresh an in-flight entry until the returned guard is dropped.
fn keep_alive(shared: Shared, consumer: String, entry_id: String) -> DropGuard {
    let token = CancellationToken::new();
    let settled = token.clone();
    let every = shared.config.heartbeat_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        loop {
            tokio::select! {
                _ = settled.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match shared.touch_entry(&consumer, &entry_id).await {
                Ok(true) => debug!(entry_id = %entry_id, "Refreshed in-flight entry"),
                Ok(false) => break,
                Err(e) => warn!(entry_id = %entry_id, error = %e, "Failed to refresh in-flight entry"),
            }
        }
    });
    token.drop_guard()
}

struct RedisDelivery {
    shared: Shared,
    entry_id: String,
    _heartbeat: DropGuard,
    _permit: Option<OwnedSemaphorePermit>,
}

#[async_trait]
impl Delivery for RedisDelivery {
    async fn ack(self: Box<Self>) -> QueueResult<()> {
        self.shared
            .ack_entry(&self.entry_id)
            .await
            .map_err(|e| QueueError::AckFailed(e.to_string()))
    }

    async fn nack(self: Box<Self>, job: &Job, requeue: bool, reason: &str) -> QueueResult<()> {
        let envelope = Envelope::encode(job, &self.shared.config.routing_key)?;
        let result = if requeue {
            self.shared.requeue_entry(&self.entry_id, &envelope).await
        } else {
            self.shared
                .dead_letter_entry(&self.entry_id, &envelope.job, reason)
                .await
        };
        result.map_err(|e| QueueError::AckFailed(e.to_string()))
    }
}

/// Redis Streams [`JobQueue`].
pub struct RedisJobQueue {
    client: redis::Client,
    shared: Shared,
    shutdown: CancellationToken,
    poller_name: String,
}

impl RedisJobQueue {
    /// Connect and make sure the consumer group exists.
    pub async fn connect(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let publisher = bounded(
            config.connect_timeout,
            "connect",
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|e| QueueError::connection_failed(e.to_string()))?;

        let queue = Self {
            client,
            shared: Shared {
                publisher,
                config: Arc::new(config),
            },
            shutdown: CancellationToken::new(),
            poller_name: format!("poller-{}", Uuid::new_v4()),
        };
        queue.init().await?;
        Ok(queue)
    }

    /// Create from environment variables.
    pub async fn from_env() -> QueueResult<Self> {
        Self::connect(QueueConfig::from_env()).await
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Create the consumer group if it does not exist yet.
    async fn init(&self) -> QueueResult<()> {
        let config = &self.shared.config;
        let mut conn = self.shared.publisher.clone();

        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&config.stream_name)
            .arg(&config.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!("Created consumer group: {}", config.consumer_group),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("Consumer group already exists: {}", config.consumer_group);
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }

        if !config.delayed_delivery {
            warn!("Delayed delivery disabled; future jobs are published immediately");
        }
        Ok(())
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    /// Main stream length.
    pub async fn len(&self) -> QueueResult<u64> {
        let mut conn = self.shared.publisher.clone();
        let len: u64 = redis::cmd("XLEN")
            .arg(&self.shared.config.stream_name)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    /// Dead letter stream length.
    pub async fn dlq_len(&self) -> QueueResult<u64> {
        let mut conn = self.shared.publisher.clone();
        let len: u64 = redis::cmd("XLEN")
            .arg(&self.shared.config.dlq_stream_name)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    /// Number of jobs waiting for their `not_before`.
    pub async fn delayed_len(&self) -> QueueResult<u64> {
        let mut conn = self.shared.publisher.clone();
        let len: u64 = redis::cmd("ZCARD")
            .arg(&self.shared.config.delayed_set_name)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    /// Reclaim deliveries left pending by crashed consumers.
    pub async fn claim_pending(&self, min_idle: Duration, count: usize) -> QueueResult<Vec<Message>> {
        self.ensure_open()?;
        let mut conn = self.shared.publisher.clone();
        let entries = self
            .shared
            .auto_claim(&mut conn, &self.poller_name, min_idle, count)
            .await?;
        let mut messages = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Some(message) = self.shared.admit(entry, &self.poller_name, None).await? {
                messages.push(message);
            }
        }
        Ok(messages)
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: &Job) -> QueueResult<()> {
        self.ensure_open()?;
        let config = &self.shared.config;
        let now = Utc::now();
        let envelope = Envelope::encode(job, &config.routing_key)?;

        match job.delay_from(now) {
            Some(delay) if config.delayed_delivery => {
                let delay_ms = delay.as_millis() as u64;
                let due_ms = now.timestamp_millis() + delay_ms as i64;
                let member = serde_json::to_string(&envelope.with_delay_ms(delay_ms))?;
                let mut conn = self.shared.publisher.clone();
                let _: () = redis::cmd("ZADD")
                    .arg(&config.delayed_set_name)
                    .arg(due_ms)
                    .arg(member)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| QueueError::enqueue_failed(e.to_string()))?;
                info!(job_id = %job.id, job_type = %job.job_type, delay_ms, "Enqueued delayed job");
            }
            delay => {
                if delay.is_some() {
                    warn!(job_id = %job.id, "Delayed delivery unavailable, publishing immediately");
                }
                self.shared
                    .publish(&envelope)
                    .await
                    .map_err(|e| QueueError::enqueue_failed(e.to_string()))?;
                info!(job_id = %job.id, job_type = %job.job_type, "Enqueued job");
            }
        }
        Ok(())
    }

    async fn enqueue_once(&self, job: &Job, window: Duration) -> QueueResult<bool> {
        self.ensure_open()?;
        let key = format!("{}:once:{}", self.shared.config.stream_name, job.id);
        let mut conn = self.shared.publisher.clone();
        let marked: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(Utc::now().timestamp_millis())
            .arg("NX")
            .arg("PX")
            .arg((window.as_millis() as u64).max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::enqueue_failed(e.to_string()))?;
        if marked.is_none() {
            debug!(job_id = %job.id, "Job already published, skipping");
            return Ok(false);
        }

        if let Err(e) = self.enqueue(job).await {
            let cleared: Result<(), redis::RedisError> =
                redis::cmd("DEL").arg(&key).query_async(&mut conn).await;
            if let Err(del) = cleared {
                warn!(job_id = %job.id, error = %del, "Failed to clear publish marker");
            }
            return Err(e);
        }
        Ok(true)
    }

    async fn consume(&self, prefetch: usize, cancel: CancellationToken) -> QueueResult<Consumer> {
        self.ensure_open()?;
        let prefetch = prefetch.max(1);
        let config = Arc::clone(&self.shared.config);

        // Blocking reads get their own connection so publishing never waits on them.
        let conn = bounded(
            config.connect_timeout,
            "consumer connect",
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|e| QueueError::connection_failed(e.to_string()))?;

        let (sink, consumer) = consumer_channel(prefetch);
        let run = ConsumerLoop {
            shared: self.shared.clone(),
            conn,
            name: format!("worker-{}", Uuid::new_v4()),
            semaphore: Arc::new(Semaphore::new(prefetch)),
            sink,
            cancel,
            stop: self.shutdown.clone(),
        };
        info!(consumer = %run.name, prefetch, "Starting stream consumer");
        tokio::spawn(run.run());
        Ok(consumer)
    }

    async fn dequeue(&self) -> QueueResult<Option<Message>> {
        self.ensure_open()?;
        let mut conn = self.shared.publisher.clone();
        loop {
            let mut entries = self
                .shared
                .read_group(&mut conn, &self.poller_name, 1, None)
                .await
                .map_err(|e| QueueError::dequeue_failed(e.to_string()))?;
            let Some(entry) = entries.pop() else {
                return Ok(None);
            };
            if let Some(message) = self.shared.admit(entry, &self.poller_name, None).await? {
                return Ok(Some(message));
            }
        }
    }

    async fn close(&self) -> QueueResult<()> {
        self.shutdown.cancel();
        info!("Job queue closed");
        Ok(())
    }

    async fn health_check(&self) -> QueueResult<()> {
        self.ensure_open()?;
        let mut conn = self.shared.publisher.clone();
        let _: String = bounded(
            self.shared.config.connect_timeout,
            "ping",
            redis::cmd("PING").query_async(&mut conn),
        )
        .await?;
        Ok(())
    }

    fn supports_delayed_delivery(&self) -> bool {
        self.shared.config.delayed_delivery
    }
}

#[async_trait]
impl DeadLetterPurger for RedisJobQueue {
    async fn purge_dead_letters(&self, older_than: Duration) -> QueueResult<u64> {
        let cutoff_ms = Utc::now().timestamp_millis() - older_than.as_millis() as i64;
        let mut conn = self.shared.publisher.clone();
        let removed: u64 = redis::cmd("XTRIM")
            .arg(&self.shared.config.dlq_stream_name)
            .arg("MINID")
            .arg(cutoff_ms.max(0))
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }
}

/// State of one running stream consumer.
struct ConsumerLoop {
    shared: Shared,
    conn: MultiplexedConnection,
    name: String,
    semaphore: Arc<Semaphore>,
    sink: ConsumerSink,
    cancel: CancellationToken,
    stop: CancellationToken,
}

impl ConsumerLoop {
    fn stopping(&self) -> bool {
        self.cancel.is_cancelled() || self.stop.is_cancelled()
    }

    async fn run(mut self) {
        let config = Arc::clone(&self.shared.config);
        let mut last_claim: Option<Instant> = None;

        loop {
            let first = tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.stop.cancelled() => break,
                permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let mut permits = vec![first];
            while permits.len() < MAX_READ_BATCH {
                match Arc::clone(&self.semaphore).try_acquire_owned() {
                    Ok(p) => permits.push(p),
                    Err(_) => break,
                }
            }

            if config.delayed_delivery {
                if let Err(e) = self.shared.promote_due(&mut self.conn).await {
                    warn!(consumer = %self.name, error = %e, "Failed to promote delayed jobs");
                    self.sink.report(e);
                }
            }

            let mut entries = Vec::new();
            if last_claim.map_or(true, |t| t.elapsed() >= config.claim_interval) {
                last_claim = Some(Instant::now());
                match self
                    .shared
                    .auto_claim(&mut self.conn, &self.name, config.claim_min_idle, permits.len())
                    .await
                {
                    Ok(claimed) => entries = claimed,
                    Err(e) => {
                        warn!(consumer = %self.name, error = %e, "Failed to claim pending entries");
                        self.sink.report(e);
                    }
                }
            }

            if entries.is_empty() {
                match self
                    .shared
                    .read_group(&mut self.conn, &self.name, permits.len(), Some(config.block_timeout))
                    .await
                {
                    Ok(read) => entries = read,
                    Err(e) => {
                        warn!(consumer = %self.name, error = %e, "Failed to read from stream");
                        self.sink.report(e);
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = self.stop.cancelled() => break,
                            _ = tokio::time::sleep(READ_ERROR_BACKOFF) => continue,
                        }
                    }
                }
            }

            for entry in entries {
                let message = match self.shared.admit(entry, &self.name, permits.pop()).await {
                    Ok(Some(message)) => message,
                    Ok(None) => continue,
                    Err(e) => {
                        self.sink.report(e);
                        continue;
                    }
                };
                self.forward(message).await;
            }

            if self.stopping() {
                break;
            }
        }
        info!(consumer = %self.name, "Stream consumer stopped");
    }

    /// Hand a message to the receiver, requeueing it when that is no longer
    /// possible.
    async fn forward(&self, message: Message) {
        if self.stopping() {
            self.requeue(message).await;
            return;
        }
        tokio::select! {
            slot = self.sink.messages.reserve() => match slot {
                Ok(slot) => slot.send(message),
                Err(_) => self.requeue(message).await,
            },
            _ = self.cancel.cancelled() => self.requeue(message).await,
        }
    }

    async fn requeue(&self, message: Message) {
        let tag = message.delivery_tag().to_string();
        if let Err(e) = message.nack(true).await {
            warn!(entry_id = %tag, error = %e, "Failed to requeue undelivered message");
        }
    }
}
