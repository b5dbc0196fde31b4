//! Queue configuration and broker topology.

use std::time::Duration;

/// Routing key every job is published under.
pub const JOBS_ROUTING_KEY: &str = "jobs";

/// Queue configuration.
///
/// The names mirror the broker topology: jobs published with routing key
/// `routing_key` land on `stream_name`; rejected ones are routed to
/// `dlq_stream_name`; jobs with a future `not_before` wait in
/// `delayed_set_name` until due.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Main job stream
    pub stream_name: String,
    /// Consumer group name
    pub consumer_group: String,
    /// Dead letter stream name
    pub dlq_stream_name: String,
    /// Sorted set holding delayed jobs
    pub delayed_set_name: String,
    /// Routing key the main stream is bound to
    pub routing_key: String,
    /// Whether the delayed-delivery path is available
    pub delayed_delivery: bool,
    /// Bound on connect / ping
    pub connect_timeout: Duration,
    /// How long a consumer read blocks waiting for entries
    pub block_timeout: Duration,
    /// Idle time after which a pending delivery is reclaimed
    pub claim_min_idle: Duration,
    /// How often consumers look for reclaimable deliveries
    pub claim_interval: Duration,
    /// Max delayed entries promoted per consumer iteration
    pub promote_batch: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            stream_name: "todoai:jobs".to_string(),
            consumer_group: "todoai:workers".to_string(),
            dlq_stream_name: "todoai:jobs:dlq".to_string(),
            delayed_set_name: "todoai:jobs:delayed".to_string(),
            routing_key: JOBS_ROUTING_KEY.to_string(),
            delayed_delivery: true,
            connect_timeout: Duration::from_secs(10),
            block_timeout: Duration::from_secs(1),
            claim_min_idle: Duration::from_secs(300), // 5 minutes
            claim_interval: Duration::from_secs(30),
            promote_batch: 100,
        }
    }
}

impl QueueConfig {
    /// How often an in-flight delivery resets its idle time, well inside
    /// `claim_min_idle`.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.claim_min_idle / 3).max(Duration::from_millis(100))
    }

    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            stream_name: std::env::var("QUEUE_STREAM").unwrap_or(defaults.stream_name),
            consumer_group: std::env::var("QUEUE_CONSUMER_GROUP")
                .unwrap_or(defaults.consumer_group),
            dlq_stream_name: std::env::var("QUEUE_DLQ_STREAM").unwrap_or(defaults.dlq_stream_name),
            delayed_set_name: std::env::var("QUEUE_DELAYED_SET")
                .unwrap_or(defaults.delayed_set_name),
            routing_key: std::env::var("QUEUE_ROUTING_KEY").unwrap_or(defaults.routing_key),
            delayed_delivery: std::env::var("QUEUE_DELAYED_DELIVERY")
                .ok()
                .and_then(|s| parse_bool(&s))
                .unwrap_or(defaults.delayed_delivery),
            connect_timeout: Duration::from_secs(
                std::env::var("QUEUE_CONNECT_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
            ),
            block_timeout: Duration::from_millis(
                std::env::var("QUEUE_BLOCK_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1000),
            ),
            claim_min_idle: Duration::from_secs(
                std::env::var("QUEUE_CLAIM_MIN_IDLE_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),
            claim_interval: defaults.claim_interval,
            promote_batch: defaults.promote_batch,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
