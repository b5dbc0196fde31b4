//! Wire envelope shared by the queue backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use todoai_models::Job;

use crate::error::QueueResult;

/// A published job as it travels through the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Envelope {
    /// JSON-encoded [`Job`]
    pub job: String,
    pub routing_key: String,
    /// Expiry in unix milliseconds, derived from `not_after`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    /// Delay in milliseconds, set on the delayed-delivery path
    #[serde(rename = "x-delay", default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<String>,
}

/// Outcome of reading an envelope off the broker.
#[derive(Debug)]
pub(crate) enum Decoded {
    Deliver(Job),
    /// Past its `not_after`; dropped silently.
    Expired(Job),
    /// Body is not a valid job.
    Malformed(String),
    /// Published under a routing key the queue is not bound to.
    Unroutable(String),
}

impl Envelope {
    pub fn encode(job: &Job, routing_key: &str) -> QueueResult<Self> {
        Ok(Self {
            job: serde_json::to_string(job)?,
            routing_key: routing_key.to_string(),
            expires_at: job.not_after.map(|t| t.timestamp_millis().to_string()),
            delay_ms: None,
        })
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = Some(delay_ms.to_string());
        self
    }

    pub fn decode(&self, bound_routing_key: &str, now: DateTime<Utc>) -> Decoded {
        if self.routing_key != bound_routing_key {
            return Decoded::Unroutable(format!("no binding for routing key '{}'", self.routing_key));
        }

        let job: Job = match serde_json::from_str(&self.job) {
            Ok(job) => job,
            Err(e) => return Decoded::Malformed(format!("invalid job payload: {e}")),
        };
        if let Err(e) = job.validate() {
            return Decoded::Malformed(e.to_string());
        }

        let expired_by_header = self
            .expires_at
            .as_deref()
            .and_then(|s| s.parse::<i64>().ok())
            .is_some_and(|ms| now.timestamp_millis() > ms);
        if expired_by_header || job.is_expired_at(now) {
            return Decoded::Expired(job);
        }

        Decoded::Deliver(job)
    }
}
