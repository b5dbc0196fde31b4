//! Job queue with delayed delivery and dead-lettering.
//!
//! This crate provides:
//! - The [`JobQueue`] contract and settle-once [`Message`] deliveries
//! - A Redis Streams backend with a delayed-delivery sorted set and DLQ stream
//! - An in-process backend with the same semantics
//! - The [`DeadLetterPurger`] contract used by the garbage collector

pub mod config;
mod envelope;
pub mod error;
pub mod memory;
pub mod message;
pub mod queue;
pub mod redis_queue;

pub use config::{QueueConfig, JOBS_ROUTING_KEY};
pub use error::{QueueError, QueueResult};
pub use memory::{DeadLetter, MemoryJobQueue};
pub use message::{Consumer, Delivery, Message};
pub use queue::{DeadLetterPurger, JobQueue};
pub use redis_queue::RedisJobQueue;
