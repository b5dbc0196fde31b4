//! Shared data models for the todoai job subsystem.
//!
//! This crate provides Serde-serializable types for:
//! - Queue jobs and their eligibility window
//! - Todos as seen by the AI workers
//! - Per-user tag statistics and their aggregation
//! - User activity and preferences

pub mod error;
pub mod job;
pub mod tag_stats;
pub mod todo;
pub mod user;

pub use error::{ModelError, ModelResult};
pub use job::{to_chrono, Job, JobId, JobType, DEFAULT_MAX_RETRIES};
pub use tag_stats::{aggregate_tags, TagStat, TagStatistics};
pub use todo::{tags_equal, TagSource, TimeHorizon, Todo, TodoStatus};
pub use user::{UserActivity, UserPreferences};
