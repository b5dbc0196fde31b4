//! Job definitions for queue processing.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ModelError, ModelResult};

/// Default number of retries a job gets before it is dead-lettered.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type of job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Analyze a single todo with the AI provider
    TaskAnalysis,
    /// Re-run analysis over all of a user's open todos
    ReprocessUser,
    /// Recompute a user's tag statistics
    TagAnalysis,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::TaskAnalysis => "task_analysis",
            JobType::ReprocessUser => "reprocess_user",
            JobType::TagAnalysis => "tag_analysis",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of background work.
///
/// `not_before` / `not_after` bound the window in which the job may run.
/// A job outside its window is never dispatched to a processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,

    /// Job type
    #[serde(rename = "type")]
    pub job_type: JobType,

    /// Owner of the work
    pub user_id: String,

    /// Target todo (required for `task_analysis`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub todo_id: Option<String>,

    /// Earliest processing instant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,

    /// Latest processing instant; the job expires afterwards
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub metadata: HashMap<String, String>,

    pub created_at: DateTime<Utc>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Job {
    /// Create a new job with default retry settings.
    pub fn new(job_type: JobType, user_id: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            job_type,
            user_id: user_id.into(),
            todo_id: None,
            not_before: None,
            not_after: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Job analyzing one todo.
    pub fn task_analysis(user_id: impl Into<String>, todo_id: impl Into<String>) -> Self {
        Self::new(JobType::TaskAnalysis, user_id).with_todo(todo_id)
    }

    /// Job re-analyzing all of a user's open todos.
    pub fn reprocess_user(user_id: impl Into<String>) -> Self {
        Self::new(JobType::ReprocessUser, user_id)
    }

    /// Job recomputing a user's tag statistics.
    pub fn tag_analysis(user_id: impl Into<String>) -> Self {
        Self::new(JobType::TagAnalysis, user_id)
    }

    /// Replace the random id, e.g. with one derived from what the job covers.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = JobId::from_string(id);
        self
    }

    pub fn with_todo(mut self, todo_id: impl Into<String>) -> Self {
        self.todo_id = Some(todo_id.into());
        self
    }

    pub fn with_not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    pub fn with_not_after(mut self, at: DateTime<Utc>) -> Self {
        self.not_after = Some(at);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// True if `now` lies inside the job's eligibility window.
    pub fn is_eligible_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_premature_at(now) && !self.is_expired_at(now)
    }

    /// True if the job must not run before a later instant.
    pub fn is_premature_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before.is_some_and(|nb| now < nb)
    }

    /// True if the job's `not_after` has passed.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.not_after.is_some_and(|na| now > na)
    }

    /// Time remaining until `not_before`, if it lies in the future.
    pub fn delay_from(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.not_before
            .and_then(|nb| (nb - now).to_std().ok())
            .filter(|d| !d.is_zero())
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn increment_retry(&mut self) {
        self.retry_count = self.retry_count.saturating_add(1);
    }

    /// Clone this job for a delayed retry: fresh id, one more retry, and a
    /// `not_before` of `now + delay`.
    pub fn reschedule(&self, delay: Duration, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.id = JobId::new();
        next.increment_retry();
        next.not_before = Some(now + to_chrono(delay));
        next
    }

    /// Reject jobs that can never be processed.
    pub fn validate(&self) -> ModelResult<()> {
        if self.user_id.trim().is_empty() {
            return Err(ModelError::invalid_job(format!("job {} has no user_id", self.id)));
        }
        if self.job_type == JobType::TaskAnalysis && self.todo_id.as_deref().map_or(true, str::is_empty) {
            return Err(ModelError::invalid_job(format!(
                "task_analysis job {} has no todo_id",
                self.id
            )));
        }
        Ok(())
    }
}

/// Convert a std duration into a chrono one, saturating at ten years.
pub fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(3650))
}
