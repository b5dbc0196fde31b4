//! Task tagging contracts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use todoai_models::{TagStatistics, TimeHorizon};

use crate::error::AiResult;

/// What the model concluded about a todo.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskAnalysis {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub time_horizon: Option<TimeHorizon>,
}

/// Minimal tagging capability every provider offers.
#[async_trait]
pub trait TaskTagger: Send + Sync {
    /// Suggest tags and a time horizon for `text`. `context` is the user's
    /// free-text preferences.
    async fn analyze_task(&self, text: &str, context: Option<&str>) -> AiResult<TaskAnalysis>;

    /// The richer due-date aware capability, when the provider has one.
    fn due_date_capability(&self) -> Option<&dyn DueDateTagger> {
        None
    }
}

/// Tagging that also weighs the due date and the user's existing tags.
#[async_trait]
pub trait DueDateTagger: Send + Sync {
    async fn analyze_task_with_due_date(
        &self,
        text: &str,
        due_date: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
        context: Option<&str>,
        tag_stats: Option<&TagStatistics>,
    ) -> AiResult<TaskAnalysis>;
}
