//! Todo item models.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Todo processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    /// Waiting for AI analysis
    #[default]
    Pending,
    /// Analysis in flight
    Processing,
    /// Analysis applied
    Processed,
    /// Done by the user
    Completed,
}

impl TodoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TodoStatus::Pending => "pending",
            TodoStatus::Processing => "processing",
            TodoStatus::Processed => "processed",
            TodoStatus::Completed => "completed",
        }
    }

    /// Open todos are the ones periodic reprocessing revisits.
    pub fn is_open(&self) -> bool {
        matches!(self, TodoStatus::Pending | TodoStatus::Processing)
    }
}

/// Coarse classification of when a todo should be done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TimeHorizon {
    Next,
    Soon,
    Later,
}

impl TimeHorizon {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeHorizon::Next => "next",
            TimeHorizon::Soon => "soon",
            TimeHorizon::Later => "later",
        }
    }
}

/// Who attached a tag to a todo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum TagSource {
    #[default]
    Ai,
    User,
}

/// A todo as seen by the background workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Todo {
    pub id: String,
    pub user_id: String,
    pub text: String,
    #[serde(default)]
    pub status: TodoStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_horizon: Option<TimeHorizon>,
    /// The user picked the time horizon by hand; analysis must not change it.
    #[serde(default)]
    pub time_horizon_overridden: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Source per tag. Tags missing here count as AI-sourced.
    #[serde(default)]
    pub tag_sources: HashMap<String, TagSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Todo {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>, text: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            user_id: user_id.into(),
            text: text.into(),
            status: TodoStatus::Pending,
            time_horizon: None,
            time_horizon_overridden: false,
            tags: Vec::new(),
            tag_sources: HashMap::new(),
            due_date: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_status(mut self, status: TodoStatus) -> Self {
        self.status = status;
        self
    }

    /// Attach a tag with an explicit source.
    pub fn with_tag(mut self, tag: impl Into<String>, source: TagSource) -> Self {
        let tag = tag.into();
        self.tag_sources.insert(tag.clone(), source);
        self.tags.push(tag);
        self
    }

    pub fn with_due_date(mut self, due: DateTime<Utc>) -> Self {
        self.due_date = Some(due);
        self
    }

    pub fn with_time_horizon(mut self, horizon: TimeHorizon, overridden: bool) -> Self {
        self.time_horizon = Some(horizon);
        self.time_horizon_overridden = overridden;
        self
    }

    /// Source of a tag, defaulting to AI when unknown.
    pub fn tag_source(&self, tag: &str) -> TagSource {
        self.tag_sources.get(tag).copied().unwrap_or_default()
    }

    /// Tags the user wrote themselves, in their original order.
    pub fn user_tags(&self) -> Vec<String> {
        self.tags
            .iter()
            .filter(|t| self.tag_source(t) == TagSource::User)
            .cloned()
            .collect()
    }

    /// Replace AI tags with `suggested`, keeping every user-authored tag.
    ///
    /// User tags come first and win on conflict: a suggestion equal to a user
    /// tag (ignoring case) is dropped rather than re-labelled as AI.
    pub fn merge_ai_tags(&mut self, suggested: &[String]) {
        let user_tags = self.user_tags();
        let mut merged = user_tags.clone();
        let mut sources: HashMap<String, TagSource> = user_tags
            .iter()
            .map(|t| (t.clone(), TagSource::User))
            .collect();

        for tag in suggested {
            let tag = tag.trim();
            if tag.is_empty() {
                continue;
            }
            if merged.iter().any(|m| m.eq_ignore_ascii_case(tag)) {
                continue;
            }
            merged.push(tag.to_string());
            sources.insert(tag.to_string(), TagSource::Ai);
        }

        self.tags = merged;
        self.tag_sources = sources;
    }
}

/// Order-independent, multiset-aware tag comparison. `None` equals empty.
pub fn tags_equal(a: Option<&[String]>, b: Option<&[String]>) -> bool {
    let a = a.unwrap_or_default();
    let b = b.unwrap_or_default();
    if a.len() != b.len() {
        return false;
    }
    let mut counts: HashMap<&str, i64> = HashMap::new();
    for tag in a {
        *counts.entry(tag.as_str()).or_default() += 1;
    }
    for tag in b {
        *counts.entry(tag.as_str()).or_default() -= 1;
    }
    counts.values().all(|c| *c == 0)
}
