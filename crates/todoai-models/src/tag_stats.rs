//! Per-user tag statistics.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::todo::{TagSource, Todo};

/// Usage counters for one tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct TagStat {
    pub total: u64,
    pub ai_count: u64,
    pub user_count: u64,
}

/// Aggregated tag usage for a user.
///
/// `analysis_version` is the optimistic-concurrency token: a write carries the
/// version it was computed from and is rejected when the stored version moved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TagStatistics {
    pub user_id: String,
    #[serde(default)]
    pub tag_stats: HashMap<String, TagStat>,
    /// Statistics are stale and a recomputation is pending.
    #[serde(default)]
    pub tainted: bool,
    #[serde(default)]
    pub analysis_version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_analyzed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TagStatistics {
    /// Empty statistics, as created on first access.
    pub fn empty(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            tag_stats: HashMap::new(),
            tainted: false,
            analysis_version: 0,
            last_analyzed_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Tags ordered by total usage, most used first, ties broken by name.
    pub fn top_tags(&self, limit: usize) -> Vec<(&str, TagStat)> {
        let mut entries: Vec<(&str, TagStat)> =
            self.tag_stats.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        entries.sort_by(|a, b| b.1.total.cmp(&a.1.total).then_with(|| a.0.cmp(b.0)));
        entries.truncate(limit);
        entries
    }
}

/// Rebuild tag counters from scratch over `todos`.
///
/// Every todo counts regardless of status; completed todos still carry
/// historical signal.
pub fn aggregate_tags<'a>(todos: impl IntoIterator<Item = &'a Todo>) -> HashMap<String, TagStat> {
    let mut stats: HashMap<String, TagStat> = HashMap::new();
    for todo in todos {
        for tag in &todo.tags {
            let entry = stats.entry(tag.clone()).or_default();
            entry.total += 1;
            match todo.tag_source(tag) {
                TagSource::Ai => entry.ai_count += 1,
                TagSource::User => entry.user_count += 1,
            }
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::todo::TodoStatus;

    #[test]
    fn test_aggregate_counts_sources() {
        let todos = vec![
            Todo::new("1", "u", "a").with_tag("work", TagSource::Ai),
            Todo::new("2", "u", "b").with_tag("work", TagSource::User),
            Todo::new("3", "u", "c")
                .with_tag("work", TagSource::Ai)
                .with_status(TodoStatus::Completed),
            Todo::new("4", "u", "d").with_tag("home", TagSource::User),
        ];

        let stats = aggregate_tags(&todos);

        assert_eq!(stats["work"], TagStat { total: 3, ai_count: 2, user_count: 1 });
        assert_eq!(stats["home"], TagStat { total: 1, ai_count: 0, user_count: 1 });
    }

    #[test]
    fn test_aggregate_empty() {
        let todos: Vec<Todo> = Vec::new();
        assert!(aggregate_tags(&todos).is_empty());
    }

    #[test]
    fn test_top_tags_order() {
        let mut stats = TagStatistics::empty("u");
        stats.tag_stats.insert("b".into(), TagStat { total: 2, ai_count: 2, user_count: 0 });
        stats.tag_stats.insert("a".into(), TagStat { total: 2, ai_count: 1, user_count: 1 });
        stats.tag_stats.insert("c".into(), TagStat { total: 5, ai_count: 5, user_count: 0 });

        let top: Vec<&str> = stats.top_tags(2).into_iter().map(|(t, _)| t).collect();
        assert_eq!(top, vec!["c", "a"]);
    }
}
