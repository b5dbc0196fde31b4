//! Per-user tag statistics aggregation (`tag_analysis` jobs).

use std::sync::Arc;

use todoai_models::{aggregate_tags, Job, TagStatistics};
use todoai_store::{fetch_all_todos, TagStatisticsRepository, TodoRepository};

use crate::cache::TagStatsCache;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics;

/// Result of one aggregation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagAnalysisOutcome {
    /// Statistics written at `version`.
    Applied { version: i64, tags: usize },
    /// Another writer moved the version first; the next debounced run
    /// converges.
    Conflict,
}

pub struct TagAnalyzer {
    todos: Arc<dyn TodoRepository>,
    tag_stats: Arc<dyn TagStatisticsRepository>,
    cache: Arc<TagStatsCache>,
    page_size: usize,
}

impl TagAnalyzer {
    pub fn new(
        todos: Arc<dyn TodoRepository>,
        tag_stats: Arc<dyn TagStatisticsRepository>,
        cache: Arc<TagStatsCache>,
    ) -> Self {
        Self {
            todos,
            tag_stats,
            cache,
            page_size: 500,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Recount the user's tags over all todos, completed ones included, and
    /// write them with a compare-and-swap on `analysis_version`.
    pub async fn process(&self, job: &Job) -> WorkerResult<TagAnalysisOutcome> {
        job.validate()
            .map_err(|e| WorkerError::malformed_job(e.to_string()))?;
        let logger = JobLogger::new(job);

        let current = self.tag_stats.get_or_create(&job.user_id).await?;
        let todos = fetch_all_todos(self.todos.as_ref(), &job.user_id, self.page_size).await?;

        let update = TagStatistics {
            tag_stats: aggregate_tags(&todos),
            ..current
        };
        let tags = update.tag_stats.len();

        if !self.tag_stats.update_statistics(&update).await? {
            metrics::record_tag_stats_conflict();
            logger.log_warning(&format!(
                "tag statistics version {} is stale, leaving update to the next run",
                update.analysis_version
            ));
            return Ok(TagAnalysisOutcome::Conflict);
        }

        self.cache.invalidate(&job.user_id).await;
        let version = update.analysis_version + 1;
        logger.log_completion(&format!("{} tags over {} todos (version {})", tags, todos.len(), version));
        Ok(TagAnalysisOutcome::Applied { version, tags })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use todoai_models::{TagSource, TagStat, Todo, TodoStatus};
    use todoai_store::{MemoryTagStatisticsRepository, MemoryTodoRepository, StoreResult};

    fn analyzer(
        todos: Arc<MemoryTodoRepository>,
        stats: Arc<dyn TagStatisticsRepository>,
        cache: Arc<TagStatsCache>,
    ) -> TagAnalyzer {
        TagAnalyzer::new(todos, stats, cache).with_page_size(2)
    }

    #[tokio::test]
    async fn test_counts_by_source_including_completed() {
        let todos = Arc::new(MemoryTodoRepository::new());
        todos
            .insert(Todo::new("t1", "u1", "a").with_tag("work", TagSource::Ai))
            .await;
        todos
            .insert(
                Todo::new("t2", "u1", "b")
                    .with_tag("work", TagSource::User)
                    .with_status(TodoStatus::Completed),
            )
            .await;
        todos
            .insert(Todo::new("t3", "u1", "c").with_tag("work", TagSource::Ai).with_tag("home", TagSource::User))
            .await;
        todos
            .insert(Todo::new("other", "u2", "d").with_tag("work", TagSource::Ai))
            .await;

        let stats = Arc::new(MemoryTagStatisticsRepository::new());
        stats.mark_tainted("u1").await.unwrap();
        let cache = Arc::new(TagStatsCache::new(Duration::from_secs(60)));
        cache.insert(TagStatistics::empty("u1")).await;

        let outcome = analyzer(todos, stats.clone(), cache.clone())
            .process(&Job::tag_analysis("u1"))
            .await
            .unwrap();
        assert_eq!(outcome, TagAnalysisOutcome::Applied { version: 1, tags: 2 });

        let stored = stats.snapshot("u1").await.unwrap();
        assert!(!stored.tainted);
        assert_eq!(stored.analysis_version, 1);
        assert_eq!(
            stored.tag_stats["work"],
            TagStat { total: 3, ai_count: 2, user_count: 1 }
        );
        assert_eq!(
            stored.tag_stats["home"],
            TagStat { total: 1, ai_count: 0, user_count: 1 }
        );
        assert!(cache.get("u1").await.is_none());
    }

    /// Repository whose version moves between read and write.
    struct RacingStats {
        inner: MemoryTagStatisticsRepository,
    }

    #[async_trait]
    impl TagStatisticsRepository for RacingStats {
        async fn get_or_create(&self, user_id: &str) -> StoreResult<TagStatistics> {
            let stats = self.inner.get_or_create(user_id).await?;
            assert!(self.inner.update_statistics(&stats).await?);
            Ok(stats)
        }

        async fn update_statistics(&self, stats: &TagStatistics) -> StoreResult<bool> {
            self.inner.update_statistics(stats).await
        }

        async fn mark_tainted(&self, user_id: &str) -> StoreResult<bool> {
            self.inner.mark_tainted(user_id).await
        }
    }

    #[tokio::test]
    async fn test_conflict_is_benign() {
        let todos = Arc::new(MemoryTodoRepository::new());
        todos
            .insert(Todo::new("t1", "u1", "a").with_tag("x", TagSource::Ai))
            .await;
        let stats = Arc::new(RacingStats {
            inner: MemoryTagStatisticsRepository::new(),
        });

        let outcome = analyzer(todos, stats.clone(), Arc::new(TagStatsCache::new(Duration::from_secs(60))))
            .process(&Job::tag_analysis("u1"))
            .await
            .unwrap();

        assert_eq!(outcome, TagAnalysisOutcome::Conflict);
        let stored = stats.inner.snapshot("u1").await.unwrap();
        assert_eq!(stored.analysis_version, 1);
        assert!(stored.tag_stats.is_empty());
    }
}
