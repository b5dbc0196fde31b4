//! Repository contracts consumed by the workers.

use async_trait::async_trait;
use todoai_models::{TagStatistics, Todo, UserActivity, UserPreferences};

use crate::error::StoreResult;

/// One page of a paginated listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Total number of records across all pages.
    pub total: usize,
}

#[async_trait]
pub trait TodoRepository: Send + Sync {
    /// Load a todo scoped to its owner; `NotFound` when absent.
    async fn get_by_owner_and_id(&self, user_id: &str, todo_id: &str) -> StoreResult<Todo>;

    /// Persist a todo. `previous_tags` is the tag set the caller started from;
    /// implementations fire their tag-change hook when it differs.
    async fn update(&self, todo: &Todo, previous_tags: Option<&[String]>) -> StoreResult<()>;

    /// Zero-based page of a user's todos, oldest first.
    async fn get_by_owner_paginated(
        &self,
        user_id: &str,
        page: usize,
        page_size: usize,
    ) -> StoreResult<Page<Todo>>;
}

/// Tag statistics with optimistic concurrency on `analysis_version`.
#[async_trait]
pub trait TagStatisticsRepository: Send + Sync {
    /// Load statistics, creating empty ones on first access.
    async fn get_or_create(&self, user_id: &str) -> StoreResult<TagStatistics>;

    /// Write `stats` iff the stored version still equals
    /// `stats.analysis_version`. On success the stored version is bumped by one
    /// and the taint cleared. A version mismatch returns `Ok(false)`.
    async fn update_statistics(&self, stats: &TagStatistics) -> StoreResult<bool>;

    /// Flag statistics as stale. Returns whether the flag flipped.
    async fn mark_tainted(&self, user_id: &str) -> StoreResult<bool>;
}

#[async_trait]
pub trait ActivityRepository: Send + Sync {
    async fn get_by_owner(&self, user_id: &str) -> StoreResult<Option<UserActivity>>;

    /// Users whose todos should be periodically re-analyzed.
    async fn get_eligible_for_reprocessing(&self) -> StoreResult<Vec<String>>;
}

#[async_trait]
pub trait PreferencesRepository: Send + Sync {
    async fn get_by_owner(&self, user_id: &str) -> StoreResult<Option<UserPreferences>>;
}

/// Callback fired by a todo store when a todo's tag set changed.
#[async_trait]
pub trait TagChangeHook: Send + Sync {
    async fn on_tags_changed(&self, user_id: &str, todo_id: &str);
}

/// Load every todo of a user by walking all pages.
pub async fn fetch_all_todos(
    repo: &dyn TodoRepository,
    user_id: &str,
    page_size: usize,
) -> StoreResult<Vec<Todo>> {
    let page_size = page_size.max(1);
    let mut todos = Vec::new();
    let mut page = 0;
    loop {
        let batch = repo.get_by_owner_paginated(user_id, page, page_size).await?;
        let fetched = batch.items.len();
        todos.extend(batch.items);
        if fetched < page_size || todos.len() >= batch.total {
            break;
        }
        page += 1;
    }
    Ok(todos)
}
