//! In-memory repositories.
//!
//! Each store counts the calls it serves so tests can assert that a code path
//! never touched storage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use todoai_models::{tags_equal, TagStatistics, Todo, UserActivity, UserPreferences};

use crate::error::{StoreError, StoreResult};
use crate::repository::{
    ActivityRepository, Page, PreferencesRepository, TagChangeHook, TagStatisticsRepository,
    TodoRepository,
};

#[derive(Debug, Default)]
struct CallCounter(AtomicUsize);

impl CallCounter {
    fn hit(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Todos
// =============================================================================

/// Todos keyed by `(user_id, todo_id)`.
#[derive(Default)]
pub struct MemoryTodoRepository {
    todos: RwLock<HashMap<(String, String), Todo>>,
    hook: RwLock<Option<Arc<dyn TagChangeHook>>>,
    calls: CallCounter,
}

impl MemoryTodoRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the callback fired when an update changes a todo's tags.
    pub async fn set_tag_change_hook(&self, hook: Arc<dyn TagChangeHook>) {
        *self.hook.write().await = Some(hook);
    }

    /// Insert or replace a todo without firing hooks.
    pub async fn insert(&self, todo: Todo) {
        self.todos
            .write()
            .await
            .insert((todo.user_id.clone(), todo.id.clone()), todo);
    }

    /// Current stored copy, bypassing call counting.
    pub async fn snapshot(&self, user_id: &str, todo_id: &str) -> Option<Todo> {
        self.todos
            .read()
            .await
            .get(&(user_id.to_string(), todo_id.to_string()))
            .cloned()
    }

    pub fn call_count(&self) -> usize {
        self.calls.get()
    }
}

#[async_trait]
impl TodoRepository for MemoryTodoRepository {
    async fn get_by_owner_and_id(&self, user_id: &str, todo_id: &str) -> StoreResult<Todo> {
        self.calls.hit();
        self.todos
            .read()
            .await
            .get(&(user_id.to_string(), todo_id.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("todo {todo_id} of user {user_id}")))
    }

    async fn update(&self, todo: &Todo, previous_tags: Option<&[String]>) -> StoreResult<()> {
        self.calls.hit();
        {
            let mut todos = self.todos.write().await;
            let key = (todo.user_id.clone(), todo.id.clone());
            let stored = todos
                .get_mut(&key)
                .ok_or_else(|| StoreError::not_found(format!("todo {}", todo.id)))?;
            *stored = todo.clone();
            stored.updated_at = Utc::now();
        }

        if !tags_equal(previous_tags, Some(todo.tags.as_slice())) {
            let hook = self.hook.read().await.clone();
            if let Some(hook) = hook {
                debug!(user_id = %todo.user_id, todo_id = %todo.id, "Todo tags changed");
                hook.on_tags_changed(&todo.user_id, &todo.id).await;
            }
        }
        Ok(())
    }

    async fn get_by_owner_paginated(
        &self,
        user_id: &str,
        page: usize,
        page_size: usize,
    ) -> StoreResult<Page<Todo>> {
        self.calls.hit();
        let todos = self.todos.read().await;
        let mut owned: Vec<&Todo> = todos.values().filter(|t| t.user_id == user_id).collect();
        owned.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let total = owned.len();
        let items = owned
            .into_iter()
            .skip(page.saturating_mul(page_size))
            .take(page_size)
            .cloned()
            .collect();
        Ok(Page { items, total })
    }
}

// =============================================================================
// Tag statistics
// =============================================================================

/// Tag statistics with compare-and-swap on `analysis_version`.
#[derive(Default)]
pub struct MemoryTagStatisticsRepository {
    stats: Mutex<HashMap<String, TagStatistics>>,
    calls: CallCounter,
}

impl MemoryTagStatisticsRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current stored copy, bypassing call counting.
    pub async fn snapshot(&self, user_id: &str) -> Option<TagStatistics> {
        self.stats.lock().await.get(user_id).cloned()
    }

    pub fn call_count(&self) -> usize {
        self.calls.get()
    }
}

#[async_trait]
impl TagStatisticsRepository for MemoryTagStatisticsRepository {
    async fn get_or_create(&self, user_id: &str) -> StoreResult<TagStatistics> {
        self.calls.hit();
        let mut stats = self.stats.lock().await;
        Ok(stats
            .entry(user_id.to_string())
            .or_insert_with(|| TagStatistics::empty(user_id))
            .clone())
    }

    async fn update_statistics(&self, update: &TagStatistics) -> StoreResult<bool> {
        self.calls.hit();
        let mut stats = self.stats.lock().await;
        let current = stats
            .entry(update.user_id.clone())
            .or_insert_with(|| TagStatistics::empty(&update.user_id));

        if current.analysis_version != update.analysis_version {
            debug!(
                user_id = %update.user_id,
                expected = update.analysis_version,
                stored = current.analysis_version,
                "Tag statistics version mismatch"
            );
            return Ok(false);
        }

        let now = Utc::now();
        *current = TagStatistics {
            user_id: update.user_id.clone(),
            tag_stats: update.tag_stats.clone(),
            tainted: false,
            analysis_version: update.analysis_version + 1,
            last_analyzed_at: Some(now),
            updated_at: now,
        };
        Ok(true)
    }

    async fn mark_tainted(&self, user_id: &str) -> StoreResult<bool> {
        self.calls.hit();
        let mut stats = self.stats.lock().await;
        let current = stats
            .entry(user_id.to_string())
            .or_insert_with(|| TagStatistics::empty(user_id));
        if current.tainted {
            return Ok(false);
        }
        current.tainted = true;
        current.updated_at = Utc::now();
        Ok(true)
    }
}

// =============================================================================
// Activity and preferences
// =============================================================================

/// User activity; users active within `active_window` and not paused are
/// eligible for reprocessing.
pub struct MemoryActivityRepository {
    activity: RwLock<HashMap<String, UserActivity>>,
    active_window: Duration,
    calls: CallCounter,
}

impl Default for MemoryActivityRepository {
    fn default() -> Self {
        Self::new(Duration::days(30))
    }
}

impl MemoryActivityRepository {
    pub fn new(active_window: Duration) -> Self {
        Self {
            activity: RwLock::new(HashMap::new()),
            active_window,
            calls: CallCounter::default(),
        }
    }

    pub async fn insert(&self, activity: UserActivity) {
        self.activity
            .write()
            .await
            .insert(activity.user_id.clone(), activity);
    }

    pub fn call_count(&self) -> usize {
        self.calls.get()
    }
}

#[async_trait]
impl ActivityRepository for MemoryActivityRepository {
    async fn get_by_owner(&self, user_id: &str) -> StoreResult<Option<UserActivity>> {
        self.calls.hit();
        Ok(self.activity.read().await.get(user_id).cloned())
    }

    async fn get_eligible_for_reprocessing(&self) -> StoreResult<Vec<String>> {
        self.calls.hit();
        let cutoff = Utc::now() - self.active_window;
        let mut users: Vec<String> = self
            .activity
            .read()
            .await
            .values()
            .filter(|a| !a.reprocessing_paused && a.last_active_at >= cutoff)
            .map(|a| a.user_id.clone())
            .collect();
        users.sort();
        Ok(users)
    }
}

#[derive(Default)]
pub struct MemoryPreferencesRepository {
    prefs: RwLock<HashMap<String, UserPreferences>>,
    calls: CallCounter,
}

impl MemoryPreferencesRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, prefs: UserPreferences) {
        self.prefs.write().await.insert(prefs.user_id.clone(), prefs);
    }

    pub fn call_count(&self) -> usize {
        self.calls.get()
    }
}

#[async_trait]
impl PreferencesRepository for MemoryPreferencesRepository {
    async fn get_by_owner(&self, user_id: &str) -> StoreResult<Option<UserPreferences>> {
        self.calls.hit();
        Ok(self.prefs.read().await.get(user_id).cloned())
    }
}
