//! AI analysis of todos: single `task_analysis` jobs and full
//! `reprocess_user` sweeps.

use std::sync::Arc;

use tracing::{debug, warn};
use todoai_ai::{TaskAnalysis, TaskTagger};
use todoai_models::{Job, TagStatistics, Todo, TodoStatus};
use todoai_store::{
    fetch_all_todos, ActivityRepository, PreferencesRepository, TagStatisticsRepository,
    TodoRepository,
};

use crate::cache::TagStatsCache;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;

/// Prompt context shared by every todo of one user.
#[derive(Debug, Default, Clone)]
struct UserContext {
    preferences: Option<String>,
    tag_stats: Option<TagStatistics>,
}

impl UserContext {
    fn preferences(&self) -> Option<&str> {
        self.preferences.as_deref()
    }
}

pub struct TaskAnalyzer {
    todos: Arc<dyn TodoRepository>,
    tag_stats: Arc<dyn TagStatisticsRepository>,
    activity: Arc<dyn ActivityRepository>,
    preferences: Arc<dyn PreferencesRepository>,
    tagger: Arc<dyn TaskTagger>,
    cache: Arc<TagStatsCache>,
    page_size: usize,
}

impl TaskAnalyzer {
    pub fn new(
        todos: Arc<dyn TodoRepository>,
        tag_stats: Arc<dyn TagStatisticsRepository>,
        activity: Arc<dyn ActivityRepository>,
        preferences: Arc<dyn PreferencesRepository>,
        tagger: Arc<dyn TaskTagger>,
        cache: Arc<TagStatsCache>,
    ) -> Self {
        Self {
            todos,
            tag_stats,
            activity,
            preferences,
            tagger,
            cache,
            page_size: 500,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Analyze the single todo named by a `task_analysis` job.
    pub async fn process_task_analysis(&self, job: &Job) -> WorkerResult<()> {
        job.validate()
            .map_err(|e| WorkerError::malformed_job(e.to_string()))?;
        let todo_id = job
            .todo_id
            .as_deref()
            .ok_or_else(|| WorkerError::malformed_job("task_analysis job without todo_id"))?;
        let logger = JobLogger::new(job);

        let todo = self.todos.get_by_owner_and_id(&job.user_id, todo_id).await?;
        let context = self.load_context(&job.user_id).await;

        if self.is_paused(&job.user_id).await {
            logger.log_progress("reprocessing paused for user, skipping");
            return Ok(());
        }

        let horizon_changed = self.analyze_todo(todo, &context).await?;
        logger.log_completion(&format!("todo {} analyzed (horizon changed: {})", todo_id, horizon_changed));
        Ok(())
    }

    /// Re-analyze every open todo of the user. Returns how many time horizons
    /// changed; todos whose analysis fails are logged and skipped.
    pub async fn process_reprocess_user(&self, job: &Job) -> WorkerResult<usize> {
        job.validate()
            .map_err(|e| WorkerError::malformed_job(e.to_string()))?;
        let logger = JobLogger::new(job);

        if self.is_paused(&job.user_id).await {
            logger.log_progress("reprocessing paused for user, skipping");
            return Ok(0);
        }

        let todos = fetch_all_todos(self.todos.as_ref(), &job.user_id, self.page_size).await?;
        let open: Vec<Todo> = todos.into_iter().filter(|t| t.status.is_open()).collect();
        logger.log_start(&format!("reprocessing {} open todos", open.len()));

        let context = self.load_context(&job.user_id).await;
        let mut changed = 0;
        for todo in open {
            let todo_id = todo.id.clone();
            match self.analyze_todo(todo, &context).await {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(e) => logger.log_warning(&format!("skipping todo {}: {}", todo_id, e)),
            }
        }

        logger.log_completion(&format!("{} time horizons changed", changed));
        Ok(changed)
    }

    async fn is_paused(&self, user_id: &str) -> bool {
        match self.activity.get_by_owner(user_id).await {
            Ok(activity) => activity.is_some_and(|a| a.reprocessing_paused),
            Err(e) => {
                warn!(user_id, "Failed to load user activity: {}", e);
                false
            }
        }
    }

    /// Best-effort prompt context; missing pieces are tolerated.
    async fn load_context(&self, user_id: &str) -> UserContext {
        let preferences = match self.preferences.get_by_owner(user_id).await {
            Ok(prefs) => prefs.map(|p| p.context).filter(|c| !c.trim().is_empty()),
            Err(e) => {
                debug!(user_id, "Preferences unavailable: {}", e);
                None
            }
        };
        let tag_stats = self.cache.get_or_load(user_id, self.tag_stats.as_ref()).await;
        UserContext {
            preferences,
            tag_stats,
        }
    }

    /// Run the model on one todo and persist the result. Returns whether the
    /// time horizon changed.
    async fn analyze_todo(&self, mut todo: Todo, context: &UserContext) -> WorkerResult<bool> {
        let previous_tags = todo.tags.clone();

        let marked_processing = todo.status == TodoStatus::Pending;
        if marked_processing {
            todo.status = TodoStatus::Processing;
            if let Err(e) = self.todos.update(&todo, Some(previous_tags.as_slice())).await {
                warn!(todo_id = %todo.id, "Failed to mark todo processing: {}", e);
            }
        }

        let analysis = match self.call_tagger(&todo, context).await {
            Ok(analysis) => analysis,
            Err(e) => {
                if marked_processing {
                    todo.status = TodoStatus::Pending;
                    if let Err(revert) = self.todos.update(&todo, Some(previous_tags.as_slice())).await {
                        warn!(todo_id = %todo.id, "Failed to revert todo to pending: {}", revert);
                    }
                }
                return Err(e);
            }
        };

        todo.merge_ai_tags(&analysis.tags);

        let previous_horizon = todo.time_horizon;
        if !todo.time_horizon_overridden {
            if let Some(horizon) = analysis.time_horizon {
                todo.time_horizon = Some(horizon);
            }
        }

        if todo.status != TodoStatus::Completed {
            todo.status = TodoStatus::Processed;
        }

        self.todos.update(&todo, Some(previous_tags.as_slice())).await?;
        Ok(todo.time_horizon != previous_horizon)
    }

    async fn call_tagger(&self, todo: &Todo, context: &UserContext) -> WorkerResult<TaskAnalysis> {
        let analysis = match self.tagger.due_date_capability() {
            Some(rich) => {
                rich.analyze_task_with_due_date(
                    &todo.text,
                    todo.due_date,
                    todo.created_at,
                    context.preferences(),
                    context.tag_stats.as_ref(),
                )
                .await?
            }
            None => self.tagger.analyze_task(&todo.text, context.preferences()).await?,
        };
        Ok(analysis)
    }
}
