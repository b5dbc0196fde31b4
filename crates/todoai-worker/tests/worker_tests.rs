//! End-to-end worker tests against the in-process queue and stores.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use todoai_ai::{AiError, AiResult, TaskAnalysis, TaskTagger};
use todoai_models::{Job, JobType, TagSource, TimeHorizon, Todo, TodoStatus};
use todoai_queue::{JobQueue, MemoryJobQueue};
use todoai_store::{
    MemoryActivityRepository, MemoryPreferencesRepository, MemoryTagStatisticsRepository,
    MemoryTodoRepository,
};
use todoai_worker::{
    JobExecutor, ProcessorRegistry, TagAnalyzer, TagChangeNotifier, TagStatsCache, TaskAnalyzer,
    WorkerConfig, WorkerResult,
};
use tokio::task::JoinHandle;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

/// Minimal tagger answering every call the same way.
struct FixedTagger {
    calls: AtomicUsize,
    quota_exhausted: bool,
}

impl FixedTagger {
    fn ok() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            quota_exhausted: false,
        }
    }

    fn out_of_quota() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            quota_exhausted: true,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskTagger for FixedTagger {
    async fn analyze_task(&self, _text: &str, _context: Option<&str>) -> AiResult<TaskAnalysis> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.quota_exhausted {
            return Err(AiError::quota_exhausted("daily quota exceeded", None));
        }
        Ok(TaskAnalysis {
            tags: vec!["errands".to_string()],
            time_horizon: Some(TimeHorizon::Soon),
        })
    }
}

struct Harness {
    queue: MemoryJobQueue,
    todos: Arc<MemoryTodoRepository>,
    tag_stats: Arc<MemoryTagStatisticsRepository>,
    activity: Arc<MemoryActivityRepository>,
    preferences: Arc<MemoryPreferencesRepository>,
    tagger: Arc<FixedTagger>,
}

impl Harness {
    async fn new(queue: MemoryJobQueue, tagger: FixedTagger) -> Self {
        let harness = Self {
            queue,
            todos: Arc::new(MemoryTodoRepository::new()),
            tag_stats: Arc::new(MemoryTagStatisticsRepository::new()),
            activity: Arc::new(MemoryActivityRepository::default()),
            preferences: Arc::new(MemoryPreferencesRepository::new()),
            tagger: Arc::new(tagger),
        };
        let notifier = TagChangeNotifier::new(
            harness.tag_stats.clone(),
            Arc::new(harness.queue.clone()),
            Duration::from_millis(100),
        );
        harness.todos.set_tag_change_hook(Arc::new(notifier)).await;
        harness
    }

    fn registry(&self) -> ProcessorRegistry {
        let cache = Arc::new(TagStatsCache::new(Duration::from_secs(60)));
        let tasks = TaskAnalyzer::new(
            self.todos.clone(),
            self.tag_stats.clone(),
            self.activity.clone(),
            self.preferences.clone(),
            self.tagger.clone(),
            Arc::clone(&cache),
        );
        let tags = TagAnalyzer::new(self.todos.clone(), self.tag_stats.clone(), cache);
        ProcessorRegistry::with_analyzers(Arc::new(tasks), Arc::new(tags))
    }

    fn start(&self, registry: ProcessorRegistry) -> (CancellationToken, JoinHandle<()>) {
        self.start_with(registry, WorkerConfig::default().prefetch)
    }

    fn start_with(
        &self,
        registry: ProcessorRegistry,
        prefetch: usize,
    ) -> (CancellationToken, JoinHandle<()>) {
        let config = WorkerConfig {
            prefetch,
            shutdown_timeout: Duration::from_secs(2),
            ..WorkerConfig::default()
        };
        let executor = JobExecutor::new(config, Arc::new(self.queue.clone()), registry);
        let shutdown = executor.shutdown_token();
        let handle = tokio::spawn(async move {
            executor.run().await.unwrap();
        });
        (shutdown, handle)
    }

    fn repository_calls(&self) -> usize {
        self.todos.call_count()
            + self.tag_stats.call_count()
            + self.activity.call_count()
            + self.preferences.call_count()
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn stop(shutdown: CancellationToken, handle: JoinHandle<()>) {
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("executor did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_task_analysis_then_debounced_tag_analysis() {
    let h = Harness::new(MemoryJobQueue::new(), FixedTagger::ok()).await;
    h.todos
        .insert(Todo::new("t1", "u1", "buy groceries").with_tag("home", TagSource::User))
        .await;
    h.todos.insert(Todo::new("t2", "u1", "old").with_status(TodoStatus::Completed)).await;

    let (shutdown, handle) = h.start(h.registry());
    assert_ok!(h.queue.enqueue(&Job::task_analysis("u1", "t1")).await);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.tag_stats.snapshot("u1").await.map_or(true, |s| s.analysis_version == 0) {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for tag statistics");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    stop(shutdown, handle).await;

    let todo = h.todos.snapshot("u1", "t1").await.unwrap();
    assert_eq!(todo.status, TodoStatus::Processed);
    assert_eq!(todo.tags, vec!["home", "errands"]);
    assert_eq!(todo.time_horizon, Some(TimeHorizon::Soon));

    let stats = h.tag_stats.snapshot("u1").await.unwrap();
    assert!(!stats.tainted);
    assert_eq!(stats.tag_stats["home"].user_count, 1);
    assert_eq!(stats.tag_stats["errands"].ai_count, 1);
    assert!(h.queue.dead_letters().is_empty());
}

#[tokio::test]
async fn test_premature_job_acked_without_processing() {
    let h = Harness::new(MemoryJobQueue::without_delayed_delivery(), FixedTagger::ok()).await;

    let dispatched = Arc::new(AtomicUsize::new(0));
    let mut registry = ProcessorRegistry::new();
    for job_type in [JobType::TaskAnalysis, JobType::ReprocessUser, JobType::TagAnalysis] {
        let dispatched = Arc::clone(&dispatched);
        registry.register(job_type, move |_job| {
            let dispatched = Arc::clone(&dispatched);
            async move {
                dispatched.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
    }

    let (shutdown, handle) = h.start(registry);
    let job = Job::task_analysis("u1", "t1").with_not_before(Utc::now() + chrono::Duration::hours(1));
    assert_ok!(h.queue.enqueue(&job).await);

    let queue = h.queue.clone();
    wait_until("premature job ack", || queue.acked_count() == 1).await;
    stop(shutdown, handle).await;

    assert_eq!(dispatched.load(Ordering::SeqCst), 0);
    assert_eq!(h.tagger.calls(), 0);
    assert_eq!(h.repository_calls(), 0);
    assert!(h.queue.dead_letters().is_empty());
}

#[tokio::test]
async fn test_quota_failure_reschedules_clone() {
    let h = Harness::new(MemoryJobQueue::new(), FixedTagger::out_of_quota()).await;
    h.todos.insert(Todo::new("t1", "u1", "file taxes")).await;

    let (shutdown, handle) = h.start(h.registry());
    let original = Job::task_analysis("u1", "t1");
    assert_ok!(h.queue.enqueue(&original).await);

    let queue = h.queue.clone();
    wait_until("reschedule", || !queue.delayed_jobs().is_empty()).await;
    stop(shutdown, handle).await;

    assert_eq!(h.tagger.calls(), 1);
    assert_eq!(h.queue.acked_count(), 1);
    let delayed = h.queue.delayed_jobs();
    assert_eq!(delayed.len(), 1);
    assert_ne!(delayed[0].id, original.id);
    assert_eq!(delayed[0].retry_count, 1);
    assert!(delayed[0].not_before.unwrap() > Utc::now() + chrono::Duration::minutes(59));
    assert_eq!(h.todos.snapshot("u1", "t1").await.unwrap().status, TodoStatus::Pending);
}

#[tokio::test]
async fn test_missing_todo_and_bad_payloads_dead_letter() {
    let h = Harness::new(MemoryJobQueue::new(), FixedTagger::ok()).await;
    let (shutdown, handle) = h.start(h.registry());

    h.queue.enqueue(&Job::task_analysis("u1", "missing")).await.unwrap();
    h.queue.publish_raw("jobs", "{not json");
    h.queue.publish_raw("elsewhere", &serde_json::to_string(&Job::tag_analysis("u1")).unwrap());

    let queue = h.queue.clone();
    wait_until("dead letters", || queue.dead_letters().len() == 3).await;
    stop(shutdown, handle).await;

    assert_eq!(h.tagger.calls(), 0);
    assert_eq!(h.queue.in_flight(), 0);
}

#[tokio::test]
async fn test_shutdown_with_idle_queue() {
    let h = Harness::new(MemoryJobQueue::new(), FixedTagger::ok()).await;
    let (shutdown, handle) = h.start(h.registry());
    tokio::time::sleep(Duration::from_millis(50)).await;
    stop(shutdown, handle).await;
    assert_eq!(h.queue.in_flight(), 0);
}

async fn broken_processor(_job: Job) -> WorkerResult<()> {
    panic!("processor bug")
}

#[tokio::test]
async fn test_panicking_processor_still_settles() {
    let h = Harness::new(MemoryJobQueue::new(), FixedTagger::ok()).await;
    let attempts = Arc::new(AtomicUsize::new(0));
    let mut registry = ProcessorRegistry::new();
    let counter = Arc::clone(&attempts);
    registry.register(JobType::TagAnalysis, move |job| {
        counter.fetch_add(1, Ordering::SeqCst);
        broken_processor(job)
    });

    let (shutdown, handle) = h.start(registry);
    assert_ok!(h.queue.enqueue(&Job::tag_analysis("u1").with_max_retries(2)).await);

    let queue = h.queue.clone();
    wait_until("dead letter", || queue.dead_letters().len() == 1).await;
    stop(shutdown, handle).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(h.queue.in_flight(), 0);
    assert!(h.queue.dead_letters()[0].reason.contains("panicked"));
}

#[tokio::test]
async fn test_shutdown_requeues_undispatched_deliveries() {
    let h = Harness::new(MemoryJobQueue::new(), FixedTagger::ok()).await;
    let mut registry = ProcessorRegistry::new();
    registry.register(JobType::TagAnalysis, |_job| async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(())
    });

    for i in 0..10 {
        assert_ok!(h.queue.enqueue(&Job::tag_analysis(format!("u{i}"))).await);
    }
    let (shutdown, handle) = h.start_with(registry, 3);
    tokio::time::sleep(Duration::from_millis(100)).await;
    stop(shutdown, handle).await;

    let acked = h.queue.acked_count() as usize;
    assert!(acked > 0);
    assert_eq!(acked + h.queue.ready_jobs().len(), 10);
    assert_eq!(h.queue.in_flight(), 0);
    assert!(h.queue.dead_letters().is_empty());
}
