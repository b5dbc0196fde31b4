//! todoai background worker binary.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use todoai_ai::GeminiTagger;
use todoai_queue::{DeadLetterPurger, JobQueue, QueueConfig, RedisJobQueue};
use todoai_store::{
    MemoryActivityRepository, MemoryPreferencesRepository, MemoryTagStatisticsRepository,
    MemoryTodoRepository,
};
use todoai_worker::logging::init_tracing;
use todoai_worker::metrics::init_metrics;
use todoai_worker::retry::{connect_with_backoff, Backoff};
use todoai_worker::{
    GarbageCollector, GcConfig, JobExecutor, ProcessorRegistry, ReprocessConfig, Reprocessor,
    TagAnalyzer, TagChangeNotifier, TagStatsCache, TaskAnalyzer, WorkerConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider (required for TLS to Redis and Gemini)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    dotenvy::dotenv().ok();

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    init_tracing(use_json);

    info!("Starting todoai-worker");

    if let Some(port) = std::env::var("METRICS_PORT").ok().and_then(|p| p.parse().ok()) {
        init_metrics(port).context("Failed to start Prometheus exporter")?;
        info!(port, "Metrics exporter listening");
    }

    let config = WorkerConfig::from_env();
    let gc_config = GcConfig::from_env();
    let reprocess_config = ReprocessConfig::from_env();
    info!("Worker config: {:?}", config);

    let queue_config = QueueConfig::from_env();
    let redis = connect_with_backoff("redis", Backoff::startup(), || {
        RedisJobQueue::connect(queue_config.clone())
    })
    .await
    .context("Failed to connect job queue")?;
    if !redis.supports_delayed_delivery() {
        warn!("Delayed delivery disabled, premature jobs are held in-process");
    }
    let redis = Arc::new(redis);
    let queue: Arc<dyn JobQueue> = redis.clone();
    let purger: Arc<dyn DeadLetterPurger> = redis;

    // In-memory stores until a database-backed implementation is wired
    let todos = Arc::new(MemoryTodoRepository::new());
    let tag_stats = Arc::new(MemoryTagStatisticsRepository::new());
    let activity = Arc::new(MemoryActivityRepository::default());
    let preferences = Arc::new(MemoryPreferencesRepository::new());

    let notifier = TagChangeNotifier::new(tag_stats.clone(), Arc::clone(&queue), config.tag_debounce)
        .with_max_retries(config.max_retries);
    todos.set_tag_change_hook(Arc::new(notifier)).await;

    let tagger = Arc::new(GeminiTagger::from_env().context("Failed to configure Gemini tagger")?);
    let cache = Arc::new(TagStatsCache::new(config.tag_stats_cache_ttl));

    let task_analyzer = TaskAnalyzer::new(
        todos.clone(),
        tag_stats.clone(),
        activity.clone(),
        preferences,
        tagger,
        Arc::clone(&cache),
    )
    .with_page_size(config.todo_page_size);
    let tag_analyzer =
        TagAnalyzer::new(todos, tag_stats, cache).with_page_size(config.todo_page_size);
    let registry =
        ProcessorRegistry::with_analyzers(Arc::new(task_analyzer), Arc::new(tag_analyzer));

    let executor = JobExecutor::new(config.clone(), Arc::clone(&queue), registry);
    let shutdown = executor.shutdown_token();

    let gc = GarbageCollector::new(Some(purger), gc_config);
    let gc_handle = tokio::spawn({
        let cancel = shutdown.child_token();
        async move { gc.run(cancel).await }
    });

    let reprocessor = Reprocessor::new(activity, Arc::clone(&queue), reprocess_config)
        .with_max_retries(config.max_retries);
    let reprocess_handle = tokio::spawn({
        let cancel = shutdown.child_token();
        async move { reprocessor.run(cancel).await }
    });

    tokio::spawn(wait_for_signal(shutdown.clone()));

    let result = executor.run().await;
    shutdown.cancel();

    if let Err(e) = gc_handle.await {
        warn!("Garbage collector task failed: {}", e);
    }
    if let Err(e) = reprocess_handle.await {
        warn!("Reprocessor task failed: {}", e);
    }
    if let Err(e) = queue.close().await {
        warn!("Failed to close job queue: {}", e);
    }

    if let Err(e) = result {
        error!("Executor error: {}", e);
        return Err(e.into());
    }

    info!("Worker shutdown complete");
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Received shutdown signal");
            shutdown.cancel();
        }
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
}
