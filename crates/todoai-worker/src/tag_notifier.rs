//! Debounced tag-change notifications.
//!
//! Every tag mutation taints the user's statistics and schedules a
//! `tag_analysis` job a few seconds out. Bursts of edits collapse into runs
//! that each read the latest version, and stale writers lose the CAS.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, warn};
use todoai_models::{to_chrono, Job, DEFAULT_MAX_RETRIES};
use todoai_queue::JobQueue;
use todoai_store::{TagChangeHook, TagStatisticsRepository};

use crate::error::WorkerResult;

pub struct TagChangeNotifier {
    tag_stats: Arc<dyn TagStatisticsRepository>,
    queue: Arc<dyn JobQueue>,
    debounce: Duration,
    max_retries: u32,
}

impl TagChangeNotifier {
    pub fn new(
        tag_stats: Arc<dyn TagStatisticsRepository>,
        queue: Arc<dyn JobQueue>,
        debounce: Duration,
    ) -> Self {
        Self {
            tag_stats,
            queue,
            debounce,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Taint the user's statistics and enqueue a delayed `tag_analysis`.
    ///
    /// Succeeds iff the job was enqueued; a failure to taint is only logged.
    pub async fn notify(&self, user_id: &str) -> WorkerResult<()> {
        match self.tag_stats.mark_tainted(user_id).await {
            Ok(flipped) => debug!(user_id, flipped, "Tag statistics tainted"),
            Err(e) => warn!(user_id, "Failed to taint tag statistics: {}", e),
        }

        let job = Job::tag_analysis(user_id)
            .with_not_before(Utc::now() + to_chrono(self.debounce))
            .with_max_retries(self.max_retries);
        self.queue.enqueue(&job).await?;
        debug!(user_id, job_id = %job.id, "Tag analysis scheduled");
        Ok(())
    }
}

#[async_trait]
impl TagChangeHook for TagChangeNotifier {
    async fn on_tags_changed(&self, user_id: &str, todo_id: &str) {
        if let Err(e) = self.notify(user_id).await {
            error!(user_id, todo_id, "Failed to schedule tag analysis: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use todoai_queue::MemoryJobQueue;
    use todoai_models::JobType;
    use todoai_store::MemoryTagStatisticsRepository;

    #[tokio::test]
    async fn test_notify_taints_and_schedules() {
        let stats = Arc::new(MemoryTagStatisticsRepository::new());
        let queue = MemoryJobQueue::new();
        let notifier =
            TagChangeNotifier::new(stats.clone(), Arc::new(queue.clone()), Duration::from_secs(5));

        let before = Utc::now();
        notifier.notify("u1").await.unwrap();

        assert!(stats.snapshot("u1").await.unwrap().tainted);
        let delayed = queue.delayed_jobs();
        assert_eq!(delayed.len(), 1);
        assert_eq!(delayed[0].job_type, JobType::TagAnalysis);
        let due = delayed[0].not_before.unwrap();
        assert!(due >= before + chrono::Duration::seconds(5));
        assert!(queue.ready_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_failure_fails_notification() {
        let stats = Arc::new(MemoryTagStatisticsRepository::new());
        let queue = MemoryJobQueue::new();
        queue.close().await.unwrap();
        let notifier =
            TagChangeNotifier::new(stats.clone(), Arc::new(queue), Duration::from_secs(5));

        tokio_test::assert_err!(notifier.notify("u1").await);
        // Taint happened before the enqueue
        assert!(stats.snapshot("u1").await.unwrap().tainted);
    }
}
