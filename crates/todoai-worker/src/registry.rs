//! Dispatch table from job type to processor.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use todoai_models::{Job, JobType};

use crate::error::{WorkerError, WorkerResult};
use crate::tag_analyzer::TagAnalyzer;
use crate::task_analyzer::TaskAnalyzer;

/// A registered processor.
pub type ProcessorFn = Arc<dyn Fn(Job) -> BoxFuture<'static, WorkerResult<()>> + Send + Sync>;

#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<JobType, ProcessorFn>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `processor` for `job_type`, replacing any previous one.
    pub fn register<F, Fut>(&mut self, job_type: JobType, processor: F) -> &mut Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WorkerResult<()>> + Send + 'static,
    {
        self.processors
            .insert(job_type, Arc::new(move |job| processor(job).boxed()));
        self
    }

    /// Registry wired to the analyzers for every job type.
    pub fn with_analyzers(tasks: Arc<TaskAnalyzer>, tags: Arc<TagAnalyzer>) -> Self {
        let mut registry = Self::new();

        let analyzer = Arc::clone(&tasks);
        registry.register(JobType::TaskAnalysis, move |job| {
            let analyzer = Arc::clone(&analyzer);
            async move { analyzer.process_task_analysis(&job).await }
        });
        registry.register(JobType::ReprocessUser, move |job| {
            let analyzer = Arc::clone(&tasks);
            async move { analyzer.process_reprocess_user(&job).await.map(|_| ()) }
        });
        registry.register(JobType::TagAnalysis, move |job| {
            let analyzer = Arc::clone(&tags);
            async move { analyzer.process(&job).await.map(|_| ()) }
        });

        registry
    }

    pub fn handles(&self, job_type: JobType) -> bool {
        self.processors.contains_key(&job_type)
    }

    /// Run the processor registered for the job's type.
    pub async fn dispatch(&self, job: Job) -> WorkerResult<()> {
        let processor = self
            .processors
            .get(&job.job_type)
            .cloned()
            .ok_or_else(|| WorkerError::UnknownJobType(job.job_type.to_string()))?;
        processor(job).await
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("job_types", &self.processors.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_dispatch_by_type() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ProcessorRegistry::new();
        let counter = Arc::clone(&calls);
        registry.register(JobType::TagAnalysis, move |_job| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        assert!(registry.handles(JobType::TagAnalysis));
        registry.dispatch(Job::tag_analysis("u1")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let err = registry.dispatch(Job::reprocess_user("u1")).await.unwrap_err();
        assert!(matches!(err, WorkerError::UnknownJobType(_)));
        assert!(err.is_permanent());
    }
}
