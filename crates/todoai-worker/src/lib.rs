//! Background worker for the todoai job subsystem.
//!
//! This crate provides:
//! - Job executor with prefetch-bounded dispatch and graceful shutdown
//! - Task analysis and per-user reprocessing through the AI tagger
//! - Optimistic-concurrency tag statistics with debounced recomputation
//! - The single disposition policy for ack, retry, backoff and dead-lettering
//! - Dead-letter garbage collection and the twice-daily reprocessing scheduler

pub mod cache;
pub mod config;
pub mod disposition;
pub mod error;
pub mod executor;
pub mod gc;
pub mod logging;
pub mod metrics;
pub mod registry;
pub mod reprocessor;
pub mod retry;
pub mod tag_analyzer;
pub mod tag_notifier;
pub mod task_analyzer;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::TagStatsCache;
pub use config::{GcConfig, ReprocessConfig, WorkerConfig};
pub use disposition::{defer, settle, Disposition};
pub use error::{WorkerError, WorkerResult};
pub use executor::JobExecutor;
pub use gc::GarbageCollector;
pub use logging::JobLogger;
pub use registry::ProcessorRegistry;
pub use reprocessor::{next_anchors, Reprocessor};
pub use tag_analyzer::{TagAnalysisOutcome, TagAnalyzer};
pub use tag_notifier::TagChangeNotifier;
pub use task_analyzer::TaskAnalyzer;
