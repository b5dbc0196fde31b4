//! Worker metrics.
//!
//! Provides standardized metrics for the job pipeline:
//! - Job outcomes by type and disposition
//! - Processing latency
//! - Dead-letter purges, scheduled reprocessing and statistics conflicts

use std::net::SocketAddr;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

// =============================================================================
// Metric Names
// =============================================================================

/// Metric name constants for consistency.
pub mod names {
    /// Settled jobs by type and outcome.
    pub const JOBS_TOTAL: &str = "todoai_jobs_total";

    /// Processor latency in seconds by job type.
    pub const JOB_DURATION_SECONDS: &str = "todoai_job_duration_seconds";

    /// Dead-lettered messages removed by the garbage collector.
    pub const DLQ_PURGED_TOTAL: &str = "todoai_dlq_purged_total";

    /// Reprocessing jobs enqueued by the scheduler.
    pub const REPROCESS_JOBS_ENQUEUED_TOTAL: &str = "todoai_reprocess_jobs_enqueued_total";

    /// Tag statistics writes rejected by the version check.
    pub const TAG_STATS_CONFLICTS_TOTAL: &str = "todoai_tag_stats_conflicts_total";
}

// =============================================================================
// Recording Functions
// =============================================================================

pub fn record_job(job_type: &str, outcome: &str) {
    counter!(
        names::JOBS_TOTAL,
        "job_type" => job_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_job_duration(job_type: &str, seconds: f64) {
    histogram!(
        names::JOB_DURATION_SECONDS,
        "job_type" => job_type.to_string()
    )
    .record(seconds);
}

pub fn record_dlq_purged(count: u64) {
    counter!(names::DLQ_PURGED_TOTAL).increment(count);
}

pub fn record_reprocess_enqueued(count: u64) {
    counter!(names::REPROCESS_JOBS_ENQUEUED_TOTAL).increment(count);
}

pub fn record_tag_stats_conflict() {
    counter!(names::TAG_STATS_CONFLICTS_TOTAL).increment(1);
}

/// Install the Prometheus recorder with a scrape endpoint on `port`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(port: u16) -> Result<(), BuildError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new().with_http_listener(addr).install()
}
