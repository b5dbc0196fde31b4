//! Structured job logging and tracing setup.

use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn, Span};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use todoai_models::Job;

/// Job logger for structured logging with consistent formatting.
///
/// Every line carries the job id, job type, owning user and delivery attempt.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    job_type: &'static str,
    user_id: String,
    attempt: u32,
}

impl JobLogger {
    pub fn new(job: &Job) -> Self {
        Self {
            job_id: job.id.to_string(),
            job_type: job.job_type.as_str(),
            user_id: job.user_id.clone(),
            attempt: job.retry_count + 1,
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            job_type = self.job_type,
            user_id = %self.user_id,
            attempt = self.attempt,
            "Job started: {}", message
        );
    }

    pub fn log_progress(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            job_type = self.job_type,
            user_id = %self.user_id,
            attempt = self.attempt,
            "Job progress: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            job_type = self.job_type,
            user_id = %self.user_id,
            attempt = self.attempt,
            "Job warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            job_type = self.job_type,
            user_id = %self.user_id,
            attempt = self.attempt,
            "Job error: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            job_type = self.job_type,
            user_id = %self.user_id,
            attempt = self.attempt,
            "Job completed: {}", message
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn job_type(&self) -> &str {
        self.job_type
    }

    /// 1 for a first delivery.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Span wrapping the whole handling of one delivery.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            job_type = self.job_type,
            user_id = %self.user_id,
            attempt = self.attempt
        )
    }
}

/// Install the global subscriber: JSON lines when `json` is set, ANSI text
/// otherwise. `RUST_LOG` refines the default `todoai=info` filter.
pub fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive(
            "todoai=info"
                .parse()
                .unwrap_or_else(|_| LevelFilter::INFO.into()),
        );

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_logger_fields() {
        let job = Job::task_analysis("u1", "t1");
        let logger = JobLogger::new(&job);

        assert_eq!(logger.job_id(), job.id.as_str());
        assert_eq!(logger.job_type(), "task_analysis");
        assert_eq!(logger.attempt(), 1);

        let mut retried = job.clone();
        retried.increment_retry();
        assert_eq!(JobLogger::new(&retried).attempt(), 2);
    }
}
