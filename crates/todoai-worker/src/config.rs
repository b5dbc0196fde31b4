//! Worker configuration.

use std::time::Duration;

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// Job executor and processor configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum unacknowledged deliveries held by the consumer
    pub prefetch: usize,
    /// Default `max_retries` for jobs this worker produces
    pub max_retries: u32,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// How long cached tag statistics are used for prompt context
    pub tag_stats_cache_ttl: Duration,
    /// Delay between a tag change and the tag analysis it triggers
    pub tag_debounce: Duration,
    /// Upper bound on how long a rate limit pauses the consumer
    pub rate_limit_pacing: Duration,
    /// Page size for full scans of a user's todos
    pub todo_page_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            prefetch: 4,
            max_retries: todoai_models::DEFAULT_MAX_RETRIES,
            shutdown_timeout: Duration::from_secs(30),
            tag_stats_cache_ttl: Duration::from_secs(300),
            tag_debounce: Duration::from_secs(5),
            rate_limit_pacing: Duration::from_secs(60),
            todo_page_size: 500,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            prefetch: env_parse("WORKER_PREFETCH")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.prefetch),
            max_retries: env_parse("WORKER_MAX_RETRIES").unwrap_or(defaults.max_retries),
            shutdown_timeout: env_parse("WORKER_SHUTDOWN_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
            tag_stats_cache_ttl: env_parse("WORKER_TAG_STATS_CACHE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.tag_stats_cache_ttl),
            tag_debounce: env_parse("WORKER_TAG_DEBOUNCE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.tag_debounce),
            rate_limit_pacing: env_parse("WORKER_RATE_LIMIT_PACING_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.rate_limit_pacing),
            todo_page_size: defaults.todo_page_size,
        }
    }
}

/// Dead-letter garbage collector configuration.
#[derive(Debug, Clone)]
pub struct GcConfig {
    pub interval: Duration,
    /// Dead letters older than this are purged
    pub retention: Duration,
    /// Bound on a single purge run
    pub timeout: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            timeout: Duration::from_secs(30),
        }
    }
}

impl GcConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            interval: env_parse("GC_INTERVAL_SECS")
                .filter(|s: &u64| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.interval),
            retention: env_parse("GC_RETENTION_HOURS")
                .map(|h: u64| Duration::from_secs(h * 60 * 60))
                .unwrap_or(defaults.retention),
            timeout: env_parse("GC_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
        }
    }
}

/// Reprocessing scheduler configuration.
#[derive(Debug, Clone)]
pub struct ReprocessConfig {
    /// Local hours of the daily anchors
    pub anchor_hours: Vec<u32>,
    /// Offset of the local timezone from UTC, in minutes
    pub utc_offset_minutes: i32,
    /// How often the scheduler runs
    pub interval: Duration,
    /// How long after its anchor a reprocessing job stays valid
    pub validity: Duration,
}

impl Default for ReprocessConfig {
    fn default() -> Self {
        Self {
            anchor_hours: vec![8, 20],
            utc_offset_minutes: 0,
            interval: Duration::from_secs(24 * 60 * 60),
            validity: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl ReprocessConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            anchor_hours: std::env::var("REPROCESS_ANCHOR_HOURS")
                .ok()
                .and_then(|s| parse_hours(&s))
                .unwrap_or(defaults.anchor_hours),
            utc_offset_minutes: env_parse("REPROCESS_UTC_OFFSET_MINUTES")
                .filter(|m: &i32| m.abs() < 24 * 60)
                .unwrap_or(defaults.utc_offset_minutes),
            interval: env_parse("REPROCESS_INTERVAL_SECS")
                .filter(|s: &u64| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.interval),
            validity: defaults.validity,
        }
    }
}

/// Parse a comma separated hour list such as `"8,20"`. Invalid lists yield `None`.
fn parse_hours(s: &str) -> Option<Vec<u32>> {
    let mut hours = s
        .split(',')
        .map(|h| h.trim().parse::<u32>().ok().filter(|h| *h < 24))
        .collect::<Option<Vec<_>>>()?;
    hours.sort_unstable();
    hours.dedup();
    (!hours.is_empty()).then_some(hours)
}
