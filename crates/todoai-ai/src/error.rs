//! AI provider error types and retry classification.

use std::time::Duration;

use thiserror::Error;

/// Result type for AI provider calls.
pub type AiResult<T> = Result<T, AiError>;

/// Base delay for quota exhaustion backoff.
pub const QUOTA_BASE_DELAY: Duration = Duration::from_secs(60 * 60);
/// Upper bound for quota exhaustion backoff.
pub const QUOTA_MAX_DELAY: Duration = Duration::from_secs(24 * 60 * 60);
/// Base delay for rate limit backoff.
pub const RATE_LIMIT_BASE_DELAY: Duration = Duration::from_secs(30);
/// Upper bound for rate limit backoff.
pub const RATE_LIMIT_MAX_DELAY: Duration = Duration::from_secs(15 * 60);

/// Errors returned by a task tagger.
#[derive(Debug, Error)]
pub enum AiError {
    /// The account's quota is used up; retrying soon will not help.
    #[error("AI quota exhausted: {message}")]
    QuotaExhausted {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Too many requests in a short window.
    #[error("AI rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("AI request failed: {0}")]
    Request(String),

    #[error("Invalid AI response: {0}")]
    InvalidResponse(String),

    #[error("AI configuration error: {0}")]
    Config(String),
}

impl AiError {
    pub fn quota_exhausted(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::QuotaExhausted {
            message: message.into(),
            retry_after,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after,
        }
    }

    pub fn request(msg: impl Into<String>) -> Self {
        Self::Request(msg.into())
    }

    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Provider-suggested wait, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AiError::QuotaExhausted { retry_after, .. } | AiError::RateLimited { retry_after, .. } => {
                *retry_after
            }
            _ => None,
        }
    }
}

pub fn is_quota_error(err: &AiError) -> bool {
    matches!(err, AiError::QuotaExhausted { .. })
}

pub fn is_rate_limit_error(err: &AiError) -> bool {
    matches!(err, AiError::RateLimited { .. })
}

/// Delay before retrying a job that failed with `err` on attempt `retry_count`.
///
/// The provider's `retry_after` wins when present. Otherwise quota errors back
/// off from 1h and rate limits from 30s, doubling per attempt up to 24h and
/// 15min respectively. Other errors return zero.
pub fn retry_delay(err: &AiError, retry_count: u32) -> Duration {
    if let Some(after) = err.retry_after() {
        return after;
    }
    match err {
        AiError::QuotaExhausted { .. } => backoff(QUOTA_BASE_DELAY, QUOTA_MAX_DELAY, retry_count),
        AiError::RateLimited { .. } => {
            backoff(RATE_LIMIT_BASE_DELAY, RATE_LIMIT_MAX_DELAY, retry_count)
        }
        _ => Duration::ZERO,
    }
}

fn backoff(base: Duration, max: Duration, retry_count: u32) -> Duration {
    let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let quota = AiError::quota_exhausted("daily limit", None);
        let rate = AiError::rate_limited("slow down", None);
        let other = AiError::request("boom");

        assert!(is_quota_error(&quota));
        assert!(!is_rate_limit_error(&quota));
        assert!(is_rate_limit_error(&rate));
        assert!(!is_quota_error(&other) && !is_rate_limit_error(&other));
    }

    #[test]
    fn test_quota_backoff() {
        let err = AiError::quota_exhausted("q", None);
        assert_eq!(retry_delay(&err, 0), Duration::from_secs(3600));
        assert_eq!(retry_delay(&err, 1), Duration::from_secs(7200));
        assert_eq!(retry_delay(&err, 4), Duration::from_secs(16 * 3600));
        assert_eq!(retry_delay(&err, 5), QUOTA_MAX_DELAY);
        assert_eq!(retry_delay(&err, 40), QUOTA_MAX_DELAY);
    }

    #[test]
    fn test_rate_limit_backoff() {
        let err = AiError::rate_limited("r", None);
        assert_eq!(retry_delay(&err, 0), Duration::from_secs(30));
        assert_eq!(retry_delay(&err, 3), Duration::from_secs(240));
        assert_eq!(retry_delay(&err, 5), RATE_LIMIT_MAX_DELAY);
    }

    #[test]
    fn test_retry_after_wins() {
        let err = AiError::rate_limited("r", Some(Duration::from_secs(7)));
        assert_eq!(retry_delay(&err, 3), Duration::from_secs(7));
        assert_eq!(retry_delay(&AiError::request("x"), 2), Duration::ZERO);
    }
}
