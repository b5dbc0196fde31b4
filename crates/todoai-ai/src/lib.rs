//! Task tagging for the todoai workers.
//!
//! [`TaskTagger`] is the contract the workers call; [`GeminiTagger`] is the
//! production implementation. Provider failures carry enough structure for
//! the retry policy to tell quota exhaustion from rate limiting.

pub mod error;
pub mod gemini;
pub mod tagger;

pub use error::{
    is_quota_error, is_rate_limit_error, retry_delay, AiError, AiResult, QUOTA_MAX_DELAY,
    RATE_LIMIT_MAX_DELAY,
};
pub use gemini::{GeminiConfig, GeminiTagger};
pub use tagger::{DueDateTagger, TaskAnalysis, TaskTagger};
