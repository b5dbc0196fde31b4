//! Gemini client for todo tagging.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use todoai_models::TagStatistics;
use tracing::{debug, warn};

use crate::error::{AiError, AiResult, QUOTA_MAX_DELAY};
use crate::tagger::{DueDateTagger, TaskAnalysis, TaskTagger};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_MODEL: &str = "gemini-2.5-flash";
/// How many of the user's top tags are offered to the model for reuse.
const PROMPT_TAG_LIMIT: usize = 20;

/// Gemini client configuration.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Read `GEMINI_API_KEY` (required), `GEMINI_MODEL` and `GEMINI_BASE_URL`.
    pub fn from_env() -> AiResult<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| AiError::config("GEMINI_API_KEY not set"))?;
        let mut config = Self::new(api_key);
        if let Ok(model) = std::env::var("GEMINI_MODEL") {
            config.model = model;
        }
        if let Ok(base_url) = std::env::var("GEMINI_BASE_URL") {
            config.base_url = base_url;
        }
        Ok(config)
    }
}

/// Gemini API request.
#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    #[serde(rename = "responseMimeType")]
    response_mime_type: String,
}

/// Gemini API response.
#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: ResponseContent,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: String,
}

/// Google API error envelope.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    details: Vec<serde_json::Value>,
}

/// Task tagger backed by the Gemini `generateContent` API.
pub struct GeminiTagger {
    config: GeminiConfig,
    client: Client,
}

impl GeminiTagger {
    pub fn new(config: GeminiConfig) -> AiResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AiError::config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    pub fn from_env() -> AiResult<Self> {
        Self::new(GeminiConfig::from_env()?)
    }

    fn build_prompt(
        &self,
        text: &str,
        context: Option<&str>,
        due: Option<(Option<DateTime<Utc>>, DateTime<Utc>)>,
        tag_stats: Option<&TagStatistics>,
    ) -> String {
        let mut prompt = String::from(
            r#"You categorize todo items.
Return ONLY a single JSON object with this schema:
{"tags": ["tag"], "time_horizon": "next" | "soon" | "later"}
- Use 1 to 3 short lowercase tags.
- "next" means today or tomorrow, "soon" within two weeks, "later" anything beyond.
"#,
        );

        if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
            prompt.push_str(&format!("\nAbout the user:\n{}\n", context.trim()));
        }

        if let Some((due_date, created_at)) = due {
            prompt.push_str(&format!("\nCreated at: {}\n", created_at.to_rfc3339()));
            if let Some(due_date) = due_date {
                prompt.push_str(&format!("Due date: {}\n", due_date.to_rfc3339()));
            }
            prompt.push_str(&format!("Current time: {}\n", Utc::now().to_rfc3339()));
        }

        if let Some(stats) = tag_stats {
            let existing: Vec<&str> = stats
                .top_tags(PROMPT_TAG_LIMIT)
                .into_iter()
                .map(|(tag, _)| tag)
                .collect();
            if !existing.is_empty() {
                prompt.push_str(&format!(
                    "\nPrefer reusing the user's existing tags when they fit: {}\n",
                    existing.join(", ")
                ));
            }
        }

        prompt.push_str(&format!("\nTODO:\n{}\n", text));
        prompt
    }

    async fn generate(&self, prompt: String) -> AiResult<TaskAnalysis> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        );

        let request = GeminiRequest {
            contents: vec![Content {
                parts: vec![Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                response_mime_type: "application/json".to_string(),
            },
        };

        let response = self
            .client
            .post(&url)
            .query(&[("key", self.config.api_key.as_str())])
            .json(&request)
            .send()
            .await
            .map_err(|e| AiError::request(format!("Gemini API request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, retry_after, &body));
        }

        let gemini_response: GeminiResponse = response
            .json()
            .await
            .map_err(|e| AiError::invalid_response(format!("Failed to parse Gemini response: {}", e)))?;

        let text = gemini_response
            .candidates
            .first()
            .and_then(|c| c.content.parts.first())
            .map(|p| p.text.as_str())
            .ok_or_else(|| AiError::invalid_response("No content in Gemini response"))?;

        debug!(model = %self.config.model, "Gemini analysis received");
        parse_analysis(text)
    }
}

#[async_trait]
impl TaskTagger for GeminiTagger {
    async fn analyze_task(&self, text: &str, context: Option<&str>) -> AiResult<TaskAnalysis> {
        let prompt = self.build_prompt(text, context, None, None);
        self.generate(prompt).await
    }

    fn due_date_capability(&self) -> Option<&dyn DueDateTagger> {
        Some(self)
    }
}

#[async_trait]
impl DueDateTagger for GeminiTagger {
    async fn analyze_task_with_due_date(
        &self,
        text: &str,
        due_date: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
        context: Option<&str>,
        tag_stats: Option<&TagStatistics>,
    ) -> AiResult<TaskAnalysis> {
        let prompt = self.build_prompt(text, context, Some((due_date, created_at)), tag_stats);
        self.generate(prompt).await
    }
}

/// Map a failed HTTP response onto the retry taxonomy.
///
/// 429 and `RESOURCE_EXHAUSTED` are quota exhaustion when the message talks
/// about quota, and rate limiting otherwise.
fn classify_failure(status: StatusCode, retry_after: Option<Duration>, body: &str) -> AiError {
    let envelope = serde_json::from_str::<ErrorEnvelope>(body).ok();
    let (message, api_status, details) = match &envelope {
        Some(e) => (e.error.message.as_str(), e.error.status.as_str(), e.error.details.as_slice()),
        None => (body, "", &[][..]),
    };

    let exhausted = status == StatusCode::TOO_MANY_REQUESTS || api_status == "RESOURCE_EXHAUSTED";
    if !exhausted {
        return AiError::request(format!("Gemini API returned {}: {}", status, message));
    }

    let retry_after = retry_after.or_else(|| retry_info_delay(details));
    if message.to_ascii_lowercase().contains("quota") {
        warn!(%status, "Gemini quota exhausted");
        AiError::quota_exhausted(message, retry_after)
    } else {
        warn!(%status, "Gemini rate limited");
        AiError::rate_limited(message, retry_after)
    }
}

/// `retryDelay` from a `google.rpc.RetryInfo` detail, e.g. `"17s"`.
fn retry_info_delay(details: &[serde_json::Value]) -> Option<Duration> {
    details
        .iter()
        .filter(|d| {
            d.get("@type")
                .and_then(|t| t.as_str())
                .is_some_and(|t| t.ends_with("RetryInfo"))
        })
        .filter_map(|d| d.get("retryDelay").and_then(|v| v.as_str()))
        .find_map(|v| v.trim_end_matches('s').parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .map(|delay| delay.min(QUOTA_MAX_DELAY))
}

fn parse_analysis(text: &str) -> AiResult<TaskAnalysis> {
    // Models sometimes wrap JSON in markdown fences
    let text = text.trim();
    let text = text.strip_prefix("```json").unwrap_or(text);
    let text = text.strip_suffix("```").unwrap_or(text);

    let mut analysis: TaskAnalysis = serde_json::from_str(text.trim())
        .map_err(|e| AiError::invalid_response(format!("Failed to parse analysis JSON: {}", e)))?;
    analysis.tags = analysis
        .tags
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    Ok(analysis)
}
