//! User-level records consumed by the workers.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Activity tracking for a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct UserActivity {
    pub user_id: String,
    pub last_active_at: DateTime<Utc>,
    /// The user switched off automatic reprocessing.
    #[serde(default)]
    pub reprocessing_paused: bool,
}

impl UserActivity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            last_active_at: Utc::now(),
            reprocessing_paused: false,
        }
    }

    pub fn paused(mut self) -> Self {
        self.reprocessing_paused = true;
        self
    }
}

/// Free-form preferences fed to the AI as prompt context.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct UserPreferences {
    pub user_id: String,
    #[serde(default)]
    pub context: String,
}
