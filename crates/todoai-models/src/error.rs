//! Model validation errors.

use thiserror::Error;

pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Invalid job: {0}")]
    InvalidJob(String),
}

impl ModelError {
    pub fn invalid_job(msg: impl Into<String>) -> Self {
        Self::InvalidJob(msg.into())
    }
}
