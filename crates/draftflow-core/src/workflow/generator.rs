use async_trait::async_trait;
use thiserror::Error;

use super::input::WorkflowInput;
use crate::retry::Retryable;

/// Failure reported by a draft generator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    /// Worth retrying (timeouts, rate limits, 5xx).
    #[error("transient generation failure: {0}")]
    Transient(String),
    /// Retrying will not help (rejected prompt, bad request).
    #[error("generation rejected: {0}")]
    Permanent(String),
}

impl Retryable for GenerationError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Unreliable remote call that turns an input into draft text.
#[async_trait]
pub trait DraftGenerator: Send + Sync {
    async fn generate(&self, input: &WorkflowInput) -> Result<String, GenerationError>;
}
