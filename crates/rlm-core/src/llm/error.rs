//! Error types for model calls.

use crate::budget::BudgetExceeded;

/// Errors produced by a [`LanguageModel`](super::LanguageModel).
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error(transparent)]
    Budget(#[from] BudgetExceeded),

    #[error("request to {provider} failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("missing API key: environment variable {var} is not set")]
    MissingApiKey { var: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("model error: {0}")]
    Other(String),
}

impl LlmError {
    /// Budget exhaustion aborts a task; every other failure degrades.
    pub fn is_budget(&self) -> bool {
        matches!(self, LlmError::Budget(_))
    }

    pub fn budget(&self) -> Option<&BudgetExceeded> {
        match self {
            LlmError::Budget(b) => Some(b),
            _ => None,
        }
    }
}

/// Result type for model calls.
pub type LlmResult<T> = std::result::Result<T, LlmError>;
