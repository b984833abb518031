//! Error types for the agent loop.

use crate::artifacts::ArtifactError;
use crate::budget::BudgetExceeded;
use crate::config::ConfigError;
use crate::llm::LlmError;

/// Failures that end an agent run.
///
/// Turn-level failures (compilation, execution, tool calls, a confused
/// router) never show up here; they are folded into history as text.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    BudgetExceeded(#[from] BudgetExceeded),

    #[error("execution worker failed: {0}")]
    Worker(String),

    #[error(transparent)]
    Model(LlmError),

    #[error("{role} failed: {reason}")]
    Role { role: String, reason: String },

    #[error("artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl AgentError {
    pub fn is_budget(&self) -> bool {
        matches!(self, AgentError::BudgetExceeded(_))
    }
}

impl From<LlmError> for AgentError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Budget(exceeded) => AgentError::BudgetExceeded(exceeded),
            other => AgentError::Model(other),
        }
    }
}

/// Result type for agent runs.
pub type AgentResult<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_llm_error_maps_to_budget_variant() {
        let err: AgentError = LlmError::Budget(BudgetExceeded {
            current: 2.0,
            limit: 1.0,
        })
        .into();
        assert!(err.is_budget());

        let err: AgentError = LlmError::Other("nope".into()).into();
        assert!(matches!(err, AgentError::Model(_)));
        assert_eq!(err.to_string(), "model error: nope");
    }
}
