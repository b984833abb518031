//! Language model abstraction.
//!
//! - [`LanguageModel`] - one chat-completion call
//! - [`BudgetedModel`] - wraps any model with the shared [`BudgetLedger`]
//! - [`openai::OpenAiCompatibleClient`] - HTTP provider

pub mod error;
pub mod openai;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::budget::{estimate_tokens, BudgetLedger};
use crate::metrics::METRICS;

pub use error::{LlmError, LlmResult};
pub use openai::OpenAiCompatibleClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    /// A system instruction followed by one user message.
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(system), Message::user(user)],
            ..Self::default()
        }
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// All message text, used for token estimates.
    pub fn prompt_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    /// Provider-reported usage, when available.
    pub usage: Option<Usage>,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: None,
        }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Identifier used for pricing in the ledger.
    fn model_id(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> LlmResult<Completion>;
}

/// Checks the ledger before every call and records usage after it.
#[derive(Clone)]
pub struct BudgetedModel {
    inner: Arc<dyn LanguageModel>,
    ledger: Arc<BudgetLedger>,
}

impl BudgetedModel {
    pub fn new(inner: Arc<dyn LanguageModel>, ledger: Arc<BudgetLedger>) -> Self {
        Self { inner, ledger }
    }

    pub fn ledger(&self) -> &Arc<BudgetLedger> {
        &self.ledger
    }
}

#[async_trait]
impl LanguageModel for BudgetedModel {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    async fn complete(&self, request: &CompletionRequest) -> LlmResult<Completion> {
        self.ledger.check()?;
        METRICS.inc_model_calls();
        let completion = self.inner.complete(request).await?;
        let usage = completion.usage.unwrap_or_else(|| Usage {
            input_tokens: estimate_tokens(&request.prompt_text()),
            output_tokens: estimate_tokens(&completion.text),
        });
        self.ledger
            .add_usage(usage.input_tokens, usage.output_tokens, Some(self.model_id()));
        Ok(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::ModelPricing;
    use crate::fakes::ScriptedModel;

    #[tokio::test]
    async fn test_budgeted_model_records_estimate() {
        let ledger = Arc::new(BudgetLedger::new(1.0));
        ledger.register_model(
            "scripted",
            ModelPricing {
                input_per_1m: 1_000_000.0,
                output_per_1m: 0.0,
            },
        );
        let model = BudgetedModel::new(Arc::new(ScriptedModel::new(["ok"])), Arc::clone(&ledger));
        let request = CompletionRequest::new("sys", "12345678");
        model.complete(&request).await.unwrap();
        let stats = ledger.model_stats("scripted").unwrap();
        // "sys\n12345678" is 12 chars
        assert_eq!(stats.input_tokens, 3);
        assert_eq!(stats.output_tokens, 0);
    }

    #[tokio::test]
    async fn test_budgeted_model_refuses_when_exhausted() {
        let ledger = Arc::new(BudgetLedger::new(0.000_001));
        ledger.add_usage(1_000_000, 0, None);
        let model = BudgetedModel::new(Arc::new(ScriptedModel::new(["unused"])), ledger);
        let err = model
            .complete(&CompletionRequest::new("s", "u"))
            .await
            .unwrap_err();
        assert!(err.is_budget());
    }

    #[test]
    fn test_prompt_text_joins_messages() {
        let request = CompletionRequest::new("a", "b");
        assert_eq!(request.prompt_text(), "a\nb");
    }
}
