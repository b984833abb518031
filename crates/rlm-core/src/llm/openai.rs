//! OpenAI-compatible chat-completions provider.
//!
//! Works against OpenAI itself and any server speaking the same protocol
//! (Ollama, Gemini's compatibility endpoint, vLLM, LM Studio).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{Completion, CompletionRequest, LanguageModel, LlmError, LlmResult, Message, Usage};
use crate::config::ModelSettings;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub struct OpenAiCompatibleClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    provider: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl OpenAiCompatibleClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            provider: "openai-compatible".to_string(),
            temperature: None,
            max_tokens: None,
        }
    }

    /// Builds a client for one role, reading the API key from the environment.
    pub fn from_settings(settings: &ModelSettings) -> LlmResult<Self> {
        let api_key = match settings.api_key_env() {
            Some(var) => Some(
                std::env::var(var).map_err(|_| LlmError::MissingApiKey { var: var.to_string() })?,
            ),
            None => None,
        };
        let mut client = Self::new(settings.base_url(), settings.model.clone(), api_key);
        client.provider = format!("{:?}", settings.provider).to_lowercase();
        client.temperature = settings.temperature;
        client.max_tokens = settings.max_tokens;
        Ok(client)
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleClient {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> LlmResult<Completion> {
        let body = ChatRequest {
            model: &self.model,
            messages: &request.messages,
            temperature: request.temperature.or(self.temperature),
            max_tokens: request.max_tokens.or(self.max_tokens),
        };
        let mut builder = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        tracing::debug!(model = %self.model, messages = request.messages.len(), "chat completion");
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let reason = serde_json::from_str::<ErrorBody>(&text)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("{status}: {text}"));
            return Err(LlmError::RequestFailed {
                provider: self.provider.clone(),
                reason,
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| LlmError::InvalidResponse {
            provider: self.provider.clone(),
            reason: e.to_string(),
        })?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: self.provider.clone(),
                reason: "no choices in response".to_string(),
            })?;
        Ok(Completion {
            text: choice.message.content.unwrap_or_default(),
            usage: parsed.usage.map(|u| Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let client = OpenAiCompatibleClient::new("http://localhost:11434/v1/", "m", None);
        assert_eq!(client.endpoint(), "http://localhost:11434/v1/chat/completions");
        assert_eq!(client.model_id(), "m");
    }

    #[test]
    fn test_request_serialization_skips_unset_fields() {
        let messages = vec![Message::user("hi")];
        let body = ChatRequest {
            model: "m",
            messages: &messages,
            temperature: None,
            max_tokens: Some(5),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "model": "m",
                "messages": [{"role": "user", "content": "hi"}],
                "max_tokens": 5
            })
        );
    }

    #[test]
    fn test_response_parsing() {
        let parsed: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"content":"4"}}],"usage":{"prompt_tokens":7,"completion_tokens":1}}"#,
        )
        .unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("4"));
        assert_eq!(parsed.usage.unwrap().prompt_tokens, 7);
    }

    #[test]
    fn test_missing_api_key() {
        let settings = ModelSettings {
            api_key_env: Some("RLM_TEST_KEY_THAT_IS_NEVER_SET".into()),
            ..ModelSettings::default()
        };
        let err = OpenAiCompatibleClient::from_settings(&settings).err().unwrap();
        assert!(matches!(err, LlmError::MissingApiKey { .. }));
    }
}
