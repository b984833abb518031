//! Deterministic stand-ins for models, search and child agents, for tests
//! of code that talks to them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::llm::{Completion, CompletionRequest, LanguageModel, LlmError, LlmResult};
use crate::orchestration::{AgentError, Roles};
use crate::tools::{ChildSpawner, SearchError, SearchProvider, SearchResult};

/// Replies from a script in order, repeating the last reply once the script
/// runs out.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    last: Mutex<Option<String>>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new<S: Into<String>>(replies: impl IntoIterator<Item = S>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn model_id(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _request: &CompletionRequest) -> LlmResult<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.replies.lock().pop_front();
        let mut last = self.last.lock();
        if let Some(reply) = next {
            *last = Some(reply);
        }
        last.clone()
            .map(Completion::text)
            .ok_or_else(|| LlmError::Other("no scripted reply".into()))
    }
}

/// Always replies with the same text and keeps every prompt it was sent.
pub struct RecordingModel {
    reply: String,
    prompts: Mutex<Vec<String>>,
}

impl RecordingModel {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().last().cloned()
    }
}

#[async_trait]
impl LanguageModel for RecordingModel {
    fn model_id(&self) -> &str {
        "recording"
    }

    async fn complete(&self, request: &CompletionRequest) -> LlmResult<Completion> {
        self.prompts.lock().push(request.prompt_text());
        Ok(Completion::text(self.reply.clone()))
    }
}

pub struct FailingModel {
    message: String,
}

impl FailingModel {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl LanguageModel for FailingModel {
    fn model_id(&self) -> &str {
        "failing"
    }

    async fn complete(&self, _request: &CompletionRequest) -> LlmResult<Completion> {
        Err(LlmError::Other(self.message.clone()))
    }
}

pub struct FakeSearch {
    outcome: Result<Vec<SearchResult>, String>,
}

impl FakeSearch {
    pub fn with_results(results: Vec<SearchResult>) -> Self {
        Self {
            outcome: Ok(results),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            outcome: Err(message.into()),
        }
    }
}

#[async_trait]
impl SearchProvider for FakeSearch {
    async fn search(&self, _query: &str, max_results: usize) -> Result<Vec<SearchResult>, SearchError> {
        match &self.outcome {
            Ok(results) => Ok(results.iter().take(max_results).cloned().collect()),
            Err(message) => Err(SearchError::Other(message.clone())),
        }
    }
}

/// Records every spawn and answers without running a child.
pub struct FakeSpawner {
    answer: Option<String>,
    calls: Mutex<Vec<(String, u32)>>,
}

impl FakeSpawner {
    pub fn answering(answer: impl Into<String>) -> Self {
        Self {
            answer: Some(answer.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            answer: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, u32)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ChildSpawner for FakeSpawner {
    async fn spawn(&self, task: String, depth: u32) -> Result<String, AgentError> {
        self.calls.lock().push((task, depth));
        self.answer.clone().ok_or_else(|| AgentError::Role {
            role: "child agent".into(),
            reason: "spawn refused".into(),
        })
    }
}

/// Model-backed roles, each driven by its own script.
pub fn scripted_roles<R, C, A, D>(
    router: impl IntoIterator<Item = R>,
    coder: impl IntoIterator<Item = C>,
    responder: impl IntoIterator<Item = A>,
    delegator: impl IntoIterator<Item = D>,
) -> Roles
where
    R: Into<String>,
    C: Into<String>,
    A: Into<String>,
    D: Into<String>,
{
    Roles::from_models(
        Arc::new(ScriptedModel::new(router)),
        Arc::new(ScriptedModel::new(coder)),
        Arc::new(ScriptedModel::new(responder)),
        Arc::new(ScriptedModel::new(delegator)),
        5,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_model_repeats_last_reply() {
        let model = ScriptedModel::new(["a", "b"]);
        let request = CompletionRequest::new("s", "u");
        let mut replies = Vec::new();
        for _ in 0..3 {
            replies.push(model.complete(&request).await.unwrap().text);
        }
        assert_eq!(replies, ["a", "b", "b"]);
        assert_eq!(model.calls(), 3);
    }

    #[tokio::test]
    async fn test_empty_script_fails() {
        let model = ScriptedModel::new(Vec::<String>::new());
        assert!(model.complete(&CompletionRequest::new("s", "u")).await.is_err());
    }
}
