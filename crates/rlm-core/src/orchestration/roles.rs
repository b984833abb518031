//! The four decision roles the loop consults, with model-backed
//! implementations.
//!
//! | Role        | Input                          | Output                 |
//! |-------------|--------------------------------|------------------------|
//! | `Router`    | task, compact context          | [`Action`]             |
//! | `Coder`     | task, compact context          | code                   |
//! | `Responder` | task, full context, artifacts  | markdown answer        |
//! | `Delegator` | task, compact context          | ordered subtasks       |

use std::sync::Arc;

use async_trait::async_trait;

use crate::llm::{CompletionRequest, LanguageModel, LlmResult};
use crate::orchestration::action::Action;

const ROUTER_PROMPT: &str = "\
You decide the next action for an agent working on a task.
Reply with exactly one word:
- CODE when the task needs computation, file access, web search or inspection of earlier results
- ANSWER when the execution history already contains what is needed, or no computation is needed
- DELEGATE when the task splits into independent subtasks";

const CODER_PROMPT: &str = "\
Write Python code that makes progress on the task. Print results to stdout.

Rules:
- No import statements. Pre-loaded: re, json, math, datetime, os, timedelta, date, Counter, defaultdict, OrderedDict, Path, StringIO, statistics, csv
- Use f-strings, not .format()
- No names starting with an underscore, no getattr, setattr, eval or exec
- No class definitions or generators (yield); use functions, dicts and lists
- Integers are 64-bit; use float for values beyond about 9.2e18

Variables: output_dir, input_dir, history, task, context
Functions:
- search_web(query, max_results=5) returns a list of {title, href, body}
- llm_query(question, context_chunk) asks a model about a chunk of text
- recursive_llm(sub_query, sub_context) runs a sub-agent on a sub-task

Variables from earlier steps persist. When the task is solved, print FINAL(\"answer\") or FINAL_VAR('variable_name').
Reply with code only.";

const RESPONDER_PROMPT: &str = "\
Answer the user's query from the context, which holds earlier code and its output.
Format the answer in Markdown with clear sections, bullet points and code blocks where useful.";

const DELEGATOR_PROMPT: &str = "\
Break the task into smaller, independent subtasks that can run in parallel.
Reply with one subtask per line, each starting with '- '.";

#[async_trait]
pub trait Router: Send + Sync {
    async fn decide(&self, task: &str, context: &str) -> LlmResult<Action>;
}

#[async_trait]
pub trait Coder: Send + Sync {
    async fn generate(&self, task: &str, context: &str) -> LlmResult<String>;
}

#[async_trait]
pub trait Responder: Send + Sync {
    /// An empty reply means the model produced nothing usable.
    async fn respond(&self, task: &str, context: &str, artifacts_info: &str) -> LlmResult<String>;
}

#[async_trait]
pub trait Delegator: Send + Sync {
    async fn decompose(&self, task: &str, context: &str) -> LlmResult<Vec<String>>;
}

/// One implementation per role, shared by an agent and its children.
#[derive(Clone)]
pub struct Roles {
    pub router: Arc<dyn Router>,
    pub coder: Arc<dyn Coder>,
    pub responder: Arc<dyn Responder>,
    pub delegator: Arc<dyn Delegator>,
}

impl Roles {
    /// Model-backed roles, one model per role.
    pub fn from_models(
        router: Arc<dyn LanguageModel>,
        coder: Arc<dyn LanguageModel>,
        responder: Arc<dyn LanguageModel>,
        delegator: Arc<dyn LanguageModel>,
        max_subtasks: usize,
    ) -> Self {
        Self {
            router: Arc::new(ModelRouter::new(router)),
            coder: Arc::new(ModelCoder::new(coder)),
            responder: Arc::new(ModelResponder::new(responder)),
            delegator: Arc::new(ModelDelegator::new(delegator, max_subtasks)),
        }
    }

    pub fn single_model(model: Arc<dyn LanguageModel>, max_subtasks: usize) -> Self {
        Self::from_models(
            Arc::clone(&model),
            Arc::clone(&model),
            Arc::clone(&model),
            model,
            max_subtasks,
        )
    }
}

pub struct ModelRouter {
    model: Arc<dyn LanguageModel>,
}

impl ModelRouter {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Router for ModelRouter {
    async fn decide(&self, task: &str, context: &str) -> LlmResult<Action> {
        let user = format!("Task: {task}\n\nContext:\n{context}\n\nAction:");
        let request = CompletionRequest::new(ROUTER_PROMPT, user).with_max_tokens(Some(16));
        let completion = self.model.complete(&request).await?;
        let action = Action::normalize(&completion.text);
        tracing::debug!(raw = %completion.text.trim(), action = %action, "router replied");
        Ok(action)
    }
}

pub struct ModelCoder {
    model: Arc<dyn LanguageModel>,
}

impl ModelCoder {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Coder for ModelCoder {
    async fn generate(&self, task: &str, context: &str) -> LlmResult<String> {
        let user = format!("Task: {task}\n\nExecution history:\n{context}");
        let completion = self
            .model
            .complete(&CompletionRequest::new(CODER_PROMPT, user))
            .await?;
        Ok(completion.text)
    }
}

pub struct ModelResponder {
    model: Arc<dyn LanguageModel>,
}

impl ModelResponder {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Responder for ModelResponder {
    async fn respond(&self, task: &str, context: &str, artifacts_info: &str) -> LlmResult<String> {
        let mut user = format!("Query: {task}\n\nContext:\n{context}");
        if !artifacts_info.is_empty() {
            user.push_str(&format!("\n\nArtifacts:\n{artifacts_info}"));
        }
        let completion = self
            .model
            .complete(&CompletionRequest::new(RESPONDER_PROMPT, user))
            .await?;
        Ok(completion.text.trim().to_string())
    }
}

pub struct ModelDelegator {
    model: Arc<dyn LanguageModel>,
    max_subtasks: usize,
}

impl ModelDelegator {
    pub fn new(model: Arc<dyn LanguageModel>, max_subtasks: usize) -> Self {
        Self {
            model,
            max_subtasks,
        }
    }
}

#[async_trait]
impl Delegator for ModelDelegator {
    async fn decompose(&self, task: &str, context: &str) -> LlmResult<Vec<String>> {
        let user = format!("Task: {task}\n\nContext:\n{context}");
        let completion = self
            .model
            .complete(&CompletionRequest::new(DELEGATOR_PROMPT, user))
            .await?;
        Ok(parse_subtasks(&completion.text, self.max_subtasks))
    }
}

/// Reads `- `, `* ` and `N. ` list items, one per line. Text with no list
/// items becomes a single subtask.
pub fn parse_subtasks(raw: &str, max_subtasks: usize) -> Vec<String> {
    let mut subtasks: Vec<String> = raw
        .lines()
        .map(str::trim)
        .filter_map(list_item)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect();

    if subtasks.is_empty() && !raw.trim().is_empty() {
        subtasks.push(raw.trim().to_string());
    }
    if subtasks.len() > max_subtasks {
        tracing::debug!(parsed = subtasks.len(), kept = max_subtasks, "capping subtasks");
        subtasks.truncate(max_subtasks);
    }
    subtasks
}

fn list_item(line: &str) -> Option<&str> {
    if let Some(rest) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
        return Some(rest.trim());
    }
    if line.starts_with(|c: char| c.is_ascii_digit()) {
        return line.split_once(". ").map(|(_, rest)| rest.trim());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{RecordingModel, ScriptedModel};

    #[test]
    fn test_parse_subtasks_list_styles() {
        let raw = "Plan:\n- fetch data\n* clean it\n3. plot it\n\nnotes";
        assert_eq!(parse_subtasks(raw, 5), ["fetch data", "clean it", "plot it"]);
    }

    #[test]
    fn test_parse_subtasks_raw_fallback_and_cap() {
        assert_eq!(parse_subtasks("  do everything  ", 5), ["do everything"]);
        assert!(parse_subtasks("   ", 5).is_empty());
        assert_eq!(parse_subtasks("- a\n- b\n- c", 2), ["a", "b"]);
    }

    #[tokio::test]
    async fn test_model_router_normalizes_reply() {
        let router = ModelRouter::new(Arc::new(ScriptedModel::new([
            "I think we should write CODE for this",
        ])));
        assert_eq!(router.decide("t", "").await.unwrap(), Action::Code);
    }

    #[tokio::test]
    async fn test_model_delegator_parses_reply() {
        let delegator = ModelDelegator::new(Arc::new(ScriptedModel::new(["- a\n- b"])), 5);
        assert_eq!(delegator.decompose("t", "").await.unwrap(), ["a", "b"]);
    }

    #[tokio::test]
    async fn test_coder_prompt_states_language_limits() {
        let model = Arc::new(RecordingModel::new("print(1)"));
        let coder = ModelCoder::new(model.clone());
        assert_eq!(coder.generate("t", "").await.unwrap(), "print(1)");
        let prompt = model.last_prompt().unwrap();
        assert!(prompt.contains("No class definitions or generators"));
        assert!(prompt.contains("Integers are 64-bit"));
    }

    #[tokio::test]
    async fn test_responder_prompt_includes_artifacts() {
        let model = Arc::new(RecordingModel::new("  done  "));
        let responder = ModelResponder::new(model.clone());
        let answer = responder.respond("q", "ctx", "chart.png | image").await.unwrap();
        assert_eq!(answer, "done");
        assert!(model.last_prompt().unwrap().contains("Artifacts:\nchart.png | image"));
    }
}
