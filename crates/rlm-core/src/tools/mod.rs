//! Host capabilities callable from sandboxed code.
//!
//! The interpreter never captures host state. A tool call becomes a
//! [`ToolRequest`] handed to the execution's [`ToolHost`], which blocks until
//! the matching [`ToolResponse`] is ready. Every tool is total: failures come
//! back as text or error records.
//!
//! - [`search`] - `search_web`, backed by a [`search::SearchProvider`]
//! - [`llm_query`] - single-shot sub-query over a context chunk
//! - [`delegation`] - `recursive_llm`, spawning a child agent

pub mod delegation;
pub mod llm_query;
pub mod search;

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::runtime::{Builder, Handle, RuntimeFlavor};

use crate::obs;

pub use delegation::{ChildSpawner, DelegationTool};
pub use llm_query::SubQueryTool;
pub use search::{DuckDuckGoSearch, SearchError, SearchProvider, SearchResult};

/// The callables bound into the sandbox namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    SearchWeb,
    LlmQuery,
    RecursiveLlm,
}

impl ToolKind {
    pub const ALL: [ToolKind; 3] = [Self::SearchWeb, Self::LlmQuery, Self::RecursiveLlm];

    /// Name the tool is bound under inside the sandbox.
    pub fn name(self) -> &'static str {
        match self {
            Self::SearchWeb => "search_web",
            Self::LlmQuery => "llm_query",
            Self::RecursiveLlm => "recursive_llm",
        }
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A call emitted by sandboxed code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolRequest {
    Search { query: String, max_results: usize },
    SubQuery { question: String, chunk: String },
    Delegate { task: String, context: String },
}

impl ToolRequest {
    pub fn kind(&self) -> ToolKind {
        match self {
            Self::Search { .. } => ToolKind::SearchWeb,
            Self::SubQuery { .. } => ToolKind::LlmQuery,
            Self::Delegate { .. } => ToolKind::RecursiveLlm,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolResponse {
    /// Structured records, e.g. search hits.
    Records(Vec<serde_json::Value>),
    Text(String),
}

/// Answers tool requests on behalf of one execution.
///
/// Called from the blocking interpreter thread; implementations may block.
pub trait ToolHost: Send + Sync {
    fn handle(&self, request: ToolRequest) -> ToolResponse;
}

/// The standard host: search, sub-query and delegation for one agent.
#[derive(Clone)]
pub struct Toolbox {
    search: Option<Arc<dyn SearchProvider>>,
    sub_query: Option<Arc<SubQueryTool>>,
    delegation: DelegationTool,
}

impl Toolbox {
    pub fn new(delegation: DelegationTool) -> Self {
        Self {
            search: None,
            sub_query: None,
            delegation,
        }
    }

    pub fn with_search(mut self, provider: Arc<dyn SearchProvider>) -> Self {
        self.search = Some(provider);
        self
    }

    pub fn with_sub_query(mut self, tool: Arc<SubQueryTool>) -> Self {
        self.sub_query = Some(tool);
        self
    }

    pub fn sub_query(&self) -> Option<&Arc<SubQueryTool>> {
        self.sub_query.as_ref()
    }

    pub fn delegation(&self) -> &DelegationTool {
        &self.delegation
    }
}

impl ToolHost for Toolbox {
    fn handle(&self, request: ToolRequest) -> ToolResponse {
        let kind = request.kind();
        tracing::debug!(tool = %kind, "tool call");
        match request {
            ToolRequest::Search { query, max_results } => {
                let provider = self.search.clone();
                let records = block_on(async move {
                    search::search_web(provider.as_deref(), &query, max_results).await
                });
                match records {
                    Ok(records) => ToolResponse::Records(records),
                    Err(e) => {
                        obs::emit_tool_failed(kind.name(), &e);
                        ToolResponse::Records(vec![search::error_record(&e)])
                    }
                }
            }
            ToolRequest::SubQuery { question, chunk } => {
                let Some(tool) = self.sub_query.clone() else {
                    return ToolResponse::Text(
                        "[Error in llm_query: no sub-query model configured]".to_string(),
                    );
                };
                let text = block_on(async move { tool.query(&question, &chunk).await });
                ToolResponse::Text(text.unwrap_or_else(|e| format!("[Error in llm_query: {e}]")))
            }
            ToolRequest::Delegate { task, context } => {
                let delegation = self.delegation.clone();
                let text = block_on(async move { delegation.delegate(&task, &context).await });
                ToolResponse::Text(text.unwrap_or_else(|e| format!("[Delegation failed: {e}]")))
            }
        }
    }
}

/// Failure to drive a tool future to completion from the interpreter thread.
#[derive(Debug, thiserror::Error)]
#[error("tool runtime unavailable: {0}")]
pub struct BlockOnError(String);

/// Runs `future` to completion from synchronous interpreter code.
///
/// Inside a multi-threaded runtime (the sandbox thread enters the caller's
/// handle) the ambient handle is used; otherwise a private current-thread
/// runtime drives the future.
pub fn block_on<F>(future: F) -> Result<F::Output, BlockOnError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            Ok(tokio::task::block_in_place(|| handle.block_on(future)))
        }
        Ok(_) => {
            // A current-thread runtime cannot be re-entered from its own thread.
            std::thread::spawn(move || private_runtime().map(|rt| rt.block_on(future)))
                .join()
                .map_err(|_| BlockOnError("tool thread panicked".to_string()))?
        }
        Err(_) => Ok(private_runtime()?.block_on(future)),
    }
}

fn private_runtime() -> Result<tokio::runtime::Runtime, BlockOnError> {
    Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| BlockOnError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeSearch, ScriptedModel};
    use crate::llm::LanguageModel;

    fn toolbox() -> Toolbox {
        let model: Arc<dyn LanguageModel> = Arc::new(ScriptedModel::new(["chunk answer"]));
        Toolbox::new(DelegationTool::new(0, 3, None))
            .with_search(Arc::new(FakeSearch::with_results(vec![SearchResult {
                title: "Rust".into(),
                href: "https://www.rust-lang.org".into(),
                body: "A language".into(),
            }])))
            .with_sub_query(Arc::new(SubQueryTool::new(model, 100)))
    }

    #[test]
    fn test_tool_names() {
        let names: Vec<_> = ToolKind::ALL.iter().map(|k| k.name()).collect();
        assert_eq!(names, ["search_web", "llm_query", "recursive_llm"]);
    }

    #[test]
    fn test_search_outside_runtime() {
        let response = toolbox().handle(ToolRequest::Search {
            query: "rust".into(),
            max_results: 5,
        });
        let ToolResponse::Records(records) = response else {
            panic!("expected records");
        };
        assert_eq!(records[0]["title"], "Rust");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sub_query_inside_blocking_worker() {
        let host = toolbox();
        let response = tokio::task::spawn_blocking(move || {
            host.handle(ToolRequest::SubQuery {
                question: "q".into(),
                chunk: "c".into(),
            })
        })
        .await
        .unwrap();
        assert_eq!(response, ToolResponse::Text("chunk answer".into()));
    }

    #[tokio::test]
    async fn test_delegation_without_spawner_on_current_thread_runtime() {
        let response = toolbox().handle(ToolRequest::Delegate {
            task: "t".into(),
            context: String::new(),
        });
        let ToolResponse::Text(text) = response else {
            panic!("expected text");
        };
        assert!(text.starts_with("[Delegation not configured."));
    }

    #[test]
    fn test_sub_query_without_model() {
        let host = Toolbox::new(DelegationTool::new(0, 1, None));
        let ToolResponse::Text(text) = host.handle(ToolRequest::SubQuery {
            question: "q".into(),
            chunk: String::new(),
        }) else {
            panic!("expected text");
        };
        assert!(text.starts_with("[Error in llm_query:"));
    }
}
