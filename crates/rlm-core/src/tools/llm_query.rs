//! `llm_query`: one model call scoped to a single context chunk.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::llm::{CompletionRequest, LanguageModel};
use crate::obs;

pub const DEFAULT_MAX_CHUNK_CHARS: usize = 50_000;

const TRUNCATION_MARKER: &str = "\n... [truncated]";

const SYSTEM_PROMPT: &str = "Process a chunk of context and answer a specific question about it. \
Answer concisely, using only the chunk.";

pub struct SubQueryTool {
    model: Arc<dyn LanguageModel>,
    max_chunk_chars: usize,
    calls: AtomicU64,
}

impl SubQueryTool {
    pub fn new(model: Arc<dyn LanguageModel>, max_chunk_chars: usize) -> Self {
        Self {
            model,
            max_chunk_chars,
            calls: AtomicU64::new(0),
        }
    }

    /// Answers `question` over `chunk`. Never fails: errors come back as
    /// `[Error in llm_query: ...]`.
    pub async fn query(&self, question: &str, chunk: &str) -> String {
        let n = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if chunk.chars().count() > self.max_chunk_chars {
            tracing::warn!(max_chars = self.max_chunk_chars, "llm_query context truncated");
        }
        let chunk = truncate_chunk(chunk, self.max_chunk_chars);
        tracing::debug!(call = n, question = %preview(question, 50), "llm_query");

        let request = CompletionRequest::new(
            SYSTEM_PROMPT,
            format!("Question: {question}\n\nContext chunk:\n{chunk}"),
        );
        match self.model.complete(&request).await {
            Ok(completion) => completion.text,
            Err(e) => {
                obs::emit_tool_failed("llm_query", &e);
                format!("[Error in llm_query: {e}]")
            }
        }
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn reset_count(&self) {
        self.calls.store(0, Ordering::Relaxed);
    }

    pub fn max_chunk_chars(&self) -> usize {
        self.max_chunk_chars
    }
}

/// Keeps the first `max_chars` characters and appends a truncation marker.
pub fn truncate_chunk(chunk: &str, max_chars: usize) -> String {
    match chunk.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}{TRUNCATION_MARKER}", &chunk[..cut]),
        None => chunk.to_string(),
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FailingModel, RecordingModel};

    #[test]
    fn test_truncate_chunk() {
        assert_eq!(truncate_chunk("abc", 5), "abc");
        assert_eq!(truncate_chunk("abcdef", 3), "abc\n... [truncated]");
        assert_eq!(truncate_chunk("héllo", 2), "hé\n... [truncated]");
    }

    #[tokio::test]
    async fn test_query_sends_truncated_chunk_and_counts() {
        let model = Arc::new(RecordingModel::new("answer"));
        let tool = SubQueryTool::new(model.clone(), 4);
        assert_eq!(tool.query("what?", "0123456789").await, "answer");
        assert_eq!(tool.call_count(), 1);

        let prompt = model.last_prompt().unwrap();
        assert!(prompt.contains("Context chunk:\n0123\n... [truncated]"));
        assert!(!prompt.contains("0123456789"));

        tool.reset_count();
        assert_eq!(tool.call_count(), 0);
    }

    #[tokio::test]
    async fn test_query_failure_is_text() {
        let tool = SubQueryTool::new(Arc::new(FailingModel::new("boom")), 100);
        let text = tool.query("q", "c").await;
        assert!(text.starts_with("[Error in llm_query:"));
        assert!(text.contains("boom"));
    }
}
