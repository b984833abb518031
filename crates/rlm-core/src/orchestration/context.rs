//! Full-history context for the responder, and its compaction when the
//! history outgrows what one prompt should carry.
//!
//! Compaction saves the full history as a run artifact, splits it on
//! `--- Step N ---` markers into chunks of bounded size, summarises each
//! chunk through the sub-query model and synthesises one answer from the
//! chunk summaries.

use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::artifacts::{ArtifactKind, NewArtifact, RunContext};
use crate::config::CompactionSettings;
use crate::history::ExecutionHistory;
use crate::llm::{CompletionRequest, LanguageModel, LlmError, LlmResult};

pub const FULL_HISTORY_FILENAME: &str = "full_execution_history.md";

const TASK_BRIEF_CHARS: usize = 200;
const EXCERPT_CHARS: usize = 200;
const EXCERPT_THRESHOLD: usize = 500;

const CHUNK_PROMPT: &str = "\
Summarize this section of an execution history. Keep key findings, data and results.";

const SYNTHESIS_PROMPT: &str = "\
Combine the section summaries into one complete Markdown answer to the query.";

/// Every step as `--- Step N ---` followed by its input and output.
pub fn format_full_history(history: &ExecutionHistory) -> String {
    if history.is_empty() {
        return String::new();
    }
    let mut out = String::from("Execution History:\n");
    for entry in history.entries() {
        out.push_str(&format!(
            "--- Step {} ---\nInput: {}\nOutput: {}\n",
            entry.step, entry.code, entry.output
        ));
    }
    out
}

pub struct ContextCompactor {
    settings: CompactionSettings,
    model: Option<Arc<dyn LanguageModel>>,
    run: Option<Arc<RunContext>>,
}

impl ContextCompactor {
    pub fn new(settings: CompactionSettings) -> Self {
        Self {
            settings,
            model: None,
            run: None,
        }
    }

    pub fn with_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_run_context(mut self, run: Arc<RunContext>) -> Self {
        self.run = Some(run);
        self
    }

    pub fn should_compact(&self, context: &str) -> bool {
        context.chars().count() > self.settings.threshold_chars
    }

    /// Splits on step markers, packing whole steps into chunks of at most
    /// `chunk_chars`. A single oversized step stays whole. Text without
    /// markers is cut by size, preferring a newline in the second half.
    pub fn split_into_chunks(&self, context: &str) -> Vec<String> {
        let limit = self.settings.chunk_chars;
        let mut chunks = Vec::new();
        let mut current = String::new();
        for piece in split_steps(context) {
            if !current.is_empty() && current.chars().count() + piece.chars().count() > limit {
                chunks.push(current.trim().to_string());
                current.clear();
            }
            current.push_str(piece);
        }
        if !current.trim().is_empty() {
            chunks.push(current.trim().to_string());
        }

        if chunks.len() <= 1 && context.chars().count() > limit {
            chunks = split_by_size(context, limit);
        }
        tracing::debug!(chunks = chunks.len(), "split context");
        chunks
    }

    /// Writes the full history under the run directory, when there is one.
    pub fn save_full_context(&self, context: &str, task: &str) -> Option<std::path::PathBuf> {
        let run = self.run.as_ref()?;
        let path = run.register_artifact(
            NewArtifact::new(FULL_HISTORY_FILENAME, ArtifactKind::Data)
                .description("Complete execution history with all code and outputs"),
        );
        let content = format!(
            "# Full Execution History\n\n## Task\n\n{task}\n\n## Execution Details\n\n{context}"
        );
        match std::fs::write(&path, content) {
            Ok(()) => {
                tracing::info!(path = %path.display(), "saved full execution history");
                Some(path)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to save execution history");
                None
            }
        }
    }

    /// Summary of one chunk. Model failures other than budget exhaustion
    /// fall back to a head/tail excerpt.
    pub async fn summarize_chunk(&self, chunk: &str, task_brief: &str) -> LlmResult<String> {
        let Some(model) = &self.model else {
            return Ok(excerpt(chunk));
        };
        let user = format!("Task: {task_brief}\n\nSection:\n{chunk}");
        match model.complete(&CompletionRequest::new(CHUNK_PROMPT, user)).await {
            Ok(completion) => Ok(completion.text.trim().to_string()),
            Err(e @ LlmError::Budget(_)) => Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "chunk summarization failed");
                Ok(excerpt(chunk))
            }
        }
    }

    /// One answer built from the chunk summaries of `context`.
    pub async fn compact(&self, task: &str, context: &str, artifacts_info: &str) -> LlmResult<String> {
        tracing::info!(chars = context.chars().count(), "compacting context");
        let mut artifacts_info = artifacts_info.to_string();
        if let Some(path) = self.save_full_context(context, task) {
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
            artifacts_info.push_str(&format!(
                "\n\nFull execution history saved to: {}",
                name.unwrap_or_default()
            ));
        }

        let task_brief = brief(task);
        let mut summaries = Vec::new();
        let chunks = self.split_into_chunks(context);
        for (i, chunk) in chunks.iter().enumerate() {
            tracing::debug!(chunk = i + 1, of = chunks.len(), "summarizing chunk");
            let summary = self.summarize_chunk(chunk, &task_brief).await?;
            if !summary.is_empty() {
                summaries.push(format!("### Section {}\n{}", i + 1, summary));
            }
        }
        let combined = summaries.join("\n\n");

        if let Some(model) = &self.model {
            let mut user = format!("Query: {task}\n\nSection summaries:\n{combined}");
            if !artifacts_info.trim().is_empty() {
                user.push_str(&format!("\n\nArtifacts:\n{}", artifacts_info.trim()));
            }
            match model.complete(&CompletionRequest::new(SYNTHESIS_PROMPT, user)).await {
                Ok(completion) if !completion.text.trim().is_empty() => {
                    return Ok(completion.text.trim().to_string());
                }
                Ok(_) => tracing::warn!("synthesis returned nothing"),
                Err(e @ LlmError::Budget(_)) => return Err(e),
                Err(e) => tracing::warn!(error = %e, "synthesis failed"),
            }
        }

        let mut answer = format!("# Task Summary\n\n{combined}");
        if !artifacts_info.trim().is_empty() {
            answer.push_str(&format!("\n\n## Generated Artifacts\n\n{}", artifacts_info.trim()));
        }
        Ok(answer)
    }
}

fn step_marker() -> Option<&'static Regex> {
    static MARKER: OnceLock<Option<Regex>> = OnceLock::new();
    MARKER
        .get_or_init(|| Regex::new(r"--- Step \d+ ---").ok())
        .as_ref()
}

/// Each marker with the text up to the next one. Text before the first
/// marker stays with the first step.
fn split_steps(context: &str) -> Vec<&str> {
    let Some(marker) = step_marker() else {
        return vec![context];
    };
    let mut starts: Vec<usize> = marker.find_iter(context).map(|m| m.start()).collect();
    match starts.first_mut() {
        Some(first) => *first = 0,
        None => return vec![context],
    }
    starts.push(context.len());
    starts
        .windows(2)
        .map(|w| &context[w[0]..w[1]])
        .filter(|piece| !piece.is_empty())
        .collect()
}

fn split_by_size(context: &str, limit: usize) -> Vec<String> {
    let chars: Vec<char> = context.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + limit).min(chars.len());
        let mut chunk: String = chars[start..end].iter().collect();
        if end < chars.len() {
            if let Some(cut) = chunk.rfind('\n') {
                if chunk[..cut].chars().count() > limit / 2 {
                    chunk.truncate(cut);
                }
            }
        }
        chunks.push(chunk);
        start = end;
    }
    chunks
}

fn brief(task: &str) -> String {
    if task.chars().count() > TASK_BRIEF_CHARS {
        let head: String = task.chars().take(TASK_BRIEF_CHARS).collect();
        format!("{head}...")
    } else {
        task.to_string()
    }
}

fn excerpt(chunk: &str) -> String {
    let len = chunk.chars().count();
    if len <= EXCERPT_THRESHOLD {
        return chunk.to_string();
    }
    let head: String = chunk.chars().take(EXCERPT_CHARS).collect();
    let tail: String = chunk.chars().skip(len - EXCERPT_CHARS).collect();
    format!("[Partial] {head}...\n...[End] {tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FailingModel, ScriptedModel};

    fn settings(threshold_chars: usize, chunk_chars: usize) -> CompactionSettings {
        CompactionSettings {
            threshold_chars,
            chunk_chars,
        }
    }

    fn history(steps: u32, output: &str) -> ExecutionHistory {
        let mut history = ExecutionHistory::new();
        for step in 1..=steps {
            history.add_entry(format!("print({step})"), output, step);
        }
        history
    }

    #[test]
    fn test_format_full_history() {
        assert_eq!(format_full_history(&ExecutionHistory::new()), "");
        let text = format_full_history(&history(2, "ok"));
        assert_eq!(
            text,
            "Execution History:\n--- Step 1 ---\nInput: print(1)\nOutput: ok\n--- Step 2 ---\nInput: print(2)\nOutput: ok\n"
        );
    }

    #[test]
    fn test_should_compact_above_threshold() {
        let compactor = ContextCompactor::new(CompactionSettings::default());
        assert!(!compactor.should_compact(&"x".repeat(32_000)));
        assert!(compactor.should_compact(&"x".repeat(32_001)));
    }

    #[test]
    fn test_chunks_keep_steps_whole() {
        let compactor = ContextCompactor::new(settings(10, 120));
        let text = format_full_history(&history(6, &"y".repeat(30)));
        let chunks = compactor.split_into_chunks(&text);
        assert!(chunks.len() > 1);
        for chunk in &chunks[1..] {
            assert!(chunk.starts_with("--- Step "), "{chunk}");
        }
        let steps: usize = chunks.iter().map(|c| c.matches("--- Step").count()).sum();
        assert_eq!(steps, 6);
    }

    #[test]
    fn test_unmarked_text_split_by_size() {
        let compactor = ContextCompactor::new(settings(10, 100));
        let chunks = compactor.split_into_chunks(&"z".repeat(250));
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].len(), 50);
    }

    #[test]
    fn test_excerpt_keeps_head_and_tail() {
        let chunk = format!("{}{}", "a".repeat(300), "b".repeat(300));
        let text = excerpt(&chunk);
        assert!(text.starts_with("[Partial] aaa"));
        assert!(text.ends_with("bbb"));
        assert_eq!(excerpt("short"), "short");
    }

    #[tokio::test]
    async fn test_compact_saves_history_and_synthesizes() {
        let base = tempfile::tempdir().unwrap();
        let run = Arc::new(RunContext::with_id(base.path(), "compact").unwrap());
        let model = Arc::new(ScriptedModel::new(["summary one", "summary two", "final answer"]));
        let compactor = ContextCompactor::new(settings(10, 60))
            .with_model(model)
            .with_run_context(Arc::clone(&run));
        let text = format_full_history(&history(2, &"w".repeat(40)));

        let answer = compactor.compact("task", &text, "").await.unwrap();
        assert_eq!(answer, "final answer");
        let saved = std::fs::read_to_string(run.working_dir().join(FULL_HISTORY_FILENAME)).unwrap();
        assert!(saved.starts_with("# Full Execution History\n\n## Task\n\ntask"));
        assert!(run.artifacts().iter().any(|a| a.filename == FULL_HISTORY_FILENAME));
    }

    #[tokio::test]
    async fn test_compact_without_model_uses_excerpts() {
        let compactor = ContextCompactor::new(settings(10, 60));
        let text = format_full_history(&history(2, "v"));
        let answer = compactor.compact("task", &text, "chart.png").await.unwrap();
        assert!(answer.starts_with("# Task Summary\n\n### Section 1"));
        assert!(answer.ends_with("## Generated Artifacts\n\nchart.png"));
    }

    #[tokio::test]
    async fn test_failed_model_degrades_to_summary() {
        let compactor =
            ContextCompactor::new(settings(10, 60)).with_model(Arc::new(FailingModel::new("down")));
        let text = format_full_history(&history(1, "v"));
        let answer = compactor.compact("task", &text, "").await.unwrap();
        assert!(answer.starts_with("# Task Summary"));
        assert!(answer.contains("Output: v"));
    }
}
