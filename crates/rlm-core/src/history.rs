//! Append-only log of execution turns.
//!
//! The router only ever sees [`ExecutionHistory::metadata_summary`] and a
//! preview of the last output; full entries stay reachable from generated
//! code through the `history` binding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sandbox::Value;

/// Steps listed individually in the metadata summary.
pub const SUMMARY_WINDOW: usize = 5;

pub const DEFAULT_PREVIEW_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step: u32,
    pub code: String,
    pub output: String,
    /// Length of `output` in characters.
    pub output_length: usize,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    /// The dict bound into the sandbox for this entry.
    pub fn to_value(&self) -> Value {
        Value::str_dict([
            ("code", Value::str(self.code.as_str())),
            ("output", Value::str(self.output.as_str())),
            ("step", Value::Int(i64::from(self.step))),
            ("output_length", Value::Int(self.output_length as i64)),
            ("timestamp", Value::str(self.timestamp.to_rfc3339())),
        ])
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionHistory {
    entries: Vec<HistoryEntry>,
}

impl ExecutionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry(&mut self, code: impl Into<String>, output: impl Into<String>, step: u32) -> &HistoryEntry {
        let output = output.into();
        let entry = HistoryEntry {
            step,
            code: code.into(),
            output_length: output.chars().count(),
            output,
            timestamp: Utc::now(),
        };
        self.entries.push(entry);
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Characters of code plus output across every step.
    pub fn total_chars(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.code.chars().count() + e.output_length)
            .sum()
    }

    /// Step count, total size and per-step lengths of the last few steps.
    pub fn metadata_summary(&self) -> String {
        if self.entries.is_empty() {
            return "Execution History: 0 steps. No code executed yet.".to_string();
        }
        let mut out = format!(
            "Execution History: {} steps, {} chars total",
            self.entries.len(),
            self.total_chars()
        );
        let skipped = self.entries.len().saturating_sub(SUMMARY_WINDOW);
        if skipped > 0 {
            out.push_str(&format!("\n  ... {skipped} earlier steps omitted"));
        }
        for entry in &self.entries[skipped..] {
            out.push_str(&format!(
                "\n  Step {}: {} chars code -> {} chars output",
                entry.step,
                entry.code.chars().count(),
                entry.output_length
            ));
        }
        out
    }

    /// `Last output:` followed by at most `max_chars` characters of the most
    /// recent output, noting the full length when truncated.
    pub fn last_output_preview(&self, max_chars: usize) -> String {
        let Some(entry) = self.entries.last() else {
            return String::new();
        };
        match entry.output.char_indices().nth(max_chars) {
            Some((cut, _)) => format!(
                "Last output:\n{}\n... ({} chars)",
                &entry.output[..cut],
                entry.output_length
            ),
            None => format!("Last output:\n{}", entry.output),
        }
    }

    pub fn last_output(&self) -> &str {
        self.entries.last().map_or("", |e| e.output.as_str())
    }

    /// The `history` list as sandboxed code sees it.
    pub fn to_value(&self) -> Value {
        Value::list(self.entries.iter().map(HistoryEntry::to_value).collect())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_entry_computes_length() {
        let mut history = ExecutionHistory::new();
        let entry = history.add_entry("print('é')", "é", 1);
        assert_eq!(entry.output_length, 1);
        assert_eq!(history.len(), 1);
        assert_eq!(history.last_output(), "é");
    }

    #[test]
    fn test_empty_summary() {
        let history = ExecutionHistory::new();
        assert_eq!(
            history.metadata_summary(),
            "Execution History: 0 steps. No code executed yet."
        );
        assert_eq!(history.last_output_preview(10), "");
        assert_eq!(history.last_output(), "");
    }

    #[test]
    fn test_summary_is_bounded_to_recent_steps() {
        let mut history = ExecutionHistory::new();
        for step in 1..=8 {
            history.add_entry("x", "yy", step);
        }
        let summary = history.metadata_summary();
        assert!(summary.starts_with("Execution History: 8 steps, 24 chars total"));
        assert!(summary.contains("3 earlier steps omitted"));
        assert!(!summary.contains("Step 3:"));
        assert!(summary.contains("Step 4: 1 chars code -> 2 chars output"));
        assert!(summary.contains("Step 8:"));
    }

    #[test]
    fn test_preview_truncates_with_total_length() {
        let mut history = ExecutionHistory::new();
        history.add_entry("", "abcdefghij", 1);
        assert_eq!(history.last_output_preview(4), "Last output:\nabcd\n... (10 chars)");
        assert_eq!(history.last_output_preview(10), "Last output:\nabcdefghij");
    }

    #[test]
    fn test_clear() {
        let mut history = ExecutionHistory::new();
        history.add_entry("a", "b", 1);
        history.clear();
        assert!(history.is_empty());
    }

    #[test]
    fn test_sandbox_value_shape() {
        let mut history = ExecutionHistory::new();
        history.add_entry("print(1)", "1", 1);
        let repr = history.to_value().repr();
        assert!(repr.starts_with("[{'code': 'print(1)', 'output': '1', 'step': 1, 'output_length': 1"));
    }
}
