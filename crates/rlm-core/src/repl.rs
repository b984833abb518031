//! A stateful REPL: one namespace, its history and the executor that runs
//! code against it, plus the keyed store that keeps REPLs alive between a
//! task and its follow-ups.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::executor::{CodeExecutor, Execution};
use crate::history::{ExecutionHistory, HistoryEntry};
use crate::orchestration::AgentError;
use crate::sandbox::Namespace;
use crate::termination;

pub struct Repl {
    namespace: Namespace,
    history: ExecutionHistory,
    executor: CodeExecutor,
    step: u32,
}

impl Repl {
    pub fn new(namespace: Namespace, executor: CodeExecutor) -> Self {
        Self {
            namespace,
            history: ExecutionHistory::new(),
            executor,
            step: 0,
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn namespace_mut(&mut self) -> &mut Namespace {
        &mut self.namespace
    }

    pub fn history(&self) -> &ExecutionHistory {
        &self.history
    }

    pub fn executor(&self) -> &CodeExecutor {
        &self.executor
    }

    /// Swaps the executor, e.g. when a follow-up run brings new tools.
    pub fn set_executor(&mut self, executor: CodeExecutor) {
        self.executor = executor;
    }

    pub fn set_task(&mut self, task: &str) {
        self.namespace.set_task(task);
        tracing::debug!(task = %task.chars().take(100).collect::<String>(), "task set");
    }

    /// The step number the next recorded turn will get.
    pub fn next_step(&self) -> u32 {
        self.step + 1
    }

    /// Runs `code` on the calling thread.
    pub fn execute_blocking(&mut self, code: &str) -> Execution {
        self.executor.execute(code, &mut self.namespace)
    }

    /// Runs `code` on a blocking worker so the interpreter never stalls the
    /// async runtime.
    pub async fn execute(&mut self, code: &str) -> Result<Execution, AgentError> {
        let executor = self.executor.clone();
        let snapshot = self.namespace.clone();
        let mut namespace = std::mem::take(&mut self.namespace);
        let code = code.to_string();
        let span = tracing::Span::current();
        let joined = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            let execution = executor.execute(&code, &mut namespace);
            (namespace, execution)
        })
        .await;
        match joined {
            Ok((namespace, execution)) => {
                self.namespace = namespace;
                Ok(execution)
            }
            Err(e) => {
                self.namespace = snapshot;
                Err(AgentError::Worker(e.to_string()))
            }
        }
    }

    /// Appends a turn under the next step number and refreshes the
    /// `history`, `__execution_history__` and `context` bindings.
    pub fn record_turn(&mut self, code: &str, output: &str) -> &HistoryEntry {
        self.step += 1;
        self.history.add_entry(code, output, self.step);
        let history = self.history.to_value();
        self.namespace
            .set_injected("__execution_history__", history.clone());
        self.namespace.set_injected("history", history);
        self.namespace.set_injected(
            "context",
            crate::sandbox::Value::str(self.history.last_output()),
        );
        &self.history.entries()[self.history.len() - 1]
    }

    pub fn metadata_summary(&self) -> String {
        self.history.metadata_summary()
    }

    pub fn last_output_preview(&self, max_chars: usize) -> String {
        self.history.last_output_preview(max_chars)
    }

    /// A termination marker in `output`, resolved against this namespace.
    pub fn check_for_final(&self, output: &str) -> Option<String> {
        termination::resolve(output, &self.namespace)
    }
}

/// REPLs kept for follow-up queries, keyed by task id.
///
/// A REPL is moved out with [`ReplStateStore::take`] while a task runs, so
/// two tasks never share a namespace.
#[derive(Default)]
pub struct ReplStateStore {
    repls: Mutex<HashMap<String, Repl>>,
}

impl ReplStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, task_id: impl Into<String>, repl: Repl) {
        let task_id = task_id.into();
        tracing::debug!(
            task_id = %task_id,
            globals = repl.namespace().globals().len(),
            steps = repl.history().len(),
            "stored repl state"
        );
        self.repls.lock().insert(task_id, repl);
    }

    pub fn take(&self, task_id: &str) -> Option<Repl> {
        self.repls.lock().remove(task_id)
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.repls.lock().contains_key(task_id)
    }

    pub fn clear(&self, task_id: &str) -> bool {
        let removed = self.repls.lock().remove(task_id).is_some();
        if removed {
            tracing::info!(task_id, "cleared repl state");
        }
        removed
    }

    pub fn clear_all(&self) -> usize {
        let mut repls = self.repls.lock();
        let count = repls.len();
        repls.clear();
        tracing::info!(count, "cleared all repl states");
        count
    }

    pub fn len(&self) -> usize {
        self.repls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.repls.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxGlobals;

    fn repl() -> Repl {
        Repl::new(SandboxGlobals::builder().build(), CodeExecutor::default())
    }

    #[test]
    fn test_steps_increase_by_one() {
        let mut repl = repl();
        assert_eq!(repl.next_step(), 1);
        assert_eq!(repl.record_turn("a", "1").step, 1);
        assert_eq!(repl.record_turn("b", "2").step, 2);
        assert_eq!(repl.next_step(), 3);
    }

    #[test]
    fn test_bindings_refresh_after_turn() {
        let mut repl = repl();
        let execution = repl.execute_blocking("print('hello')");
        repl.record_turn(&execution.code, &execution.output);
        let execution = repl.execute_blocking("print(context, len(history), history[0]['step'])");
        assert_eq!(execution.output, "hello 1 1");
    }

    #[test]
    fn test_user_binding_named_context_is_replaced() {
        let mut repl = repl();
        repl.execute_blocking("context = 'mine'");
        repl.record_turn("context = 'mine'", "ok");
        let execution = repl.execute_blocking("print(context)");
        assert_eq!(execution.output, "ok");
    }

    #[test]
    fn test_task_binding() {
        let mut repl = repl();
        repl.set_task("count words");
        assert_eq!(repl.execute_blocking("print(task)").output, "count words");
    }

    #[test]
    fn test_check_for_final_uses_namespace() {
        let mut repl = repl();
        let execution = repl.execute_blocking("answer = 42\nprint(FINAL_VAR('answer'))");
        assert_eq!(execution.output, "FINAL_VAR(answer)");
        assert_eq!(repl.check_for_final(&execution.output).as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_async_execute_keeps_state() {
        let mut repl = repl();
        repl.execute("x = 5").await.unwrap();
        let execution = repl.execute("print(x * 2)").await.unwrap();
        assert_eq!(execution.output, "10");
    }

    #[test]
    fn test_store_take_and_clear() {
        let store = ReplStateStore::new();
        let mut first = repl();
        first.execute_blocking("kept = 'yes'");
        store.store("t1", first);
        store.store("t2", repl());
        assert!(store.contains("t1"));

        let mut restored = store.take("t1").unwrap();
        assert!(!store.contains("t1"));
        assert_eq!(restored.execute_blocking("print(kept)").output, "yes");

        assert!(store.clear("t2"));
        assert!(!store.clear("t2"));
        store.store("t3", repl());
        assert_eq!(store.clear_all(), 1);
        assert!(store.is_empty());
    }
}
