//! `recursive_llm`: runs a sub-task in a child agent one level deeper.

use std::sync::Arc;

use async_trait::async_trait;

use crate::metrics::METRICS;
use crate::obs;
use crate::orchestration::AgentError;

/// Builds and runs a child agent.
///
/// Implementations share the parent's budget ledger and run directory but
/// give the child a fresh namespace.
#[async_trait]
pub trait ChildSpawner: Send + Sync {
    async fn spawn(&self, task: String, depth: u32) -> Result<String, AgentError>;
}

#[derive(Clone)]
pub struct DelegationTool {
    depth: u32,
    max_depth: u32,
    spawner: Option<Arc<dyn ChildSpawner>>,
}

impl DelegationTool {
    pub fn new(depth: u32, max_depth: u32, spawner: Option<Arc<dyn ChildSpawner>>) -> Self {
        Self {
            depth,
            max_depth,
            spawner,
        }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Runs `task` with `context` appended in a child agent. Never fails.
    pub async fn delegate(&self, task: &str, context: &str) -> String {
        if self.depth >= self.max_depth {
            return format!(
                "[Max recursion depth ({}) reached. Cannot delegate further.]",
                self.max_depth
            );
        }
        let Some(spawner) = &self.spawner else {
            return "[Delegation not configured. Set agent_config to enable recursive_llm.]"
                .to_string();
        };

        METRICS.inc_delegations();
        let child_task = format!("{task}\n\nContext:\n{context}");
        tracing::info!(depth = self.depth + 1, "delegating to child agent");
        match spawner.spawn(child_task, self.depth + 1).await {
            Ok(answer) => answer,
            Err(e) => {
                obs::emit_tool_failed("recursive_llm", &e);
                format!("[Delegation failed: {e}]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeSpawner;

    #[tokio::test]
    async fn test_refuses_at_max_depth() {
        let spawner = Arc::new(FakeSpawner::answering("never"));
        let tool = DelegationTool::new(2, 2, Some(spawner.clone()));
        assert_eq!(
            tool.delegate("t", "").await,
            "[Max recursion depth (2) reached. Cannot delegate further.]"
        );
        assert!(spawner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured() {
        let tool = DelegationTool::new(0, 3, None);
        assert!(tool.delegate("t", "").await.starts_with("[Delegation not configured."));
    }

    #[tokio::test]
    async fn test_spawns_child_one_level_deeper() {
        let spawner = Arc::new(FakeSpawner::answering("child answer"));
        let tool = DelegationTool::new(1, 3, Some(spawner.clone()));
        assert_eq!(tool.delegate("sum it", "1 2 3").await, "child answer");
        assert_eq!(
            spawner.calls(),
            vec![("sum it\n\nContext:\n1 2 3".to_string(), 2)]
        );
    }

    #[tokio::test]
    async fn test_child_failure_is_text() {
        let tool = DelegationTool::new(0, 3, Some(Arc::new(FakeSpawner::failing())));
        assert!(tool.delegate("t", "").await.starts_with("[Delegation failed:"));
    }
}
