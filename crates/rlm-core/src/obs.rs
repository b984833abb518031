//! Structured observability hooks for agent lifecycle events.
//!
//! This module provides:
//! - An agent-scoped tracing span via [`agent_span`]
//! - Emission functions for key lifecycle events: start, decision, execution, finish
//!
//! Events are emitted at `info!` level (filter with `RUST_LOG`).
//! For JSON output, pass `--json` to the CLI.

use tracing::info;

/// The span one agent run is instrumented with; every event emitted during
/// the run, including those from its blocking execution worker, carries
/// `agent_id` and `depth`.
///
/// # Example
///
/// ```ignore
/// agent.run(task).instrument(agent_span("agent-1a2b", 0)).await
/// ```
pub fn agent_span(agent_id: &str, depth: u32) -> tracing::Span {
    tracing::info_span!("rlm.agent", agent_id = %agent_id, depth = depth)
}

/// Emit event: agent started on a task.
pub fn emit_agent_started(agent_id: &str, depth: u32, task: &str) {
    info!(
        event = "agent.started",
        agent_id = %agent_id,
        depth = depth,
        task_chars = task.chars().count(),
    );
}

/// Emit event: router decided the next action.
pub fn emit_step_decided(agent_id: &str, step: u32, action: &str) {
    info!(event = "agent.step_decided", agent_id = %agent_id, step = step, action = %action);
}

/// Emit event: one code execution finished.
pub fn emit_code_executed(agent_id: &str, step: u32, outcome: &str, output_chars: usize) {
    info!(
        event = "agent.code_executed",
        agent_id = %agent_id,
        step = step,
        outcome = %outcome,
        output_chars = output_chars,
    );
}

/// Emit event: a termination marker was found in execution output.
pub fn emit_final_detected(agent_id: &str, step: u32, answer_chars: usize) {
    info!(
        event = "agent.final_detected",
        agent_id = %agent_id,
        step = step,
        answer_chars = answer_chars,
    );
}

/// Emit event: agent run finished.
pub fn emit_agent_finished(agent_id: &str, steps: u32, duration_ms: u64, outcome: &str) {
    info!(
        event = "agent.finished",
        agent_id = %agent_id,
        steps = steps,
        duration_ms = duration_ms,
        outcome = %outcome,
    );
}

/// Emit event: a model call was refused by the budget ledger (warning level).
pub fn emit_budget_exceeded(current_usd: f64, limit_usd: f64) {
    tracing::warn!(event = "budget.exceeded", current_usd = current_usd, limit_usd = limit_usd);
}

/// Emit event: a sandbox tool call failed and was turned into text (warning level).
pub fn emit_tool_failed(tool: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "tool.failed", tool = %tool, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_span_enter() {
        let span = agent_span("test-agent", 1);
        span.in_scope(|| emit_step_decided("test-agent", 1, "CODE"));
    }
}
