//! Observability tests for agent lifecycle tracing.
//!
//! These exercise the structured events emitted around an agent run: start,
//! routing decisions, code execution, termination, budget and tool failures.

use rlm_core::fakes::scripted_roles;
use rlm_core::obs::{
    agent_span, emit_agent_finished, emit_agent_started, emit_budget_exceeded,
    emit_code_executed, emit_final_detected, emit_step_decided, emit_tool_failed,
};
use rlm_core::{Agent, AgentConfig};
use tracing_test::traced_test;

/// Test: emit_agent_started creates an info-level event
#[traced_test]
#[test]
fn test_emit_agent_started_logs_id_and_depth() {
    emit_agent_started("agent-123", 0, "What is 2+2?");
}

#[traced_test]
#[test]
fn test_emit_step_events() {
    emit_step_decided("agent-123", 1, "CODE");
    emit_code_executed("agent-123", 1, "success", 1);
    emit_final_detected("agent-123", 2, 1);
}

#[traced_test]
#[test]
fn test_emit_agent_finished_logs_outcome() {
    emit_agent_finished("agent-123", 2, 150, "final");
}

#[traced_test]
#[test]
fn test_emit_budget_and_tool_failures() {
    emit_budget_exceeded(1.25, 1.0);
    emit_tool_failed("search_web", &"connection refused");
}

/// Test: events emitted inside the agent span carry its fields
#[traced_test]
#[test]
fn test_agent_span_wraps_events() {
    agent_span("agent-456", 1).in_scope(|| {
        emit_step_decided("agent-456", 1, "ANSWER");
    });
}

/// Test: a full run emits its lifecycle without panicking
#[traced_test]
#[tokio::test]
async fn test_agent_run_is_traced() {
    let roles = scripted_roles(
        ["CODE", "CODE"],
        ["print(2+2)", "print(FINAL(\"4\"))"],
        ["unused"],
        ["- unused"],
    );
    let mut agent = Agent::builder(AgentConfig::default(), roles).build().unwrap();
    assert_eq!(agent.run("What is 2+2?").await.unwrap(), "4");
}
