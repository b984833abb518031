//! RLM Core Library
//!
//! A recursive language model agent: a router-driven loop that writes code,
//! runs it in a sandboxed interpreter with a persistent namespace, and
//! delegates subtasks to child agents that share one cost ledger.

pub mod artifacts;
pub mod budget;
pub mod config;
pub mod executor;
#[cfg(any(test, feature = "test-util"))]
pub mod fakes;
pub mod history;
pub mod llm;
pub mod metrics;
pub mod obs;
pub mod orchestration;
pub mod repl;
pub mod sandbox;
pub mod telemetry;
pub mod termination;
pub mod tools;

pub use artifacts::{ArtifactError, ArtifactKind, ArtifactRecord, NewArtifact, RunContext};
pub use budget::{BudgetExceeded, BudgetLedger, BudgetSnapshot, ModelPricing};
pub use config::{AgentConfig, ConfigError};
pub use executor::{CodeExecutor, ExecOutcome, Execution};
pub use history::{ExecutionHistory, HistoryEntry};
pub use llm::{BudgetedModel, Completion, CompletionRequest, LanguageModel, LlmError};
pub use orchestration::{
    Action, Agent, AgentBuilder, AgentError, AgentResult, Roles, MAX_STEPS_MESSAGE,
};
pub use repl::{Repl, ReplStateStore};
pub use sandbox::{ExecutionLimits, Namespace, SandboxGlobals};
pub use tools::{DuckDuckGoSearch, SearchProvider, SearchResult};
