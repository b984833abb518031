//! The agent loop and the roles it consults.
//!
//! # Module layout
//!
//! - [`action`]: `Action` and router-output normalisation
//! - [`roles`]: `Router`, `Coder`, `Responder`, `Delegator` and their model-backed forms
//! - [`agent`]: `Agent`, `AgentBuilder`, the loop and child spawning
//! - [`context`]: full-history formatting and compaction
//! - [`fallback`]: history-only answers and artifact sections
//! - [`error`]: `AgentError`, `AgentResult`

pub mod action;
pub mod agent;
pub mod context;
pub mod error;
pub mod fallback;
pub mod roles;

pub use action::Action;
pub use agent::{Agent, AgentBuilder, StepObserver, MAX_STEPS_MESSAGE};
pub use context::{format_full_history, ContextCompactor};
pub use error::{AgentError, AgentResult};
pub use fallback::fallback_answer;
pub use roles::{
    parse_subtasks, Coder, Delegator, ModelCoder, ModelDelegator, ModelResponder, ModelRouter,
    Responder, Roles, Router,
};
