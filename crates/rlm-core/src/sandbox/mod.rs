//! Sandbox: a restricted interpreter for model-generated code.
//!
//! Source is lexed, parsed and passed through a restricted compiler that
//! rejects reserved names and rewrites attribute, item, iteration, unpack,
//! in-place and store operations into guard hook calls. The tree-walking
//! interpreter then runs the program against a persistent [`Namespace`].
//!
//! # Modules
//!
//! - [`lexer`], [`parser`], [`ast`] - source to syntax tree
//! - [`restrict`] - `compile_restricted()`, `CompiledProgram`
//! - [`interpreter`] - `Interpreter`, `ExecutionLimits`, `ExecContext`
//! - [`guards`] - the reserved-name guard hooks and the print collector
//! - [`globals`] - `SandboxGlobals` builder, `LibraryAvailability`
//! - [`stdlib`] - allow-listed modules (`re`, `json`, `math`, ...)
//! - [`fs`] - `SandboxFs` path confinement
//! - [`tooling`] - bridge from tool values to the `ToolHost`

pub mod ast;
pub mod builtins;
pub mod error;
pub mod format;
pub mod fs;
pub mod globals;
pub mod guards;
pub mod interpreter;
pub mod lexer;
pub mod methods;
pub mod namespace;
pub mod ops;
pub mod parser;
pub mod restrict;
pub mod stdlib;
pub mod tooling;
pub mod value;

pub use error::{CompileError, ExcType, ExecResult, Exception};
pub use fs::SandboxFs;
pub use globals::{LibraryAvailability, SandboxGlobals, SandboxGlobalsBuilder};
pub use guards::GuardHook;
pub use interpreter::{run_on_sandbox_stack, ExecContext, ExecutionLimits, Interpreter};
pub use namespace::Namespace;
pub use restrict::{compile_restricted, CompiledProgram};
pub use value::Value;
