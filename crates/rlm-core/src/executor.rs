//! Code executor: turns a raw model reply into output text.
//!
//! Every outcome is text. Phases, in order:
//!
//! 1. extract code from markdown fences (empty -> `No code to execute`)
//! 2. denylist pre-filter (`SecurityError: ...`)
//! 3. scope file access to the working directory
//! 4. restricted compilation (`CompilationError: ...`)
//! 5. run against the persistent namespace
//! 6. collect printed output and the trailing expression's value
//! 7. promote locals to globals
//! 8. register files the code created
//! 9. substitute a sentinel for empty output
//! 10. hand the namespace back
//!
//! Runtime failures become `ExecutionError: <message>\n<traceback>`.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::artifacts::{ArtifactRecord, RunContext};
use crate::metrics::METRICS;
use crate::sandbox::{
    compile_restricted, run_on_sandbox_stack, ExecContext, ExecutionLimits, Interpreter,
    Namespace, SandboxFs, Value,
};
use crate::tools::ToolHost;

pub const NO_CODE: &str = "No code to execute";
pub const NO_OUTPUT: &str = "Code executed successfully (no output)";

/// Substrings rejected before compilation.
pub const FORBIDDEN_PATTERNS: [&str; 4] = ["os.system", "os.popen", "subprocess", "__builtins__"];

/// A last line containing any of these is not auto-printed.
const STATEMENT_KEYWORDS: [&str; 10] = [
    "=", "import", "def", "class", "if", "for", "while", "with", "try", "return",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecOutcome {
    NoCode,
    SecurityRejected,
    CompileError,
    Error,
    Success,
}

impl ExecOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoCode => "no_code",
            Self::SecurityRejected => "security_rejected",
            Self::CompileError => "compile_error",
            Self::Error => "error",
            Self::Success => "success",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Execution {
    /// The code that was compiled, after fence extraction.
    pub code: String,
    pub output: String,
    pub outcome: ExecOutcome,
    pub new_artifacts: Vec<ArtifactRecord>,
}

impl Execution {
    fn text(code: String, output: impl Into<String>, outcome: ExecOutcome) -> Self {
        Self {
            code,
            output: output.into(),
            outcome,
            new_artifacts: Vec::new(),
        }
    }
}

/// Runs code for one agent. Cheap to clone; holds no namespace.
#[derive(Clone, Default)]
pub struct CodeExecutor {
    limits: ExecutionLimits,
    fs: Arc<SandboxFs>,
    host: Option<Arc<dyn ToolHost>>,
    run: Option<Arc<RunContext>>,
}

impl CodeExecutor {
    pub fn new(limits: ExecutionLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    /// Scopes file access to the run directory and enables artifact detection.
    pub fn with_run_context(mut self, run: Arc<RunContext>, context_dir: Option<std::path::PathBuf>) -> Self {
        self.fs = Arc::new(SandboxFs::new(
            Some(run.working_dir().to_path_buf()),
            context_dir,
        ));
        self.run = Some(run);
        self
    }

    pub fn with_fs(mut self, fs: SandboxFs) -> Self {
        self.fs = Arc::new(fs);
        self
    }

    pub fn with_host(mut self, host: Arc<dyn ToolHost>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn limits(&self) -> ExecutionLimits {
        self.limits
    }

    pub fn run_context(&self) -> Option<&Arc<RunContext>> {
        self.run.as_ref()
    }

    /// Executes `raw` against `ns`. Blocking; never fails.
    pub fn execute(&self, raw: &str, ns: &mut Namespace) -> Execution {
        METRICS.inc_executions();
        let code = extract_code(raw);
        if code.trim().is_empty() {
            return Execution::text(code, NO_CODE, ExecOutcome::NoCode);
        }

        if let Some(pattern) = forbidden_pattern(&code) {
            METRICS.inc_security_rejections();
            tracing::warn!(pattern, "code rejected by denylist");
            let output = format!("SecurityError: Forbidden pattern '{pattern}' detected.");
            return Execution::text(code, output, ExecOutcome::SecurityRejected);
        }

        match run_on_sandbox_stack(&self.limits, || self.compile_and_run(&code, ns)) {
            Ok(execution) => execution,
            Err(err) => {
                METRICS.inc_execution_errors();
                tracing::error!(error = %err, "failed to start sandbox thread");
                let output = format!("ExecutionError: could not start sandbox thread: {err}");
                Execution::text(code, output, ExecOutcome::Error)
            }
        }
    }

    /// Phases 4 to 10. Runs on the sandbox thread.
    fn compile_and_run(&self, code: &str, ns: &mut Namespace) -> Execution {
        let code = code.to_string();
        let program = match compile_restricted(&code) {
            Ok(program) => program,
            Err(err) => {
                METRICS.inc_compile_errors();
                tracing::debug!(error = %err, "compilation failed");
                let output = format!("CompilationError: {err}");
                return Execution::text(code, output, ExecOutcome::CompileError);
            }
        };

        let mut interp = Interpreter::new(std::mem::take(ns), self.context(), self.limits);
        let result = interp.run_program(&program);
        let (namespace, mut output) = interp.finish();
        *ns = namespace;

        let value = match result {
            Ok(value) => value,
            Err(exc) => {
                METRICS.inc_execution_errors();
                tracing::debug!(error = %exc, "execution raised");
                let output = format!("ExecutionError: {}\n{}", exc.message(), exc.format_traceback());
                return Execution::text(code, output, ExecOutcome::Error);
            }
        };

        if last_line_is_expression(&code) {
            let value = match value {
                Some(value) => Some(value),
                None => self.eval_trailing_line(&code, ns),
            };
            if let Some(value) = value.filter(|v| !v.is_none()) {
                output.push_str(&value.to_str());
                output.push('\n');
            }
        }

        ns.promote_locals();

        let new_artifacts = self
            .run
            .as_ref()
            .map(|run| run.scan_new_files())
            .unwrap_or_default();

        let output = match output.trim() {
            "" => NO_OUTPUT.to_string(),
            trimmed => trimmed.to_string(),
        };
        Execution {
            code,
            output,
            outcome: ExecOutcome::Success,
            new_artifacts,
        }
    }

    fn context(&self) -> ExecContext {
        ExecContext {
            fs: Arc::clone(&self.fs),
            host: self.host.clone(),
        }
    }

    /// Value of the last source line when it closes a block (e.g. the body
    /// of a `for`) and reads as a bare expression. Lines with calls are
    /// skipped so nothing runs twice; prints and errors are discarded.
    fn eval_trailing_line(&self, code: &str, ns: &mut Namespace) -> Option<Value> {
        let line = code.trim().lines().last()?.trim();
        if line.contains('(') {
            return None;
        }
        let program = compile_restricted(line).ok()?;
        if program.body.len() != 1 || !program.ends_with_expression() {
            return None;
        }
        let mut interp = Interpreter::new(std::mem::take(ns), self.context(), self.limits);
        let result = interp.run_program(&program);
        let (namespace, _) = interp.finish();
        *ns = namespace;
        result.ok().flatten()
    }
}

/// The body of the first fenced block, or the text unchanged.
pub fn extract_code(text: &str) -> String {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    let fence = FENCE.get_or_init(|| Regex::new(r"(?s)```(?:python|py)?[ \t]*\r?\n(.*?)\r?\n[ \t]*```").ok());
    fence
        .as_ref()
        .and_then(|re| re.captures(text))
        .and_then(|caps| caps.get(1))
        .map_or_else(|| text.to_string(), |m| m.as_str().to_string())
}

/// The first denylisted substring present in `code`.
pub fn forbidden_pattern(code: &str) -> Option<&'static str> {
    FORBIDDEN_PATTERNS.iter().copied().find(|p| code.contains(p))
}

fn last_line_is_expression(code: &str) -> bool {
    let last = code.trim().lines().last().unwrap_or("").trim();
    !last.is_empty() && !STATEMENT_KEYWORDS.iter().any(|kw| last.contains(kw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{SandboxGlobals, Value};

    fn run(executor: &CodeExecutor, ns: &mut Namespace, code: &str) -> Execution {
        executor.execute(code, ns)
    }

    #[test]
    fn test_extract_code_from_fences() {
        assert_eq!(extract_code("```python\nx = 1\n```"), "x = 1");
        assert_eq!(extract_code("text\n```\nprint(1)\nprint(2)\n```\nmore"), "print(1)\nprint(2)");
        assert_eq!(extract_code("plain = 1"), "plain = 1");
    }

    #[test]
    fn test_empty_code() {
        let mut ns = SandboxGlobals::builder().build();
        let result = run(&CodeExecutor::default(), &mut ns, "```python\n   \n```");
        assert_eq!(result.output, NO_CODE);
        assert_eq!(result.outcome, ExecOutcome::NoCode);
    }

    #[test]
    fn test_print_capture() {
        let mut ns = SandboxGlobals::builder().build();
        let result = run(&CodeExecutor::default(), &mut ns, "print(\"test\")");
        assert_eq!(result.output, "test");
        assert_eq!(result.outcome, ExecOutcome::Success);
    }

    #[test]
    fn test_trailing_expression_appended() {
        let mut ns = SandboxGlobals::builder().build();
        let executor = CodeExecutor::default();
        let result = run(&executor, &mut ns, "x = 20\nprint('x set')\nx + 22");
        assert_eq!(result.output, "x set\n42");

        // `=` in the last line suppresses auto-printing.
        let result = run(&executor, &mut ns, "x == 20");
        assert_eq!(result.output, NO_OUTPUT);
    }

    #[test]
    fn test_none_expression_not_printed() {
        let mut ns = SandboxGlobals::builder().build();
        let result = run(&CodeExecutor::default(), &mut ns, "print('a')");
        assert_eq!(result.output, "a");
    }

    #[test]
    fn test_indented_trailing_expression_appended() {
        let mut ns = SandboxGlobals::builder().build();
        let executor = CodeExecutor::default();
        let result = run(&executor, &mut ns, "for i in range(3):\n    i");
        assert_eq!(result.output, "2");

        // Calls are not run a second time.
        let result = run(&executor, &mut ns, "items = []\nfor i in range(2):\n    items.append(i)");
        assert_eq!(result.output, NO_OUTPUT);
        let result = run(&executor, &mut ns, "len(items)");
        assert_eq!(result.output, "2");
    }

    #[test]
    fn test_deep_nesting_from_small_stack_caller() {
        let nested = format!("x = {}1{}", "(".repeat(20_000), ")".repeat(20_000));
        let output = std::thread::Builder::new()
            .stack_size(2 * 1024 * 1024)
            .spawn(move || {
                let mut ns = SandboxGlobals::builder().build();
                let executor = CodeExecutor::default();
                let parens = executor.execute(&nested, &mut ns).output;
                let recursion = executor
                    .execute("def f(n):\n    return f(n + 1)\nf(0)", &mut ns)
                    .output;
                (parens, recursion)
            })
            .unwrap()
            .join()
            .unwrap();
        assert!(output.0.contains("too many nested parentheses"), "{}", output.0);
        assert!(output.1.starts_with("ExecutionError:"), "{}", output.1);
        assert!(output.1.contains("RecursionError"), "{}", output.1);
    }

    #[test]
    fn test_denylist_precedes_compilation() {
        let mut ns = SandboxGlobals::builder().build();
        let result = run(&CodeExecutor::default(), &mut ns, "import os\nos.system('ls')");
        assert_eq!(result.output, "SecurityError: Forbidden pattern 'os.system' detected.");
        // Invalid syntax still hits the denylist first.
        let result = run(&CodeExecutor::default(), &mut ns, "subprocess((((");
        assert!(result.output.starts_with("SecurityError:"));
    }

    #[test]
    fn test_compile_error_leaves_namespace_untouched() {
        let mut ns = SandboxGlobals::builder().build();
        let executor = CodeExecutor::default();
        run(&executor, &mut ns, "a = 1");
        let result = run(&executor, &mut ns, "a = (");
        assert!(result.output.starts_with("CompilationError:"));
        assert_eq!(result.outcome, ExecOutcome::CompileError);
        assert!(matches!(ns.global("a"), Some(Value::Int(1))));
    }

    #[test]
    fn test_execution_error_text() {
        let mut ns = SandboxGlobals::builder().build();
        let result = run(&CodeExecutor::default(), &mut ns, "x = 1\ny = x / 0");
        assert!(result.output.starts_with("ExecutionError: division by zero\nTraceback"));
        assert!(result.output.contains("ZeroDivisionError"));
        assert_eq!(result.outcome, ExecOutcome::Error);
    }

    #[test]
    fn test_state_persists_and_private_names_stay_local() {
        let mut ns = SandboxGlobals::builder().build();
        let executor = CodeExecutor::default();
        run(&executor, &mut ns, "data = [1, 2, 3]\ntotal = sum(data)");
        assert!(ns.global("total").is_some());
        let result = run(&executor, &mut ns, "print(total, len(data))");
        assert_eq!(result.output, "6 3");
    }

    #[test]
    fn test_timeout_surfaces_as_execution_error() {
        let mut ns = SandboxGlobals::builder().build();
        let executor = CodeExecutor::new(ExecutionLimits {
            max_operations: 10_000,
            ..ExecutionLimits::default()
        });
        let result = run(&executor, &mut ns, "while True:\n    pass");
        assert!(result.output.starts_with("ExecutionError:"));
    }

    #[test]
    fn test_files_land_in_run_directory_and_are_detected() {
        let base = tempfile::tempdir().unwrap();
        let run_ctx = Arc::new(RunContext::with_id(base.path(), "exec").unwrap());
        let executor = CodeExecutor::default().with_run_context(Arc::clone(&run_ctx), None);
        let mut ns = SandboxGlobals::builder()
            .output_dir(run_ctx.working_dir())
            .build();
        let result = run(
            &executor,
            &mut ns,
            "with open('summary.txt', 'w') as f:\n    f.write('done')",
        );
        assert_eq!(result.output, NO_OUTPUT);
        assert_eq!(result.new_artifacts.len(), 1);
        assert_eq!(result.new_artifacts[0].filename, "summary.txt");
        assert!(run_ctx.working_dir().join("summary.txt").exists());
    }
}
