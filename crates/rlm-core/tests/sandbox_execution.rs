//! Integration tests for the code executor against a persistent namespace.

use rlm_core::executor::{ExecOutcome, NO_OUTPUT};
use rlm_core::{CodeExecutor, Namespace, SandboxGlobals};

fn namespace() -> Namespace {
    SandboxGlobals::builder().build()
}

#[test]
fn test_variables_persist_between_executions() {
    let executor = CodeExecutor::default();
    let mut ns = namespace();
    executor.execute("x = 41\nwords = ['a', 'b']", &mut ns);
    let result = executor.execute("print(x + 1, len(words))", &mut ns);
    assert_eq!(result.output, "42 2");
}

#[test]
fn test_reassignment_replaces_binding() {
    let executor = CodeExecutor::default();
    let mut ns = namespace();
    executor.execute("x = 1", &mut ns);
    executor.execute("x = x + 1", &mut ns);
    assert_eq!(executor.execute("print(x)", &mut ns).output, "2");
}

#[test]
fn test_compile_errors_are_independent_and_leave_namespace_unchanged() {
    let executor = CodeExecutor::default();
    let mut ns = namespace();
    executor.execute("kept = 'yes'", &mut ns);
    let before = ns.globals().len();

    let first = executor.execute("def broken(:\n    pass", &mut ns);
    let second = executor.execute("def broken(:\n    pass", &mut ns);
    assert!(first.output.starts_with("CompilationError:"));
    assert_eq!(first.output, second.output);
    assert_eq!(first.outcome, ExecOutcome::CompileError);
    assert_eq!(ns.globals().len(), before);
    assert_eq!(executor.execute("print(kept)", &mut ns).output, "yes");
}

#[test]
fn test_denylist_runs_before_compilation() {
    let executor = CodeExecutor::default();
    let mut ns = namespace();
    let valid = executor.execute("x = 'subprocess'", &mut ns);
    assert_eq!(
        valid.output,
        "SecurityError: Forbidden pattern 'subprocess' detected."
    );
    assert_eq!(valid.outcome, ExecOutcome::SecurityRejected);
    assert!(ns.global("x").is_none());

    let invalid = executor.execute("os.popen(((", &mut ns);
    assert!(invalid.output.starts_with("SecurityError:"));
}

#[test]
fn test_os_system_is_rejected() {
    let executor = CodeExecutor::default();
    let mut ns = namespace();
    let result = executor.execute("import os; os.system('echo hi')", &mut ns);
    assert_eq!(
        result.output,
        "SecurityError: Forbidden pattern 'os.system' detected."
    );
}

#[test]
fn test_print_capture() {
    let executor = CodeExecutor::default();
    let mut ns = namespace();
    assert_eq!(executor.execute("print(\"test\")", &mut ns).output, "test");
    assert_eq!(executor.execute("y = 3", &mut ns).output, NO_OUTPUT);
}

#[test]
fn test_underscore_names_never_run() {
    let executor = CodeExecutor::default();
    let mut ns = namespace();
    let result = executor.execute("__import__('os')", &mut ns);
    assert!(result.output.starts_with("CompilationError:"));
    assert!(result.output.contains("__import__"));
}

#[test]
fn test_runtime_error_keeps_earlier_state() {
    let executor = CodeExecutor::default();
    let mut ns = namespace();
    executor.execute("total = 10", &mut ns);
    let result = executor.execute("items = [1, 2]\nprint(items[5])", &mut ns);
    assert!(result.output.starts_with("ExecutionError:"));
    assert!(result.output.contains("IndexError"));
    assert_eq!(executor.execute("print(total)", &mut ns).output, "10");
}

#[test]
fn test_fenced_reply_is_unwrapped() {
    let executor = CodeExecutor::default();
    let mut ns = namespace();
    let reply = "Here you go:\n```python\nprint(sum([1, 2, 3]))\n```\nDone.";
    let result = executor.execute(reply, &mut ns);
    assert_eq!(result.code, "print(sum([1, 2, 3]))");
    assert_eq!(result.output, "6");
}

/// Runs `f` on a thread with the platform's default 2 MiB stack.
fn on_small_stack<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    std::thread::Builder::new()
        .stack_size(2 * 1024 * 1024)
        .spawn(f)
        .unwrap()
        .join()
        .unwrap()
}

#[test]
fn test_deep_nesting_and_recursion_fail_cleanly() {
    let outputs = on_small_stack(|| {
        let executor = CodeExecutor::default();
        let mut ns = namespace();
        let parens = format!("x = {}1{}", "(".repeat(20_000), ")".repeat(20_000));
        vec![
            executor.execute(&parens, &mut ns),
            executor.execute("def f(n):\n    return f(n + 1)\nf(0)", &mut ns),
            executor.execute("print('still here')", &mut ns),
        ]
    });
    assert_eq!(outputs[0].outcome, ExecOutcome::CompileError);
    assert!(outputs[0].output.contains("too many nested parentheses"));
    assert_eq!(outputs[1].outcome, ExecOutcome::Error);
    assert!(outputs[1].output.contains("RecursionError"));
    assert_eq!(outputs[2].output, "still here");
}

#[test]
fn test_huge_pad_widths_raise_memory_error() {
    let outputs = on_small_stack(|| {
        let executor = CodeExecutor::default();
        let mut ns = namespace();
        [
            "'ab'.ljust(9223372036854775807)",
            "'ab'.center(9223372036854775807)",
            "'ab'.zfill(9223372036854775807)",
            "f'{1:>9223372036854775807}'",
            "'%9223372036854775807d' % 1",
        ]
        .iter()
        .map(|code| executor.execute(code, &mut ns).output)
        .collect::<Vec<_>>()
    });
    for output in outputs {
        assert!(output.starts_with("ExecutionError:"), "{output}");
        assert!(output.contains("MemoryError"), "{output}");
    }
}

#[test]
fn test_range_length_at_integer_extremes() {
    let outputs = on_small_stack(|| {
        let executor = CodeExecutor::default();
        let mut ns = namespace();
        [
            "len(range(0, 9223372036854775807, 2))",
            "range(0, 9223372036854775807, 2)[-1]",
            "len(range(-9223372036854775807 - 1, 9223372036854775807))",
        ]
        .iter()
        .map(|code| executor.execute(code, &mut ns).output)
        .collect::<Vec<_>>()
    });
    assert_eq!(outputs[0], "4611686018427387904");
    assert_eq!(outputs[1], "9223372036854775806");
    assert!(outputs[2].contains("OverflowError"), "{}", outputs[2]);
}

#[test]
fn test_indented_trailing_expression_is_shown() {
    let executor = CodeExecutor::default();
    let mut ns = namespace();
    let result = executor.execute("total = 0\nfor i in range(3):\n    total += i\n    i", &mut ns);
    assert_eq!(result.output, "2");
}
