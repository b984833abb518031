//! Integration tests for termination markers produced by executed code.

use rlm_core::termination::{extract_final, extract_final_var, resolve};
use rlm_core::sandbox::Value;
use rlm_core::{CodeExecutor, Repl, SandboxGlobals};

#[test]
fn test_literal_styles_extract_trimmed_inner_text() {
    let cases = [
        (r#"FINAL("""  the answer  """)"#, "the answer"),
        ("FINAL('''the answer''')", "the answer"),
        (r#"FINAL("the answer")"#, "the answer"),
        ("FINAL('the answer')", "the answer"),
        (r#"FINAL(f"the answer")"#, "the answer"),
        ("FINAL(f'the answer')", "the answer"),
    ];
    for (text, expected) in cases {
        assert_eq!(extract_final(text).as_deref(), Some(expected), "{text}");
    }
}

#[test]
fn test_unsupported_shapes_return_nothing() {
    for text in ["FINAL(4)", "FINAL(answer)", "final('x')", "FINAL"] {
        assert_eq!(extract_final(text), None, "{text}");
    }
}

#[test]
fn test_variable_marker_reads_namespace() {
    let mut ns = SandboxGlobals::builder().build();
    ns.set_global("result", Value::Int(42));
    assert_eq!(extract_final_var("FINAL_VAR(result)", &ns).as_deref(), Some("42"));
    assert_eq!(extract_final_var("FINAL_VAR(missing)", &ns), None);
}

#[test]
fn test_final_helper_output_round_trips() {
    let mut repl = Repl::new(SandboxGlobals::builder().build(), CodeExecutor::default());
    let execution = repl.execute_blocking("n = 2 + 2\nprint(FINAL(f'{n} apples'))");
    assert_eq!(repl.check_for_final(&execution.output).as_deref(), Some("4 apples"));
}

#[test]
fn test_final_var_helper_resolves_after_execution() {
    let mut repl = Repl::new(SandboxGlobals::builder().build(), CodeExecutor::default());
    let execution = repl.execute_blocking("summary = 'all done'\nprint(FINAL_VAR('summary'))");
    assert_eq!(execution.output, "FINAL_VAR(summary)");
    assert_eq!(resolve(&execution.output, repl.namespace()).as_deref(), Some("all done"));
}
