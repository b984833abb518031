//! Bridges `search_web`, `llm_query` and `recursive_llm` calls out of the
//! interpreter to the execution's [`ToolHost`].

use std::time::Instant;

use super::error::{ExecResult, Exception};
use super::interpreter::Interpreter;
use super::stdlib::json;
use super::value::{Args, Value};
use crate::tools::search::DEFAULT_MAX_RESULTS;
use crate::tools::{ToolKind, ToolRequest, ToolResponse};

/// Calls `kind` with sandbox arguments. Argument errors raise `TypeError`;
/// everything past argument parsing returns a value.
pub fn call_tool(interp: &mut Interpreter, kind: ToolKind, args: Args) -> ExecResult<Value> {
    let request = build_request(kind, &args)?;
    let Some(host) = interp.host() else {
        return Ok(unavailable(kind));
    };

    let started = Instant::now();
    let response = host.handle(request);
    // Time blocked on the host does not count against the execution deadline.
    interp.extend_deadline(started.elapsed());

    match response {
        ToolResponse::Text(text) => Ok(Value::str(text)),
        ToolResponse::Records(records) => {
            let items = records
                .into_iter()
                .map(json::from_json)
                .collect::<ExecResult<Vec<_>>>()?;
            Ok(Value::list(items))
        }
    }
}

fn build_request(kind: ToolKind, args: &Args) -> ExecResult<ToolRequest> {
    let name = kind.name();
    args.check(name, 0, 2)?;
    let request = match kind {
        ToolKind::SearchWeb => {
            let query = string(args, 0, &["query"], name)?;
            let max_results = match args.arg(1, "max_results") {
                None | Some(Value::None) => DEFAULT_MAX_RESULTS,
                Some(v) => v
                    .as_int()
                    .map(|n| n.max(0) as usize)
                    .ok_or_else(|| Exception::type_error("max_results must be an int"))?,
            };
            ToolRequest::Search { query, max_results }
        }
        ToolKind::LlmQuery => ToolRequest::SubQuery {
            question: string(args, 0, &["query", "question"], name)?,
            chunk: optional_string(args, 1, &["context_chunk", "chunk"]),
        },
        ToolKind::RecursiveLlm => ToolRequest::Delegate {
            task: string(args, 0, &["sub_query", "task"], name)?,
            context: optional_string(args, 1, &["sub_context", "context"]),
        },
    };
    Ok(request)
}

fn lookup(args: &Args, index: usize, names: &[&str]) -> Option<Value> {
    args.get(index)
        .cloned()
        .or_else(|| names.iter().find_map(|n| args.kwarg(n).cloned()))
}

fn string(args: &Args, index: usize, names: &[&str], func: &str) -> ExecResult<String> {
    lookup(args, index, names)
        .map(|v| v.to_str())
        .ok_or_else(|| {
            Exception::type_error(format!(
                "{func}() missing required argument: '{}'",
                names[0]
            ))
        })
}

/// Non-string values are stringified, matching how the tools format them.
fn optional_string(args: &Args, index: usize, names: &[&str]) -> String {
    match lookup(args, index, names) {
        None | Some(Value::None) => String::new(),
        Some(v) => v.to_str(),
    }
}

fn unavailable(kind: ToolKind) -> Value {
    match kind {
        ToolKind::SearchWeb => Value::list(vec![Value::str_dict([(
            "error",
            Value::str("search is not available in this sandbox"),
        )])]),
        ToolKind::LlmQuery => Value::str("[Error in llm_query: no sub-query model configured]"),
        ToolKind::RecursiveLlm => {
            Value::str("[Delegation not configured. Set agent_config to enable recursive_llm.]")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::sandbox::{compile_restricted, ExecContext, ExecutionLimits, SandboxGlobals};
    use crate::tools::ToolHost;

    #[derive(Default)]
    struct RecordingHost {
        requests: Mutex<Vec<ToolRequest>>,
    }

    impl ToolHost for RecordingHost {
        fn handle(&self, request: ToolRequest) -> ToolResponse {
            let response = match &request {
                ToolRequest::Search { .. } => ToolResponse::Records(vec![
                    serde_json::json!({"title": "t", "href": "h", "body": "b"}),
                ]),
                ToolRequest::SubQuery { question, .. } => ToolResponse::Text(format!("re: {question}")),
                ToolRequest::Delegate { task, .. } => ToolResponse::Text(format!("child: {task}")),
            };
            self.requests.lock().push(request);
            response
        }
    }

    fn run(source: &str, host: Option<Arc<dyn ToolHost>>) -> String {
        let ns = SandboxGlobals::builder().with_tools().build();
        let ctx = ExecContext {
            host,
            ..ExecContext::default()
        };
        let mut interp = Interpreter::new(ns, ctx, ExecutionLimits::default());
        let program = compile_restricted(source).unwrap();
        interp.run_program(&program).unwrap();
        interp.finish().1
    }

    #[test]
    fn test_keyword_and_positional_arguments() {
        let host = Arc::new(RecordingHost::default());
        let out = run(
            "r = search_web('rust', max_results=2)\n\
             print(r[0]['title'])\n\
             print(llm_query('what', context_chunk='text'))\n\
             print(recursive_llm(sub_query='task', sub_context=42))",
            Some(host.clone()),
        );
        assert_eq!(out, "t\nre: what\nchild: task\n");
        let requests = host.requests.lock();
        assert_eq!(
            requests[0],
            ToolRequest::Search {
                query: "rust".into(),
                max_results: 2
            }
        );
        assert_eq!(
            requests[2],
            ToolRequest::Delegate {
                task: "task".into(),
                context: "42".into()
            }
        );
    }

    #[test]
    fn test_without_host_tools_return_text() {
        let out = run("print(recursive_llm('x'))\nprint(search_web('q')[0]['error'])", None);
        assert!(out.starts_with("[Delegation not configured."));
        assert!(out.contains("search is not available"));
    }

    #[test]
    fn test_missing_argument_is_type_error() {
        let ns = SandboxGlobals::builder().with_tools().build();
        let mut interp = Interpreter::new(ns, ExecContext::default(), ExecutionLimits::default());
        let program = compile_restricted("llm_query()").unwrap();
        let err = interp.run_program(&program).unwrap_err();
        assert!(err.message().contains("missing required argument: 'query'"));
    }
}
