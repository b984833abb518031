//! Builds the initial namespace every execution runs against.

use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;

use super::builtins::builtin_table;
use super::guards::GuardHook;
use super::namespace::Namespace;
use super::stdlib;
use super::value::{TypeObj, Value};
use crate::tools::ToolKind;

/// Optional libraries compiled into this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LibraryAvailability {
    pub statistics: bool,
    pub csv: bool,
}

impl LibraryAvailability {
    pub fn detect() -> Self {
        let enabled = cfg!(feature = "data-science");
        Self {
            statistics: enabled,
            csv: enabled,
        }
    }

    /// Names of the available optional libraries.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.statistics {
            names.push("statistics");
        }
        if self.csv {
            names.push("csv");
        }
        names
    }
}

/// Entry point for building the sandbox namespace.
pub struct SandboxGlobals;

impl SandboxGlobals {
    pub fn builder() -> SandboxGlobalsBuilder {
        SandboxGlobalsBuilder::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SandboxGlobalsBuilder {
    output_dir: Option<PathBuf>,
    context_dir: Option<PathBuf>,
    depth: u32,
    tools: bool,
}

impl SandboxGlobalsBuilder {
    /// Directory generated files are written to.
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Read-only directory of input files. Defaults to the output directory.
    pub fn context_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.context_dir = Some(dir.into());
        self
    }

    pub fn depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    /// Binds `search_web`, `llm_query` and `recursive_llm`.
    pub fn with_tools(mut self) -> Self {
        self.tools = true;
        self
    }

    /// Produces the namespace. Never fails; unavailable libraries are omitted.
    pub fn build(self) -> Namespace {
        let mut injected: IndexMap<String, Value> = IndexMap::new();
        let mut bind = |name: &str, value: Value| {
            injected.insert(name.to_string(), value);
        };

        for hook in GuardHook::ALL {
            bind(hook.reserved_name(), Value::Hook(hook));
        }

        for module in ["re", "json", "math", "datetime", "os"] {
            if let Ok(value) = stdlib::import(module) {
                bind(module, value);
            }
        }
        bind("timedelta", Value::Type(TypeObj::TimeDelta));
        bind("date", Value::Type(TypeObj::Date));
        bind("Counter", Value::Type(TypeObj::Counter));
        bind("defaultdict", Value::Type(TypeObj::DefaultDict));
        bind("OrderedDict", Value::Type(TypeObj::OrderedDict));
        bind("Path", Value::Type(TypeObj::Path));
        bind("StringIO", Value::Type(TypeObj::StringIO));

        for name in LibraryAvailability::detect().names() {
            if let Ok(value) = stdlib::import(name) {
                bind(name, value);
            }
        }

        if self.tools {
            for kind in ToolKind::ALL {
                bind(kind.name(), Value::Tool(kind));
            }
        }

        if let Some(dir) = &self.output_dir {
            let dir = Value::str(dir.display().to_string());
            bind("__artifacts_dir__", dir.clone());
            bind("output_dir", dir);
        }
        if let Some(dir) = self.context_dir.as_ref().or(self.output_dir.as_ref()) {
            let dir = Value::str(dir.display().to_string());
            bind("__context_dir__", dir.clone());
            bind("input_dir", dir);
        }
        bind("__depth__", Value::Int(i64::from(self.depth)));

        bind("__execution_history__", Value::list(Vec::new()));
        bind("history", Value::list(Vec::new()));
        bind("context", Value::str(""));
        bind("__task__", Value::str(""));
        bind("task", Value::str(""));

        Namespace::new(Arc::new(builtin_table()), injected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hooks_and_builtins_present() {
        let ns = SandboxGlobals::builder().build();
        for hook in GuardHook::ALL {
            assert!(ns.lookup(hook.reserved_name()).is_some(), "{hook:?}");
        }
        for name in ["len", "print", "sorted", "FINAL", "FINAL_VAR", "ValueError"] {
            assert!(ns.builtin(name).is_some(), "{name}");
        }
        for name in ["re", "json", "math", "Counter", "Path", "StringIO", "os", "timedelta"] {
            assert!(ns.injected(name).is_some(), "{name}");
        }
    }

    #[test]
    fn test_tools_only_when_requested() {
        let plain = SandboxGlobals::builder().build();
        assert!(plain.lookup("search_web").is_none());
        let tooled = SandboxGlobals::builder().with_tools().build();
        assert!(matches!(
            tooled.lookup("recursive_llm"),
            Some(Value::Tool(ToolKind::RecursiveLlm))
        ));
    }

    #[test]
    fn test_directories_default_input_to_output() {
        let ns = SandboxGlobals::builder().output_dir("/tmp/run").depth(2).build();
        assert_eq!(ns.lookup("output_dir").unwrap().to_str(), "/tmp/run");
        assert_eq!(ns.lookup("input_dir").unwrap().to_str(), "/tmp/run");
        assert_eq!(ns.lookup("__depth__").unwrap().repr(), "2");

        let ns = SandboxGlobals::builder()
            .output_dir("/tmp/run")
            .context_dir("/data")
            .build();
        assert_eq!(ns.lookup("__context_dir__").unwrap().to_str(), "/data");
    }

    #[test]
    fn test_optional_libraries_follow_availability() {
        let ns = SandboxGlobals::builder().build();
        let available = LibraryAvailability::detect();
        assert_eq!(ns.injected("statistics").is_some(), available.statistics);
        assert_eq!(ns.injected("csv").is_some(), available.csv);
    }
}
