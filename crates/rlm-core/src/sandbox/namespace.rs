//! The layered variable namespace of one REPL.

use std::sync::Arc;

use indexmap::IndexMap;

use super::value::Value;

/// Builtins, write-once injected capabilities, persistent globals and the
/// locals of the current execution. Lookups go locals, globals, injected,
/// builtins.
#[derive(Clone, Default)]
pub struct Namespace {
    builtins: Arc<IndexMap<String, Value>>,
    injected: IndexMap<String, Value>,
    globals: IndexMap<String, Value>,
    locals: IndexMap<String, Value>,
}

impl Namespace {
    pub fn new(builtins: Arc<IndexMap<String, Value>>, injected: IndexMap<String, Value>) -> Self {
        Self {
            builtins,
            injected,
            globals: IndexMap::new(),
            locals: IndexMap::new(),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        self.locals
            .get(name)
            .or_else(|| self.globals.get(name))
            .or_else(|| self.injected.get(name))
            .or_else(|| self.builtins.get(name))
            .cloned()
    }

    /// Looks a name up only among the injected capabilities.
    pub fn injected(&self, name: &str) -> Option<&Value> {
        self.injected.get(name)
    }

    pub fn builtin(&self, name: &str) -> Option<&Value> {
        self.builtins.get(name)
    }

    pub fn set_local(&mut self, name: impl Into<String>, value: Value) {
        self.locals.insert(name.into(), value);
    }

    pub fn remove_local(&mut self, name: &str) -> Option<Value> {
        self.locals
            .shift_remove(name)
            .or_else(|| self.globals.shift_remove(name))
    }

    pub fn set_global(&mut self, name: impl Into<String>, value: Value) {
        self.globals.insert(name.into(), value);
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    pub fn local(&self, name: &str) -> Option<&Value> {
        self.locals.get(name)
    }

    pub fn globals(&self) -> &IndexMap<String, Value> {
        &self.globals
    }

    pub fn locals(&self) -> &IndexMap<String, Value> {
        &self.locals
    }

    /// Copies every local not starting with `_` into the globals.
    pub fn promote_locals(&mut self) -> usize {
        let mut promoted = 0;
        for (name, value) in &self.locals {
            if !name.starts_with('_') {
                self.globals.insert(name.clone(), value.clone());
                promoted += 1;
            }
        }
        promoted
    }

    /// Replaces a host-maintained binding such as `history` or `context`.
    /// User bindings of the same name are dropped so the fresh value is seen.
    pub fn set_injected(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        self.locals.shift_remove(&name);
        self.globals.shift_remove(&name);
        self.injected.insert(name, value);
    }

    /// Replaces the current task binding (`task` and `__task__`).
    pub fn set_task(&mut self, task: &str) {
        self.injected.insert("task".into(), Value::str(task));
        self.injected.insert("__task__".into(), Value::str(task));
    }

    pub fn task(&self) -> Option<String> {
        self.injected.get("task").map(Value::to_str)
    }

    /// Drops user state, keeping builtins and injected capabilities.
    pub fn reset_user_state(&mut self) {
        self.globals.clear();
        self.locals.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn namespace() -> Namespace {
        let mut builtins = IndexMap::new();
        builtins.insert("len".to_string(), Value::Int(0));
        Namespace::new(Arc::new(builtins), IndexMap::new())
    }

    #[test]
    fn test_lookup_order() {
        let mut ns = namespace();
        ns.set_global("x", Value::Int(1));
        ns.set_local("x", Value::Int(2));
        assert!(matches!(ns.lookup("x"), Some(Value::Int(2))));
        assert!(ns.lookup("len").is_some());
        assert!(ns.lookup("missing").is_none());
    }

    #[test]
    fn test_promote_skips_reserved_prefix() {
        let mut ns = namespace();
        ns.set_local("visible", Value::Int(1));
        ns.set_local("_hidden", Value::Int(2));
        assert_eq!(ns.promote_locals(), 1);
        assert!(ns.global("visible").is_some());
        assert!(ns.global("_hidden").is_none());
    }

    #[test]
    fn test_set_task_overwrites() {
        let mut ns = namespace();
        ns.set_task("first");
        ns.set_task("second");
        assert_eq!(ns.task().as_deref(), Some("second"));
        assert!(matches!(ns.lookup("__task__"), Some(Value::Str(s)) if &*s == "second"));
    }

    #[test]
    fn test_set_injected_replaces_shadowing_global() {
        let mut ns = namespace();
        ns.set_global("context", Value::str("stale"));
        ns.set_injected("context", Value::str("fresh"));
        assert!(matches!(ns.lookup("context"), Some(Value::Str(s)) if &*s == "fresh"));
    }
}
