//! `collections`: `Counter`, `defaultdict` and `OrderedDict` as dict flavors.

use super::module;
use crate::sandbox::error::{ExecResult, Exception};
use crate::sandbox::interpreter::Interpreter;
use crate::sandbox::methods::{counter_update, update_pairs};
use crate::sandbox::value::{Args, DictData, DictFlavor, TypeObj, Value};

pub fn module_value() -> Value {
    module(
        "collections",
        vec![
            ("Counter", Value::Type(TypeObj::Counter)),
            ("defaultdict", Value::Type(TypeObj::DefaultDict)),
            ("OrderedDict", Value::Type(TypeObj::OrderedDict)),
        ],
    )
}

fn fill(data: &mut DictData, source: Option<&Value>, args: &Args) -> ExecResult<()> {
    if let Some(source) = source {
        for (k, v) in update_pairs(source)? {
            data.insert(k, v)?;
        }
    }
    for (k, v) in &args.kwargs {
        data.insert_str(k, v.clone());
    }
    Ok(())
}

pub fn construct(_interp: &mut Interpreter, class: TypeObj, args: Args) -> ExecResult<Value> {
    match class {
        TypeObj::Counter => {
            args.check("Counter", 0, 1)?;
            let mut data = DictData::new(DictFlavor::Counter);
            if let Some(source) = args.get(0) {
                counter_update(&mut data, source, 1)?;
            }
            for (k, v) in &args.kwargs {
                let n = v
                    .as_int()
                    .ok_or_else(|| Exception::type_error("Counter values must be integers"))?;
                data.insert_str(k, Value::Int(n));
            }
            Ok(Value::dict(data))
        }
        TypeObj::DefaultDict => {
            args.check("defaultdict", 0, 2)?;
            let factory = args.get(0).cloned().unwrap_or(Value::None);
            if !factory.is_none() && !factory.is_callable() {
                return Err(Exception::type_error("first argument must be callable or None"));
            }
            let mut data = DictData::new(DictFlavor::Default(factory));
            fill(&mut data, args.get(1), &args)?;
            Ok(Value::dict(data))
        }
        TypeObj::OrderedDict => {
            args.check("OrderedDict", 0, 1)?;
            let mut data = DictData::new(DictFlavor::Ordered);
            fill(&mut data, args.get(0), &args)?;
            Ok(Value::dict(data))
        }
        other => Err(Exception::type_error(format!(
            "cannot create '{}' instances",
            other.name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::fs::SandboxFs;
    use crate::sandbox::interpreter::{ExecContext, ExecutionLimits};
    use crate::sandbox::namespace::Namespace;
    use indexmap::IndexMap;
    use std::sync::Arc;

    fn interp() -> Interpreter {
        let ns = Namespace::new(Arc::new(IndexMap::new()), IndexMap::new());
        let ctx = ExecContext {
            fs: Arc::new(SandboxFs::new(None, None)),
            host: None,
        };
        Interpreter::new(ns, ctx, ExecutionLimits::default())
    }

    #[test]
    fn test_counter_counts_iterable() {
        let mut i = interp();
        let c = construct(&mut i, TypeObj::Counter, Args::new(vec![Value::str("aab")])).unwrap();
        assert_eq!(c.repr(), "Counter({'a': 2, 'b': 1})");
    }

    #[test]
    fn test_defaultdict_requires_callable() {
        let mut i = interp();
        let err = construct(&mut i, TypeObj::DefaultDict, Args::new(vec![Value::Int(1)])).unwrap_err();
        assert_eq!(err.message(), "first argument must be callable or None");
    }

    #[test]
    fn test_ordered_dict_keeps_pairs() {
        let mut i = interp();
        let pairs = Value::list(vec![
            Value::tuple(vec![Value::str("b"), Value::Int(1)]),
            Value::tuple(vec![Value::str("a"), Value::Int(2)]),
        ]);
        let d = construct(&mut i, TypeObj::OrderedDict, Args::new(vec![pairs])).unwrap();
        assert!(TypeObj::OrderedDict.matches(&d));
        let Value::Dict(data) = d else { panic!() };
        assert_eq!(data.lock().keys().len(), 2);
    }
}
