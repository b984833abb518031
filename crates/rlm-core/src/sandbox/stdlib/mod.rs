//! Allow-listed utility modules and the host objects they expose.
//!
//! `import` only ever resolves against [`import`]; everything else raises
//! `ImportError`.

use std::sync::Arc;

use indexmap::IndexMap;

use super::error::{ExcType, ExecResult, Exception};
use super::interpreter::Interpreter;
use super::value::{Args, Builtin, BuiltinFn, Module, Native, TypeObj, Value};

pub mod collections;
#[cfg(feature = "data-science")]
pub mod csv;
pub mod datetime;
pub mod io;
pub mod json;
pub mod math;
pub mod os;
pub mod pathlib;
pub mod re;
#[cfg(feature = "data-science")]
pub mod stats;

/// Module names importable from sandboxed code.
pub fn allowed_modules() -> Vec<&'static str> {
    let mut names = vec![
        "re",
        "json",
        "math",
        "datetime",
        "collections",
        "os",
        "os.path",
        "pathlib",
        "io",
        "typing",
    ];
    if cfg!(feature = "data-science") {
        names.extend(["statistics", "csv"]);
    }
    names
}

pub(crate) fn func(name: &'static str, f: BuiltinFn) -> Value {
    Value::Builtin(Builtin { name, func: f })
}

pub(crate) fn module(name: &str, attrs: Vec<(&str, Value)>) -> Value {
    Value::Module(Arc::new(Module {
        name: name.to_string(),
        attrs: attrs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect::<IndexMap<_, _>>(),
    }))
}

/// Positional-or-keyword string argument.
pub(crate) fn text_arg(args: &Args, index: usize, name: &str, func: &str) -> ExecResult<Arc<str>> {
    match args.arg(index, name) {
        Some(Value::Str(s)) => Ok(s),
        Some(other) => Err(Exception::type_error(format!(
            "{func}() argument '{name}' must be str, not {}",
            other.type_name()
        ))),
        None => Err(Exception::type_error(format!(
            "{func}() missing required argument: '{name}'"
        ))),
    }
}

fn typing_module() -> Value {
    let names = [
        "Any", "List", "Dict", "Tuple", "Set", "Optional", "Union", "Callable", "Iterable",
    ];
    module(
        "typing",
        names
            .iter()
            .map(|n| (*n, Value::Type(TypeObj::Object)))
            .collect(),
    )
}

fn io_module() -> Value {
    module("io", vec![("StringIO", Value::Type(TypeObj::StringIO))])
}

/// Resolves `import name`.
pub fn import(name: &str) -> ExecResult<Value> {
    let value = match name {
        "re" => re::module_value(),
        "json" => json::module_value(),
        "math" => math::module_value(),
        "datetime" => datetime::module_value(),
        "collections" => collections::module_value(),
        "os" => os::module_value(),
        "os.path" => os::path_module(),
        "pathlib" => pathlib::module_value(),
        "io" => io_module(),
        "typing" => typing_module(),
        #[cfg(feature = "data-science")]
        "statistics" => stats::module_value(),
        #[cfg(feature = "data-science")]
        "csv" => csv::module_value(),
        _ => {
            return Err(Exception::new(
                ExcType::ImportError,
                format!("import of '{name}' is not allowed in the sandbox"),
            ))
        }
    };
    Ok(value)
}

/// Resolves `from module import name`.
pub fn import_name(source: &Value, module: &str, name: &str) -> ExecResult<Value> {
    let found = match source {
        Value::Module(m) => m.attrs.get(name).cloned(),
        _ => None,
    };
    found.ok_or_else(|| {
        Exception::new(
            ExcType::ImportError,
            format!("cannot import name '{name}' from '{module}'"),
        )
    })
}

fn native_methods(n: &Native) -> &'static [&'static str] {
    match n {
        Native::Path(_) => pathlib::METHODS,
        Native::DateTime(_) => datetime::DATETIME_METHODS,
        Native::Date(_) => datetime::DATE_METHODS,
        Native::TimeDelta(_) => datetime::TIMEDELTA_METHODS,
        Native::Pattern(_) => re::PATTERN_METHODS,
        Native::Match(_) => re::MATCH_METHODS,
        Native::StringIO(_) => io::STRINGIO_METHODS,
        Native::File(_) => io::FILE_METHODS,
    }
}

fn native_properties(n: &Native) -> &'static [&'static str] {
    match n {
        Native::Path(_) => pathlib::PROPERTIES,
        Native::DateTime(_) => datetime::DATETIME_PROPERTIES,
        Native::Date(_) => datetime::DATE_PROPERTIES,
        Native::TimeDelta(_) => datetime::TIMEDELTA_PROPERTIES,
        Native::Pattern(_) => re::PATTERN_PROPERTIES,
        Native::Match(_) => re::MATCH_PROPERTIES,
        Native::StringIO(_) => &[],
        Native::File(_) => io::FILE_PROPERTIES,
    }
}

pub fn native_attribute_names(n: &Arc<Native>) -> Vec<String> {
    native_methods(n)
        .iter()
        .chain(native_properties(n))
        .map(|s| s.to_string())
        .collect()
}

pub fn native_has_method(n: &Arc<Native>, name: &str) -> bool {
    native_methods(n).contains(&name)
}

/// Data attributes of host objects.
pub fn native_property(n: &Arc<Native>, name: &str) -> Option<Value> {
    match &**n {
        Native::Path(p) => pathlib::property(p, name),
        Native::DateTime(_) | Native::Date(_) | Native::TimeDelta(_) => {
            datetime::property(n, name)
        }
        Native::Pattern(p) => re::pattern_property(p, name),
        Native::Match(m) => re::match_property(m, name),
        Native::StringIO(_) => None,
        Native::File(f) => io::file_property(f, name),
    }
}

pub fn call_native_method(
    interp: &mut Interpreter,
    n: &Arc<Native>,
    name: &str,
    args: Args,
) -> ExecResult<Value> {
    match &**n {
        Native::Path(p) => pathlib::method(interp, p, name, args),
        Native::DateTime(_) | Native::Date(_) | Native::TimeDelta(_) => {
            datetime::method(n, name, args)
        }
        Native::Pattern(p) => re::pattern_method(interp, p, name, args),
        Native::Match(m) => re::match_method(m, name, args),
        Native::StringIO(buffer) => io::stringio_method(buffer, name, args),
        Native::File(file) => io::file_method(interp, file, name, args),
    }
}

pub fn class_has_attribute(class: TypeObj, name: &str) -> bool {
    match class {
        TypeObj::DateTime => datetime::DATETIME_CLASS_METHODS.contains(&name),
        TypeObj::Date => datetime::DATE_CLASS_METHODS.contains(&name),
        TypeObj::Path => pathlib::CLASS_METHODS.contains(&name),
        _ => false,
    }
}

pub fn call_class_method(
    interp: &mut Interpreter,
    class: TypeObj,
    name: &str,
    args: Args,
) -> ExecResult<Value> {
    match class {
        TypeObj::DateTime | TypeObj::Date => datetime::class_method(class, name, args),
        TypeObj::Path => pathlib::class_method(interp, name, args),
        other => Err(Exception::new(
            ExcType::AttributeError,
            format!("type object '{}' has no attribute '{name}'", other.name()),
        )),
    }
}

/// Calls a class backed by a host object.
pub fn construct_native(
    interp: &mut Interpreter,
    class: TypeObj,
    args: Args,
) -> ExecResult<Value> {
    match class {
        TypeObj::DateTime | TypeObj::Date | TypeObj::TimeDelta => datetime::construct(class, args),
        TypeObj::Path => pathlib::construct(args),
        TypeObj::StringIO => io::construct_stringio(interp, args),
        other => Err(Exception::type_error(format!(
            "cannot create '{}' instances",
            other.name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disallowed_import_is_import_error() {
        let err = import("subprocess").unwrap_err();
        assert_eq!(err.kind(), ExcType::ImportError);
        assert_eq!(
            err.message(),
            "import of 'subprocess' is not allowed in the sandbox"
        );
    }

    #[test]
    fn test_every_allowed_module_imports() {
        for name in allowed_modules() {
            assert!(import(name).is_ok(), "{name} failed to import");
        }
    }

    #[test]
    fn test_import_name_reports_missing_names() {
        let math = import("math").unwrap();
        assert!(import_name(&math, "math", "sqrt").is_ok());
        let err = import_name(&math, "math", "nope").unwrap_err();
        assert_eq!(err.message(), "cannot import name 'nope' from 'math'");
    }
}
