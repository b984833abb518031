//! Guard hooks installed under reserved names.
//!
//! The restricted compiler routes every attribute load, subscript, iteration,
//! unpacking, in-place operation, write and `print` call through one of these
//! hooks. They are looked up by name at runtime, so a namespace that lacks a
//! hook cannot run code needing it.

use super::ast::BinOp;
use super::error::{ExcType, ExecResult, Exception};
use super::interpreter::Interpreter;
use super::methods;
use super::ops;
use super::value::{Args, Value};

/// Upper bound on captured `print` output per execution.
const MAX_CAPTURED_OUTPUT: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardHook {
    GetAttr,
    GetItem,
    GetIter,
    UnpackSequence,
    IterUnpackSequence,
    InPlaceVar,
    Write,
    Print,
}

impl GuardHook {
    pub const ALL: [GuardHook; 8] = [
        GuardHook::GetAttr,
        GuardHook::GetItem,
        GuardHook::GetIter,
        GuardHook::UnpackSequence,
        GuardHook::IterUnpackSequence,
        GuardHook::InPlaceVar,
        GuardHook::Write,
        GuardHook::Print,
    ];

    pub fn reserved_name(self) -> &'static str {
        match self {
            GuardHook::GetAttr => "_getattr_",
            GuardHook::GetItem => "_getitem_",
            GuardHook::GetIter => "_getiter_",
            GuardHook::UnpackSequence => "_unpack_sequence_",
            GuardHook::IterUnpackSequence => "_iter_unpack_sequence_",
            GuardHook::InPlaceVar => "_inplacevar_",
            GuardHook::Write => "_write_",
            GuardHook::Print => "_print_",
        }
    }
}

/// Runs `hook` with already evaluated arguments.
pub fn invoke(interp: &mut Interpreter, hook: GuardHook, args: Args) -> ExecResult<Value> {
    match hook {
        GuardHook::GetAttr => {
            args.check("_getattr_", 2, 3)?;
            let name = attr_name(&args.positional[1])?;
            match guarded_getattr(&args.positional[0], &name) {
                Err(e) if e.kind() == ExcType::AttributeError && args.len() == 3 => {
                    Ok(args.positional[2].clone())
                }
                other => other,
            }
        }
        GuardHook::GetItem => {
            args.check("_getitem_", 2, 2)?;
            ops::get_item(interp, &args.positional[0], &args.positional[1])
        }
        GuardHook::GetIter => {
            args.check("_getiter_", 1, 1)?;
            match &args.positional[0] {
                Value::Range(_) => Ok(args.positional[0].clone()),
                other => Ok(Value::list(ops::collect(other)?)),
            }
        }
        GuardHook::UnpackSequence | GuardHook::IterUnpackSequence => {
            args.check(hook.reserved_name(), 3, 3)?;
            let count = args.positional[1].as_int().unwrap_or(0).max(0) as usize;
            let star = args.positional[2]
                .as_int()
                .filter(|n| *n >= 0)
                .map(|n| n as usize);
            let items = unpack(&args.positional[0], count, star)?;
            Ok(Value::tuple(items))
        }
        GuardHook::InPlaceVar => {
            args.check("_inplacevar_", 3, 3)?;
            let op = args.positional[0].as_str().unwrap_or_default().to_string();
            inplace(&op, &args.positional[1], &args.positional[2])
        }
        GuardHook::Write => {
            args.check("_write_", 1, 1)?;
            write_guard(&args.positional[0])
        }
        GuardHook::Print => print(interp, args),
    }
}

fn attr_name(value: &Value) -> ExecResult<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Exception::type_error("attribute name must be string"))
}

/// Attribute access with the underscore and `str.format` restrictions.
pub fn guarded_getattr(obj: &Value, name: &str) -> ExecResult<Value> {
    if name.starts_with('_') {
        return Err(Exception::new(
            ExcType::AttributeError,
            format!("\"{name}\" is an invalid attribute name because it starts with \"_\""),
        ));
    }
    if matches!(obj, Value::Str(_)) && (name == "format" || name == "format_map") {
        return Err(Exception::new(
            ExcType::NotImplementedError,
            "Using format() on a str is not safe.",
        ));
    }
    methods::get_attribute(obj, name)
}

/// Destructures `value` into exactly `count` targets, one of which may be
/// starred and receive a list of the surplus.
pub fn unpack(value: &Value, count: usize, star: Option<usize>) -> ExecResult<Vec<Value>> {
    let items = ops::collect(value)?;
    match star {
        None => {
            if items.len() > count {
                return Err(Exception::value_error(format!(
                    "too many values to unpack (expected {count})"
                )));
            }
            if items.len() < count {
                return Err(Exception::value_error(format!(
                    "not enough values to unpack (expected {count}, got {})",
                    items.len()
                )));
            }
            Ok(items)
        }
        Some(pos) => {
            let fixed = count.saturating_sub(1);
            if items.len() < fixed {
                return Err(Exception::value_error(format!(
                    "not enough values to unpack (expected at least {fixed}, got {})",
                    items.len()
                )));
            }
            let tail = fixed - pos;
            let mut out = Vec::with_capacity(count);
            out.extend(items[..pos].iter().cloned());
            out.push(Value::list(items[pos..items.len() - tail].to_vec()));
            out.extend(items[items.len() - tail..].iter().cloned());
            Ok(out)
        }
    }
}

/// `x op= y`. Lists extend in place so aliases observe the change.
pub fn inplace(op: &str, left: &Value, right: &Value) -> ExecResult<Value> {
    let bin = BinOp::from_inplace(op)
        .filter(|b| *b != BinOp::MatMul)
        .ok_or_else(|| {
            Exception::new(
                ExcType::RuntimeError,
                format!("Unsupported in-place operator: {op}"),
            )
        })?;
    if bin == BinOp::Add {
        if let Value::List(list) = left {
            let extra = match right {
                Value::List(other) => other.lock().clone(),
                Value::Tuple(t) => t.to_vec(),
                _ => return ops::binary(bin, left, right),
            };
            list.lock().extend(extra);
            return Ok(left.clone());
        }
    }
    ops::binary(bin, left, right)
}

/// Interception point for attribute and item stores.
pub fn write_guard(obj: &Value) -> ExecResult<Value> {
    match obj {
        Value::Module(_) | Value::Type(_) | Value::Builtin(_) => Err(Exception::type_error(
            format!("cannot modify attributes of '{}' objects", obj.type_name()),
        )),
        _ => Ok(obj.clone()),
    }
}

/// The print collector: renders like `print` and appends to captured output.
pub fn print(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let sep = match args.kwarg("sep") {
        None | Some(Value::None) => " ".to_string(),
        Some(Value::Str(s)) => s.to_string(),
        Some(other) => {
            return Err(Exception::type_error(format!(
                "sep must be None or a string, not {}",
                other.type_name()
            )))
        }
    };
    let end = match args.kwarg("end") {
        None | Some(Value::None) => "\n".to_string(),
        Some(Value::Str(s)) => s.to_string(),
        Some(other) => {
            return Err(Exception::type_error(format!(
                "end must be None or a string, not {}",
                other.type_name()
            )))
        }
    };
    let mut text = args
        .positional
        .iter()
        .map(Value::to_str)
        .collect::<Vec<_>>()
        .join(&sep);
    text.push_str(&end);
    match args.kwarg("file") {
        None | Some(Value::None) => interp.write_stdout(&text),
        Some(target) => {
            let target = target.clone();
            methods::call_method(interp, &target, "write", Args::new(vec![Value::str(text)]))?;
        }
    }
    Ok(Value::None)
}

/// Appends to a capture buffer, dropping output past the cap.
pub(crate) fn append_capped(buffer: &mut String, text: &str) {
    let room = MAX_CAPTURED_OUTPUT.saturating_sub(buffer.len());
    if text.len() <= room {
        buffer.push_str(text);
    } else {
        let mut cut = room;
        while cut > 0 && !text.is_char_boundary(cut) {
            cut -= 1;
        }
        buffer.push_str(&text[..cut]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_names_are_underscored() {
        for hook in GuardHook::ALL {
            let name = hook.reserved_name();
            assert!(name.starts_with('_') && name.ends_with('_'), "{name}");
        }
    }

    #[test]
    fn test_inplace_operators() {
        assert!(matches!(
            inplace("+=", &Value::Int(2), &Value::Int(3)).unwrap(),
            Value::Int(5)
        ));
        assert!(matches!(
            inplace("<<=", &Value::Int(1), &Value::Int(4)).unwrap(),
            Value::Int(16)
        ));
        assert!(matches!(
            inplace("//=", &Value::Int(7), &Value::Int(2)).unwrap(),
            Value::Int(3)
        ));
        assert!(inplace("@=", &Value::Int(1), &Value::Int(1)).is_err());
    }

    #[test]
    fn test_inplace_list_add_mutates_alias() {
        let list = Value::list(vec![Value::Int(1)]);
        let alias = list.clone();
        inplace("+=", &list, &Value::list(vec![Value::Int(2)])).unwrap();
        assert_eq!(alias.repr(), "[1, 2]");
    }

    #[test]
    fn test_write_guard_is_permissive_for_containers() {
        assert!(write_guard(&Value::list(vec![])).is_ok());
        assert!(write_guard(&Value::Type(super::super::value::TypeObj::Int)).is_err());
    }

    #[test]
    fn test_append_capped_respects_char_boundary() {
        let mut buffer = "x".repeat(MAX_CAPTURED_OUTPUT - 1);
        append_capped(&mut buffer, "é");
        assert_eq!(buffer.len(), MAX_CAPTURED_OUTPUT - 1);
    }
}
