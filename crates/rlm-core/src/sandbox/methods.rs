//! Attribute lookup and method dispatch for builtin value types.

use std::cmp::Ordering;
use std::sync::Arc;

use super::error::{ExcType, ExecResult, Exception};
use super::interpreter::Interpreter;
use super::ops;
use super::stdlib;
use super::value::{
    py_cmp, py_eq, Args, BoundMethod, DictData, DictFlavor, SetData, TypeObj, Value,
};

const STR_METHODS: &[&str] = &[
    "capitalize", "casefold", "center", "count", "endswith", "expandtabs", "find", "index",
    "isalnum", "isalpha", "isascii", "isdecimal", "isdigit", "isidentifier", "islower",
    "isnumeric", "isspace", "istitle", "isupper", "join", "ljust", "lower", "lstrip",
    "partition", "removeprefix", "removesuffix", "replace", "rfind", "rindex", "rjust",
    "rpartition", "rsplit", "rstrip", "split", "splitlines", "startswith", "strip",
    "swapcase", "title", "upper", "zfill",
];

const LIST_METHODS: &[&str] = &[
    "append", "extend", "insert", "remove", "pop", "clear", "index", "count", "sort",
    "reverse", "copy",
];

const DICT_METHODS: &[&str] = &[
    "keys", "values", "items", "get", "pop", "popitem", "setdefault", "update", "clear", "copy",
];

const COUNTER_METHODS: &[&str] = &["most_common", "elements", "total", "subtract"];

const SET_METHODS: &[&str] = &[
    "add", "remove", "discard", "pop", "clear", "copy", "union", "intersection", "difference",
    "symmetric_difference", "update", "intersection_update", "difference_update", "issubset",
    "issuperset", "isdisjoint",
];

const TUPLE_METHODS: &[&str] = &["index", "count"];

/// Names visible through `dir(obj)`.
pub fn attribute_names(obj: &Value) -> Vec<String> {
    let mut names: Vec<String> = match obj {
        Value::Str(_) => STR_METHODS.iter().map(|s| s.to_string()).collect(),
        Value::List(_) => LIST_METHODS.iter().map(|s| s.to_string()).collect(),
        Value::Tuple(_) => TUPLE_METHODS.iter().map(|s| s.to_string()).collect(),
        Value::Set(_) => SET_METHODS.iter().map(|s| s.to_string()).collect(),
        Value::Dict(d) => {
            let flavor = d.lock().flavor.clone();
            let mut names: Vec<String> = DICT_METHODS.iter().map(|s| s.to_string()).collect();
            match flavor {
                DictFlavor::Counter => names.extend(COUNTER_METHODS.iter().map(|s| s.to_string())),
                DictFlavor::Ordered => names.push("move_to_end".into()),
                DictFlavor::Default(_) => names.push("default_factory".into()),
                DictFlavor::Plain => {}
            }
            names
        }
        Value::Module(m) => m.attrs.keys().cloned().collect(),
        Value::Native(n) => stdlib::native_attribute_names(n),
        Value::Exception(_) => vec!["args".into()],
        Value::Range(_) => vec!["start".into(), "stop".into(), "step".into()],
        Value::Float(_) => vec!["is_integer".into()],
        Value::Int(_) => vec!["bit_length".into()],
        _ => Vec::new(),
    };
    names.sort();
    names.dedup();
    names
}

fn has_method(obj: &Value, name: &str) -> bool {
    match obj {
        Value::Str(_) => STR_METHODS.contains(&name),
        Value::List(_) => LIST_METHODS.contains(&name),
        Value::Tuple(_) => TUPLE_METHODS.contains(&name),
        Value::Set(_) => SET_METHODS.contains(&name),
        Value::Dict(d) => {
            DICT_METHODS.contains(&name)
                || match d.lock().flavor {
                    DictFlavor::Counter => COUNTER_METHODS.contains(&name),
                    DictFlavor::Ordered => name == "move_to_end",
                    _ => false,
                }
        }
        Value::Float(_) => name == "is_integer",
        Value::Int(_) => name == "bit_length",
        Value::Native(n) => stdlib::native_has_method(n, name),
        _ => false,
    }
}

fn bound(receiver: &Value, name: &str) -> Value {
    Value::Method(Arc::new(BoundMethod {
        receiver: receiver.clone(),
        name: Arc::from(name),
    }))
}

/// `obj.name` for every value kind.
pub fn get_attribute(obj: &Value, name: &str) -> ExecResult<Value> {
    match obj {
        Value::Module(module) => module.attrs.get(name).cloned().ok_or_else(|| {
            Exception::new(
                ExcType::AttributeError,
                format!("module '{}' has no attribute '{name}'", module.name),
            )
        }),
        Value::Exception(exc) if name == "args" => Ok(Value::tuple(exc.args.clone())),
        Value::Range(r) => match name {
            "start" => Ok(Value::Int(r.start)),
            "stop" => Ok(Value::Int(r.stop)),
            "step" => Ok(Value::Int(r.step)),
            _ => Err(Exception::attribute_error("range", name)),
        },
        Value::Dict(d) if name == "default_factory" => {
            let flavor = d.lock().flavor.clone();
            match flavor {
                DictFlavor::Default(factory) => Ok(factory),
                _ => Err(Exception::attribute_error(obj.type_name(), name)),
            }
        }
        Value::Type(class) => class_attribute(*class, obj, name),
        Value::Native(n) => match stdlib::native_property(n, name) {
            Some(value) => Ok(value),
            None if has_method(obj, name) => Ok(bound(obj, name)),
            None => Err(Exception::attribute_error(obj.type_name(), name)),
        },
        _ if has_method(obj, name) => Ok(bound(obj, name)),
        _ => Err(Exception::attribute_error(obj.type_name(), name)),
    }
}

fn class_attribute(class: TypeObj, obj: &Value, name: &str) -> ExecResult<Value> {
    let exists = match class {
        TypeObj::Str => STR_METHODS.contains(&name),
        TypeObj::Dict => name == "fromkeys",
        other => stdlib::class_has_attribute(other, name),
    };
    if exists {
        Ok(bound(obj, name))
    } else {
        Err(Exception::new(
            ExcType::AttributeError,
            format!("type object '{}' has no attribute '{name}'", class.name()),
        ))
    }
}

/// Attribute stores are not supported on any builtin value.
pub fn set_attribute(obj: &Value, attr: &str, _value: Value) -> ExecResult<()> {
    Err(Exception::new(
        ExcType::AttributeError,
        format!(
            "'{}' object attribute '{attr}' is read-only",
            obj.type_name()
        ),
    ))
}

/// Calls `receiver.name(*args)`.
pub fn call_method(
    interp: &mut Interpreter,
    receiver: &Value,
    name: &str,
    args: Args,
) -> ExecResult<Value> {
    interp.tick()?;
    match receiver {
        Value::Str(s) => str_method(s, name, args),
        Value::List(_) => list_method(interp, receiver, name, args),
        Value::Dict(_) => dict_method(receiver, name, args),
        Value::Set(_) => set_method(receiver, name, args),
        Value::Tuple(items) => sequence_method(items, "tuple", name, args),
        Value::Float(f) if name == "is_integer" => {
            args.check("is_integer", 0, 0)?;
            Ok(Value::Bool(f.is_finite() && f.fract() == 0.0))
        }
        Value::Int(n) if name == "bit_length" => {
            args.check("bit_length", 0, 0)?;
            Ok(Value::Int(64 - n.unsigned_abs().leading_zeros() as i64))
        }
        Value::Native(n) => stdlib::call_native_method(interp, n, name, args),
        Value::Type(TypeObj::Str) => {
            let mut args = args;
            if args.positional.is_empty() {
                return Err(Exception::type_error(format!(
                    "unbound method str.{name}() needs an argument"
                )));
            }
            let target = args.positional.remove(0);
            match target {
                Value::Str(s) => str_method(&s, name, args),
                other => Err(Exception::type_error(format!(
                    "descriptor '{name}' for 'str' objects doesn't apply to a '{}' object",
                    other.type_name()
                ))),
            }
        }
        Value::Type(TypeObj::Dict) if name == "fromkeys" => {
            args.check("fromkeys", 1, 2)?;
            let fill = args.get(1).cloned().unwrap_or(Value::None);
            let mut data = DictData::default();
            for key in ops::collect(&args.positional[0])? {
                data.insert(key, fill.clone())?;
            }
            Ok(Value::dict(data))
        }
        Value::Type(class) => stdlib::call_class_method(interp, *class, name, args),
        other => Err(Exception::attribute_error(other.type_name(), name)),
    }
}

// ----------------------------------------------------------------------
// str
// ----------------------------------------------------------------------

fn str_arg(args: &Args, index: usize, name: &str, method: &str) -> ExecResult<Arc<str>> {
    match args.arg(index, name) {
        Some(Value::Str(s)) => Ok(s),
        Some(other) => Err(Exception::type_error(format!(
            "{method}() argument must be str, not {}",
            other.type_name()
        ))),
        None => Err(Exception::type_error(format!(
            "{method}() missing required argument '{name}'"
        ))),
    }
}

fn opt_str_arg(args: &Args, index: usize, name: &str, method: &str) -> ExecResult<Option<Arc<str>>> {
    match args.arg(index, name) {
        None | Some(Value::None) => Ok(None),
        Some(Value::Str(s)) => Ok(Some(s)),
        Some(other) => Err(Exception::type_error(format!(
            "{method}() argument must be str or None, not {}",
            other.type_name()
        ))),
    }
}

fn int_arg(args: &Args, index: usize, name: &str, default: i64) -> ExecResult<i64> {
    match args.arg(index, name) {
        None | Some(Value::None) => Ok(default),
        Some(value) => value.as_int().ok_or_else(|| {
            Exception::type_error(format!(
                "'{}' object cannot be interpreted as an integer",
                value.type_name()
            ))
        }),
    }
}

/// Byte range of the char window `[start, end)` and the char offset of its start.
fn char_window(s: &str, start: Option<i64>, end: Option<i64>) -> (usize, usize, usize) {
    let len = s.chars().count() as i64;
    let clamp = |v: Option<i64>, default: i64| -> i64 {
        match v {
            None => default,
            Some(v) if v < 0 => (v + len).max(0),
            Some(v) => v.min(len),
        }
    };
    let (a, b) = (clamp(start, 0), clamp(end, len));
    let to_byte = |c: i64| -> usize {
        s.char_indices()
            .nth(c as usize)
            .map_or(s.len(), |(i, _)| i)
    };
    if a >= b {
        let at = to_byte(a);
        return (at, at, a as usize);
    }
    (to_byte(a), to_byte(b), a as usize)
}

fn window_args(args: &Args, from: usize) -> ExecResult<(Option<i64>, Option<i64>)> {
    let get = |i: usize| -> ExecResult<Option<i64>> {
        match args.get(i) {
            None | Some(Value::None) => Ok(None),
            Some(v) => v
                .as_int()
                .map(Some)
                .ok_or_else(|| Exception::type_error("slice indices must be integers or None")),
        }
    };
    Ok((get(from)?, get(from + 1)?))
}

fn find_in(s: &str, sub: &str, start: Option<i64>, end: Option<i64>, last: bool) -> Option<usize> {
    let (a, b, offset) = char_window(s, start, end);
    let hay = &s[a..b];
    let pos = if last { hay.rfind(sub) } else { hay.find(sub) }?;
    Some(offset + hay[..pos].chars().count())
}

fn pad_str(s: &str, width: i64, fill: char, align: char) -> ExecResult<String> {
    let len = s.chars().count() as i64;
    if width <= len {
        return Ok(s.to_string());
    }
    let total = (width - len) as usize;
    ops::check_bytes(total.saturating_mul(fill.len_utf8()).saturating_add(s.len()))?;
    let (left, right) = match align {
        '<' => (0, total),
        '>' => (total, 0),
        _ => {
            let left = total / 2 + (total & width as usize & 1);
            (left, total - left)
        }
    };
    let fill = fill.to_string();
    Ok(format!("{}{s}{}", fill.repeat(left), fill.repeat(right)))
}

fn fill_char(args: &Args, method: &str) -> ExecResult<char> {
    match args.arg(1, "fillchar") {
        None => Ok(' '),
        Some(Value::Str(s)) if s.chars().count() == 1 => Ok(s.chars().next().unwrap_or(' ')),
        Some(_) => Err(Exception::type_error(format!(
            "{method}() argument 2 must be a single character"
        ))),
    }
}

fn strip_set(s: &str, chars: Option<&str>, left: bool, right: bool) -> String {
    let matches = |c: char| match chars {
        Some(set) => set.contains(c),
        None => c.is_whitespace(),
    };
    let mut out = s;
    if left {
        out = out.trim_start_matches(matches);
    }
    if right {
        out = out.trim_end_matches(matches);
    }
    out.to_string()
}

fn split_whitespace_n(s: &str, maxsplit: i64) -> Vec<Value> {
    let mut out = Vec::new();
    let mut rest = s.trim_start();
    while !rest.is_empty() {
        if maxsplit >= 0 && out.len() as i64 >= maxsplit {
            out.push(Value::str(rest));
            break;
        }
        match rest.find(char::is_whitespace) {
            Some(pos) => {
                out.push(Value::str(&rest[..pos]));
                rest = rest[pos..].trim_start();
            }
            None => {
                out.push(Value::str(rest));
                break;
            }
        }
    }
    out
}

fn rsplit_whitespace_n(s: &str, maxsplit: i64) -> Vec<Value> {
    let mut out = Vec::new();
    let mut rest = s.trim_end();
    while !rest.is_empty() {
        if maxsplit >= 0 && out.len() as i64 >= maxsplit {
            out.push(Value::str(rest));
            break;
        }
        match rest.rfind(char::is_whitespace) {
            Some(pos) => {
                let ws_len = rest[pos..].chars().next().map_or(1, char::len_utf8);
                out.push(Value::str(&rest[pos + ws_len..]));
                rest = rest[..pos].trim_end();
            }
            None => {
                out.push(Value::str(rest));
                break;
            }
        }
    }
    out.reverse();
    out
}

fn split_lines(s: &str, keepends: bool) -> Vec<Value> {
    let mut out = Vec::new();
    let mut start = 0;
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let brk = match bytes[i] {
            b'\r' if bytes.get(i + 1) == Some(&b'\n') => 2,
            b'\n' | b'\r' => 1,
            _ => 0,
        };
        if brk > 0 {
            let end = if keepends { i + brk } else { i };
            out.push(Value::str(&s[start..end]));
            i += brk;
            start = i;
        } else {
            i += 1;
        }
    }
    if start < s.len() {
        out.push(Value::str(&s[start..]));
    }
    out
}

fn affix_matches(s: &str, affix: &Value, method: &str, check: fn(&str, &str) -> bool) -> ExecResult<bool> {
    match affix {
        Value::Str(p) => Ok(check(s, p)),
        Value::Tuple(options) => {
            for option in options.iter() {
                if affix_matches(s, option, method, check)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        other => Err(Exception::type_error(format!(
            "{method} first arg must be str or a tuple of str, not {}",
            other.type_name()
        ))),
    }
}

fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_cased = false;
    for c in s.chars() {
        if prev_cased {
            out.extend(c.to_lowercase());
        } else {
            out.extend(c.to_uppercase());
        }
        prev_cased = c.is_alphabetic();
    }
    out
}

fn str_method(s: &Arc<str>, name: &str, args: Args) -> ExecResult<Value> {
    let text: &str = s;
    let result = match name {
        "upper" => Value::str(text.to_uppercase()),
        "lower" | "casefold" => Value::str(text.to_lowercase()),
        "swapcase" => Value::str(
            text.chars()
                .flat_map(|c| {
                    if c.is_uppercase() {
                        c.to_lowercase().collect::<Vec<_>>()
                    } else {
                        c.to_uppercase().collect::<Vec<_>>()
                    }
                })
                .collect::<String>(),
        ),
        "capitalize" => {
            let mut chars = text.chars();
            let out = match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.as_str().to_lowercase().chars()).collect(),
                None => String::new(),
            };
            Value::str(out)
        }
        "title" => Value::str(title_case(text)),
        "strip" | "lstrip" | "rstrip" => {
            let chars = opt_str_arg(&args, 0, "chars", name)?;
            let left = name != "rstrip";
            let right = name != "lstrip";
            Value::str(strip_set(text, chars.as_deref(), left, right))
        }
        "split" | "rsplit" => {
            let sep = opt_str_arg(&args, 0, "sep", name)?;
            let maxsplit = int_arg(&args, 1, "maxsplit", -1)?;
            let parts = match sep.as_deref() {
                None if name == "split" => split_whitespace_n(text, maxsplit),
                None => rsplit_whitespace_n(text, maxsplit),
                Some("") => return Err(Exception::value_error("empty separator")),
                Some(sep) if name == "split" => {
                    if maxsplit < 0 {
                        text.split(sep).map(Value::str).collect()
                    } else {
                        text.splitn(maxsplit as usize + 1, sep).map(Value::str).collect()
                    }
                }
                Some(sep) => {
                    let mut parts: Vec<Value> = if maxsplit < 0 {
                        text.rsplit(sep).map(Value::str).collect()
                    } else {
                        text.rsplitn(maxsplit as usize + 1, sep).map(Value::str).collect()
                    };
                    parts.reverse();
                    parts
                }
            };
            Value::list(parts)
        }
        "splitlines" => {
            let keepends = args.arg(0, "keepends").is_some_and(|v| v.truthy());
            Value::list(split_lines(text, keepends))
        }
        "join" => {
            args.check("join", 1, 1)?;
            let items = ops::collect(&args.positional[0])?;
            let mut parts = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                match item {
                    Value::Str(p) => parts.push(p.to_string()),
                    other => {
                        return Err(Exception::type_error(format!(
                            "sequence item {i}: expected str instance, {} found",
                            other.type_name()
                        )))
                    }
                }
            }
            Value::str(parts.join(text))
        }
        "replace" => {
            let old = str_arg(&args, 0, "old", name)?;
            let new = str_arg(&args, 1, "new", name)?;
            let count = int_arg(&args, 2, "count", -1)?;
            let out = if count < 0 {
                text.replace(&*old, &new)
            } else {
                text.replacen(&*old, &new, count as usize)
            };
            Value::str(out)
        }
        "find" | "rfind" | "index" | "rindex" => {
            let sub = str_arg(&args, 0, "sub", name)?;
            let (start, end) = window_args(&args, 1)?;
            let last = name.starts_with('r');
            match find_in(text, &sub, start, end, last) {
                Some(pos) => Value::Int(pos as i64),
                None if name.ends_with("find") => Value::Int(-1),
                None => return Err(Exception::value_error("substring not found")),
            }
        }
        "count" => {
            let sub = str_arg(&args, 0, "sub", name)?;
            let (start, end) = window_args(&args, 1)?;
            let (a, b, _) = char_window(text, start, end);
            let hay = &text[a..b];
            let n = if sub.is_empty() {
                hay.chars().count() + 1
            } else {
                hay.matches(&*sub).count()
            };
            Value::Int(n as i64)
        }
        "startswith" | "endswith" => {
            args.check(name, 1, 3)?;
            let (start, end) = window_args(&args, 1)?;
            let (a, b, _) = char_window(text, start, end);
            let window = &text[a..b];
            let check: fn(&str, &str) -> bool = if name == "startswith" {
                |s, p| s.starts_with(p)
            } else {
                |s, p| s.ends_with(p)
            };
            Value::Bool(affix_matches(window, &args.positional[0], name, check)?)
        }
        "removeprefix" => {
            let prefix = str_arg(&args, 0, "prefix", name)?;
            Value::str(text.strip_prefix(&*prefix).unwrap_or(text))
        }
        "removesuffix" => {
            let suffix = str_arg(&args, 0, "suffix", name)?;
            Value::str(text.strip_suffix(&*suffix).unwrap_or(text))
        }
        "center" | "ljust" | "rjust" => {
            let width = int_arg(&args, 0, "width", 0)?;
            let fill = fill_char(&args, name)?;
            let align = match name {
                "ljust" => '<',
                "rjust" => '>',
                _ => '^',
            };
            Value::str(pad_str(text, width, fill, align)?)
        }
        "zfill" => {
            let width = int_arg(&args, 0, "width", 0)?;
            let len = text.chars().count() as i64;
            if width <= len {
                Value::str(text)
            } else {
                ops::check_bytes(width as usize)?;
                let zeros = "0".repeat((width - len) as usize);
                let out = match text.chars().next() {
                    Some(sign @ ('+' | '-')) => format!("{sign}{zeros}{}", &text[1..]),
                    _ => format!("{zeros}{text}"),
                };
                Value::str(out)
            }
        }
        "partition" | "rpartition" => {
            let sep = str_arg(&args, 0, "sep", name)?;
            if sep.is_empty() {
                return Err(Exception::value_error("empty separator"));
            }
            let found = if name == "partition" {
                text.find(&*sep)
            } else {
                text.rfind(&*sep)
            };
            let parts = match found {
                Some(pos) => vec![
                    Value::str(&text[..pos]),
                    Value::Str(sep.clone()),
                    Value::str(&text[pos + sep.len()..]),
                ],
                None if name == "partition" => {
                    vec![Value::Str(s.clone()), Value::str(""), Value::str("")]
                }
                None => vec![Value::str(""), Value::str(""), Value::Str(s.clone())],
            };
            Value::tuple(parts)
        }
        "expandtabs" => {
            let size = int_arg(&args, 0, "tabsize", 8)?.max(0) as usize;
            let mut out = String::new();
            let mut column = 0;
            for c in text.chars() {
                match c {
                    '\t' if size > 0 => {
                        let spaces = size - column % size;
                        out.push_str(&" ".repeat(spaces));
                        column += spaces;
                    }
                    '\t' => {}
                    '\n' | '\r' => {
                        out.push(c);
                        column = 0;
                    }
                    c => {
                        out.push(c);
                        column += 1;
                    }
                }
            }
            Value::str(out)
        }
        "isdigit" | "isdecimal" => Value::Bool(!text.is_empty() && text.chars().all(|c| c.is_ascii_digit())),
        "isnumeric" => Value::Bool(!text.is_empty() && text.chars().all(char::is_numeric)),
        "isalpha" => Value::Bool(!text.is_empty() && text.chars().all(char::is_alphabetic)),
        "isalnum" => Value::Bool(!text.is_empty() && text.chars().all(char::is_alphanumeric)),
        "isspace" => Value::Bool(!text.is_empty() && text.chars().all(char::is_whitespace)),
        "isascii" => Value::Bool(text.is_ascii()),
        "islower" => Value::Bool(
            text.chars().any(char::is_lowercase) && !text.chars().any(char::is_uppercase),
        ),
        "isupper" => Value::Bool(
            text.chars().any(char::is_uppercase) && !text.chars().any(char::is_lowercase),
        ),
        "istitle" => Value::Bool(text.chars().any(char::is_alphabetic) && title_case(text) == text),
        "isidentifier" => Value::Bool(
            text.chars()
                .next()
                .is_some_and(|c| c.is_alphabetic() || c == '_')
                && text.chars().all(|c| c.is_alphanumeric() || c == '_'),
        ),
        _ => return Err(Exception::attribute_error("str", name)),
    };
    Ok(result)
}

// ----------------------------------------------------------------------
// list and tuple
// ----------------------------------------------------------------------

fn sequence_method(items: &[Value], type_name: &str, name: &str, args: Args) -> ExecResult<Value> {
    match name {
        "count" => {
            args.check("count", 1, 1)?;
            let needle = &args.positional[0];
            Ok(Value::Int(items.iter().filter(|v| py_eq(v, needle)).count() as i64))
        }
        "index" => {
            args.check("index", 1, 3)?;
            let needle = &args.positional[0];
            let (start, end) = window_args(&args, 1)?;
            let (lo, hi, _) = ops::slice_indices(items.len(), start, end, Some(1))?;
            (lo.max(0) as usize..hi.max(0) as usize)
                .find(|&i| py_eq(&items[i], needle))
                .map(|i| Value::Int(i as i64))
                .ok_or_else(|| {
                    Exception::value_error(format!(
                        "{} is not in {type_name}",
                        needle.repr()
                    ))
                })
        }
        _ => Err(Exception::attribute_error(type_name, name)),
    }
}

fn list_method(interp: &mut Interpreter, receiver: &Value, name: &str, args: Args) -> ExecResult<Value> {
    let Value::List(list) = receiver else {
        return Err(Exception::attribute_error(receiver.type_name(), name));
    };
    match name {
        "append" => {
            args.check("append", 1, 1)?;
            let mut items = list.lock();
            ops::check_len(items.len() + 1)?;
            items.push(args.positional[0].clone());
            Ok(Value::None)
        }
        "extend" => {
            args.check("extend", 1, 1)?;
            let extra = ops::collect(&args.positional[0])?;
            let mut items = list.lock();
            ops::check_len(items.len() + extra.len())?;
            items.extend(extra);
            Ok(Value::None)
        }
        "insert" => {
            args.check("insert", 2, 2)?;
            let index = int_arg(&args, 0, "index", 0)?;
            let mut items = list.lock();
            let len = items.len() as i64;
            let at = if index < 0 { (index + len).max(0) } else { index.min(len) };
            items.insert(at as usize, args.positional[1].clone());
            Ok(Value::None)
        }
        "remove" => {
            args.check("remove", 1, 1)?;
            let snapshot = list.lock().clone();
            let needle = &args.positional[0];
            match snapshot.iter().position(|v| py_eq(v, needle)) {
                Some(pos) => {
                    list.lock().remove(pos);
                    Ok(Value::None)
                }
                None => Err(Exception::value_error("list.remove(x): x not in list")),
            }
        }
        "pop" => {
            args.check("pop", 0, 1)?;
            let mut items = list.lock();
            if items.is_empty() {
                return Err(Exception::index_error("pop from empty list"));
            }
            let len = items.len() as i64;
            let index = int_arg(&args, 0, "index", -1)?;
            let at = if index < 0 { index + len } else { index };
            if at < 0 || at >= len {
                return Err(Exception::index_error("pop index out of range"));
            }
            Ok(items.remove(at as usize))
        }
        "clear" => {
            args.check("clear", 0, 0)?;
            list.lock().clear();
            Ok(Value::None)
        }
        "copy" => {
            args.check("copy", 0, 0)?;
            Ok(Value::list(list.lock().clone()))
        }
        "reverse" => {
            args.check("reverse", 0, 0)?;
            list.lock().reverse();
            Ok(Value::None)
        }
        "sort" => {
            args.check("sort", 0, 0)?;
            let key = args.kwarg("key").filter(|k| !k.is_none()).cloned();
            let reverse = args.kwarg("reverse").is_some_and(Value::truthy);
            let snapshot = list.lock().clone();
            let sorted = sort_values(interp, snapshot, key.as_ref(), reverse)?;
            *list.lock() = sorted;
            Ok(Value::None)
        }
        "index" | "count" => {
            let snapshot = list.lock().clone();
            sequence_method(&snapshot, "list", name, args)
        }
        _ => Err(Exception::attribute_error("list", name)),
    }
}

/// Stable sort with an optional key function; comparison errors surface.
pub fn sort_values(
    interp: &mut Interpreter,
    items: Vec<Value>,
    key: Option<&Value>,
    reverse: bool,
) -> ExecResult<Vec<Value>> {
    let mut keyed = Vec::with_capacity(items.len());
    for item in items {
        let k = match key {
            Some(func) => interp.call1(func, item.clone())?,
            None => item.clone(),
        };
        keyed.push((k, item));
    }
    let mut failure = None;
    keyed.sort_by(|(a, _), (b, _)| {
        if failure.is_some() {
            return Ordering::Equal;
        }
        let ordering = if reverse { py_cmp(b, a) } else { py_cmp(a, b) };
        ordering.unwrap_or_else(|err| {
            failure = Some(err);
            Ordering::Equal
        })
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(keyed.into_iter().map(|(_, v)| v).collect()),
    }
}

// ----------------------------------------------------------------------
// dict, Counter, OrderedDict
// ----------------------------------------------------------------------

fn counter_add(data: &mut DictData, key: Value, delta: i64) -> ExecResult<()> {
    let hash = key.hash_key()?;
    let current = data.get(&hash).and_then(|v| v.as_int()).unwrap_or(0);
    let next = current.checked_add(delta).ok_or_else(Exception::overflow)?;
    data.insert(key, Value::Int(next))
}

/// Pairs accepted by `dict.update` and the mapping constructors.
pub fn update_pairs(source: &Value) -> ExecResult<Vec<(Value, Value)>> {
    if let Value::Dict(_) = source {
        return ops::mapping_items(source);
    }
    let mut pairs = Vec::new();
    for (i, item) in ops::collect(source)?.into_iter().enumerate() {
        let pair = ops::collect(&item).map_err(|_| {
            Exception::type_error(format!(
                "cannot convert dictionary update sequence element #{i} to a sequence"
            ))
        })?;
        match <[Value; 2]>::try_from(pair) {
            Ok([k, v]) => pairs.push((k, v)),
            Err(pair) => {
                return Err(Exception::value_error(format!(
                    "dictionary update sequence element #{i} has length {}; 2 is required",
                    pair.len()
                )))
            }
        }
    }
    Ok(pairs)
}

/// Adds counts from an iterable of keys or a mapping of counts.
pub fn counter_update(data: &mut DictData, source: &Value, sign: i64) -> ExecResult<()> {
    match source {
        Value::Dict(_) => {
            for (k, v) in ops::mapping_items(source)? {
                let n = v.as_int().ok_or_else(|| {
                    Exception::type_error("Counter values must be integers")
                })?;
                counter_add(data, k, sign * n)?;
            }
        }
        other => {
            for key in ops::collect(other)? {
                counter_add(data, key, sign)?;
            }
        }
    }
    Ok(())
}

fn dict_method(receiver: &Value, name: &str, args: Args) -> ExecResult<Value> {
    let Value::Dict(dict) = receiver else {
        return Err(Exception::attribute_error(receiver.type_name(), name));
    };
    let (is_counter, is_ordered) = {
        let data = dict.lock();
        (
            matches!(data.flavor, DictFlavor::Counter),
            matches!(data.flavor, DictFlavor::Ordered),
        )
    };
    match name {
        "keys" => Ok(Value::list(dict.lock().keys())),
        "values" => Ok(Value::list(dict.lock().values())),
        "items" => Ok(Value::list(
            dict.lock()
                .items()
                .into_iter()
                .map(|(k, v)| Value::tuple(vec![k, v]))
                .collect(),
        )),
        "get" => {
            args.check("get", 1, 2)?;
            let key = args.positional[0].hash_key()?;
            let fallback = args.get(1).cloned().unwrap_or(Value::None);
            Ok(dict.lock().get(&key).unwrap_or(fallback))
        }
        "pop" => {
            args.check("pop", 1, 2)?;
            let key = args.positional[0].hash_key()?;
            match (dict.lock().remove(&key), args.get(1)) {
                (Some(value), _) => Ok(value),
                (None, Some(default)) => Ok(default.clone()),
                (None, None) => Err(Exception::key_error(args.positional[0].clone())),
            }
        }
        "popitem" => {
            args.check("popitem", 0, 0)?;
            let last = dict.lock().entries.pop();
            match last {
                Some((_, (k, v))) => Ok(Value::tuple(vec![k, v])),
                None => Err(Exception::key_error(Value::str(
                    "popitem(): dictionary is empty",
                ))),
            }
        }
        "setdefault" => {
            args.check("setdefault", 1, 2)?;
            let key = args.positional[0].hash_key()?;
            let mut data = dict.lock();
            if let Some(existing) = data.get(&key) {
                return Ok(existing);
            }
            let value = args.get(1).cloned().unwrap_or(Value::None);
            data.insert(args.positional[0].clone(), value.clone())?;
            Ok(value)
        }
        "update" => {
            args.check("update", 0, 1)?;
            if is_counter {
                let mut data = dict.lock().clone();
                if let Some(source) = args.get(0) {
                    counter_update(&mut data, source, 1)?;
                }
                for (k, v) in &args.kwargs {
                    let n = v.as_int().unwrap_or(0);
                    counter_add(&mut data, Value::str(k.as_str()), n)?;
                }
                *dict.lock() = data;
                return Ok(Value::None);
            }
            let pairs = match args.get(0) {
                Some(source) => update_pairs(source)?,
                None => Vec::new(),
            };
            let mut data = dict.lock();
            for (k, v) in pairs {
                data.insert(k, v)?;
            }
            for (k, v) in args.kwargs {
                data.insert_str(&k, v);
            }
            Ok(Value::None)
        }
        "clear" => {
            args.check("clear", 0, 0)?;
            dict.lock().entries.clear();
            Ok(Value::None)
        }
        "copy" => {
            args.check("copy", 0, 0)?;
            Ok(Value::dict(dict.lock().clone()))
        }
        "most_common" if is_counter => {
            args.check("most_common", 0, 1)?;
            let mut items = dict.lock().items();
            items.sort_by(|(_, a), (_, b)| {
                b.as_int().unwrap_or(0).cmp(&a.as_int().unwrap_or(0))
            });
            if let Some(n) = args.get(0).and_then(Value::as_int) {
                items.truncate(n.max(0) as usize);
            }
            Ok(Value::list(
                items
                    .into_iter()
                    .map(|(k, v)| Value::tuple(vec![k, v]))
                    .collect(),
            ))
        }
        "elements" if is_counter => {
            let mut out = Vec::new();
            for (k, v) in dict.lock().items() {
                let n = v.as_int().unwrap_or(0).max(0) as usize;
                ops::check_len(out.len() + n)?;
                out.extend(std::iter::repeat(k).take(n));
            }
            Ok(Value::list(out))
        }
        "total" if is_counter => {
            let mut total: i64 = 0;
            for value in dict.lock().values() {
                total = total
                    .checked_add(value.as_int().unwrap_or(0))
                    .ok_or_else(Exception::overflow)?;
            }
            Ok(Value::Int(total))
        }
        "subtract" if is_counter => {
            args.check("subtract", 0, 1)?;
            let mut data = dict.lock().clone();
            if let Some(source) = args.get(0) {
                counter_update(&mut data, source, -1)?;
            }
            *dict.lock() = data;
            Ok(Value::None)
        }
        "move_to_end" if is_ordered => {
            args.check("move_to_end", 1, 2)?;
            let last = args.arg(1, "last").map_or(true, |v| v.truthy());
            let key = args.positional[0].hash_key()?;
            let mut data = dict.lock();
            let Some(index) = data.entries.get_index_of(&key) else {
                return Err(Exception::key_error(args.positional[0].clone()));
            };
            let target = if last { data.entries.len() - 1 } else { 0 };
            data.entries.move_index(index, target);
            Ok(Value::None)
        }
        _ => Err(Exception::attribute_error(receiver.type_name(), name)),
    }
}

// ----------------------------------------------------------------------
// set
// ----------------------------------------------------------------------

fn as_set(value: &Value) -> ExecResult<SetData> {
    match value {
        Value::Set(s) => Ok(s.lock().clone()),
        other => {
            let mut data = SetData::default();
            for item in ops::collect(other)? {
                data.insert(item)?;
            }
            Ok(data)
        }
    }
}

fn set_method(receiver: &Value, name: &str, args: Args) -> ExecResult<Value> {
    let Value::Set(set) = receiver else {
        return Err(Exception::attribute_error(receiver.type_name(), name));
    };
    match name {
        "add" => {
            args.check("add", 1, 1)?;
            set.lock().insert(args.positional[0].clone())?;
            Ok(Value::None)
        }
        "remove" | "discard" => {
            args.check(name, 1, 1)?;
            let key = args.positional[0].hash_key()?;
            let removed = set.lock().items.shift_remove(&key).is_some();
            if !removed && name == "remove" {
                return Err(Exception::key_error(args.positional[0].clone()));
            }
            Ok(Value::None)
        }
        "pop" => {
            args.check("pop", 0, 0)?;
            let popped = set.lock().items.shift_remove_index(0);
            popped
                .map(|(_, v)| v)
                .ok_or_else(|| Exception::key_error(Value::str("pop from an empty set")))
        }
        "clear" => {
            set.lock().items.clear();
            Ok(Value::None)
        }
        "copy" => Ok(Value::set(set.lock().clone())),
        "union" | "intersection" | "difference" | "symmetric_difference" => {
            let mut current = set.lock().clone();
            for other in &args.positional {
                let other = as_set(other)?;
                current = combine(name, &current, &other);
            }
            Ok(Value::set(current))
        }
        "update" | "intersection_update" | "difference_update" => {
            let mut current = set.lock().clone();
            let op = match name {
                "update" => "union",
                "intersection_update" => "intersection",
                _ => "difference",
            };
            for other in &args.positional {
                let other = as_set(other)?;
                current = combine(op, &current, &other);
            }
            *set.lock() = current;
            Ok(Value::None)
        }
        "issubset" | "issuperset" | "isdisjoint" => {
            args.check(name, 1, 1)?;
            let other = as_set(&args.positional[0])?;
            let mine = set.lock().clone();
            let result = match name {
                "issubset" => mine.items.keys().all(|k| other.contains(k)),
                "issuperset" => other.items.keys().all(|k| mine.contains(k)),
                _ => !mine.items.keys().any(|k| other.contains(k)),
            };
            Ok(Value::Bool(result))
        }
        _ => Err(Exception::attribute_error("set", name)),
    }
}

fn combine(op: &str, a: &SetData, b: &SetData) -> SetData {
    let mut out = SetData::default();
    match op {
        "union" => {
            out.items = a.items.clone();
            for (k, v) in &b.items {
                out.items.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        "intersection" => {
            out.items = a
                .items
                .iter()
                .filter(|(k, _)| b.contains(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
        }
        "difference" => {
            out.items = a
                .items
                .iter()
                .filter(|(k, _)| !b.contains(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
        }
        _ => {
            for (k, v) in a.items.iter().chain(b.items.iter()) {
                if a.contains(k) != b.contains(k) {
                    out.items.insert(k.clone(), v.clone());
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(text: &str, name: &str, args: Vec<Value>) -> Value {
        str_method(&Arc::from(text), name, Args::new(args)).unwrap()
    }

    #[test]
    fn test_split_variants() {
        assert_eq!(s("  a  b c ", "split", vec![]).repr(), "['a', 'b', 'c']");
        assert_eq!(
            s("a b c", "split", vec![Value::None, Value::Int(1)]).repr(),
            "['a', 'b c']"
        );
        assert_eq!(s("a,,b", "split", vec![Value::str(",")]).repr(), "['a', '', 'b']");
        assert_eq!(
            s("a b c", "rsplit", vec![Value::None, Value::Int(1)]).repr(),
            "['a b', 'c']"
        );
        assert_eq!(s("x\r\ny\nz", "splitlines", vec![]).repr(), "['x', 'y', 'z']");
    }

    #[test]
    fn test_padding_past_string_cap_raises_memory_error() {
        for name in ["ljust", "rjust", "center", "zfill"] {
            let err = str_method(&Arc::from("ab"), name, Args::new(vec![Value::Int(i64::MAX)]))
                .unwrap_err();
            assert_eq!(err.kind(), ExcType::MemoryError, "{name}");
        }
        assert_eq!(s("ab", "center", vec![Value::Int(6), Value::str("*")]).repr(), "'**ab**'");
        assert_eq!(s("-7", "zfill", vec![Value::Int(4)]).repr(), "'-007'");
    }

    #[test]
    fn test_find_uses_char_offsets() {
        assert_eq!(s("héllo", "find", vec![Value::str("l")]).repr(), "2");
        assert_eq!(s("héllo", "rfind", vec![Value::str("l")]).repr(), "3");
        assert_eq!(s("abc", "find", vec![Value::str("z")]).repr(), "-1");
        let err = str_method(&Arc::from("abc"), "index", Args::new(vec![Value::str("z")]))
            .unwrap_err();
        assert_eq!(err.message(), "substring not found");
    }

    #[test]
    fn test_padding_and_case() {
        assert_eq!(s("ab", "center", vec![Value::Int(6), Value::str("*")]).repr(), "'**ab**'");
        assert_eq!(s("-42", "zfill", vec![Value::Int(6)]).repr(), "'-00042'");
        assert_eq!(s("hello world", "title", vec![]).repr(), "'Hello World'");
        assert_eq!(s("xxhixx", "strip", vec![Value::str("x")]).repr(), "'hi'");
    }

    #[test]
    fn test_join_rejects_non_strings() {
        let err = str_method(
            &Arc::from(","),
            "join",
            Args::new(vec![Value::list(vec![Value::str("a"), Value::Int(1)])]),
        )
        .unwrap_err();
        assert_eq!(err.message(), "sequence item 1: expected str instance, int found");
    }

    #[test]
    fn test_counter_most_common_is_stable() {
        let mut data = DictData::new(DictFlavor::Counter);
        counter_update(&mut data, &Value::str("abracadabra"), 1).unwrap();
        let counter = Value::dict(data);
        let top = dict_method(&counter, "most_common", Args::new(vec![Value::Int(3)])).unwrap();
        assert_eq!(top.repr(), "[('a', 5), ('b', 2), ('r', 2)]");
    }

    #[test]
    fn test_set_algebra_methods() {
        let mut data = SetData::default();
        for n in [1, 2, 3] {
            data.insert(Value::Int(n)).unwrap();
        }
        let set = Value::set(data);
        let other = Value::list(vec![Value::Int(2), Value::Int(4)]);
        let inter = set_method(&set, "intersection", Args::new(vec![other.clone()])).unwrap();
        assert_eq!(inter.repr(), "{2}");
        let sym = set_method(&set, "symmetric_difference", Args::new(vec![other])).unwrap();
        assert_eq!(sym.repr(), "{1, 3, 4}");
    }

    #[test]
    fn test_update_pairs_validates_length() {
        let bad = Value::list(vec![Value::tuple(vec![Value::Int(1)])]);
        let err = update_pairs(&bad).unwrap_err();
        assert!(err.message().contains("has length 1; 2 is required"));
    }
}
