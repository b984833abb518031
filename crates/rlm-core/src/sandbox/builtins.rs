//! The builtin allow-list bound into every sandbox namespace.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use indexmap::IndexMap;

use super::error::{ExcType, ExceptionValue, ExecResult, Exception};
use super::guards;
use super::interpreter::Interpreter;
use super::methods;
use super::ops;
use super::stdlib;
use super::value::{
    py_cmp, Args, Builtin, BuiltinFn, DictData, Native, RangeValue, SetData, TypeObj, Value,
};
use crate::termination;

const FUNCTIONS: &[(&str, BuiltinFn)] = &[
    ("len", builtin_len),
    ("abs", builtin_abs),
    ("all", builtin_all),
    ("any", builtin_any),
    ("min", builtin_min),
    ("max", builtin_max),
    ("sum", builtin_sum),
    ("round", builtin_round),
    ("pow", builtin_pow),
    ("divmod", builtin_divmod),
    ("isinstance", builtin_isinstance),
    ("issubclass", builtin_issubclass),
    ("callable", builtin_callable),
    ("hasattr", builtin_hasattr),
    ("getattr", builtin_getattr),
    ("setattr", builtin_setattr),
    ("delattr", builtin_delattr),
    ("dir", builtin_dir),
    ("id", builtin_id),
    ("hash", builtin_hash),
    ("hex", builtin_hex),
    ("oct", builtin_oct),
    ("bin", builtin_bin),
    ("ord", builtin_ord),
    ("chr", builtin_chr),
    ("ascii", builtin_ascii),
    ("repr", builtin_repr),
    ("print", builtin_print),
    ("open", builtin_open),
    ("sorted", builtin_sorted),
    ("reversed", builtin_reversed),
    ("enumerate", builtin_enumerate),
    ("zip", builtin_zip),
    ("map", builtin_map),
    ("filter", builtin_filter),
    ("slice", builtin_slice),
    ("type", builtin_type),
    ("FINAL", builtin_final),
    ("FINAL_VAR", builtin_final_var),
];

const CONSTRUCTORS: &[(&str, TypeObj)] = &[
    ("str", TypeObj::Str),
    ("int", TypeObj::Int),
    ("float", TypeObj::Float),
    ("bool", TypeObj::Bool),
    ("list", TypeObj::List),
    ("dict", TypeObj::Dict),
    ("tuple", TypeObj::Tuple),
    ("set", TypeObj::Set),
    ("frozenset", TypeObj::Set),
    ("range", TypeObj::Range),
];

/// Builds the builtins table shared by every namespace.
pub fn builtin_table() -> IndexMap<String, Value> {
    let mut table = IndexMap::new();
    for (name, func) in FUNCTIONS {
        table.insert(
            name.to_string(),
            Value::Builtin(Builtin { name, func: *func }),
        );
    }
    for (name, class) in CONSTRUCTORS {
        table.insert(name.to_string(), Value::Type(*class));
    }
    for kind in ExcType::EXPOSED {
        table.insert(kind.name().to_string(), Value::Type(TypeObj::Exception(*kind)));
    }
    table
}

fn one(args: &Args, name: &str) -> ExecResult<Value> {
    args.no_kwargs(name)?;
    args.check(name, 1, 1)?;
    Ok(args.positional[0].clone())
}

fn index_int(value: &Value) -> ExecResult<i64> {
    value.as_int().ok_or_else(|| {
        Exception::type_error(format!(
            "'{}' object cannot be interpreted as an integer",
            value.type_name()
        ))
    })
}

// ----------------------------------------------------------------------
// Constructors
// ----------------------------------------------------------------------

/// Calls a class object.
pub fn construct(interp: &mut Interpreter, class: TypeObj, args: Args) -> ExecResult<Value> {
    match class {
        TypeObj::Int => construct_int(&args),
        TypeObj::Float => {
            args.check("float", 0, 1)?;
            match args.get(0) {
                None => Ok(Value::Float(0.0)),
                Some(Value::Str(s)) => parse_float(s).map(Value::Float),
                Some(v) => v.as_float().map(Value::Float).ok_or_else(|| {
                    Exception::type_error(format!(
                        "float() argument must be a string or a real number, not '{}'",
                        v.type_name()
                    ))
                }),
            }
        }
        TypeObj::Str => {
            args.check("str", 0, 1)?;
            Ok(Value::str(args.get(0).map(Value::to_str).unwrap_or_default()))
        }
        TypeObj::Bool => {
            args.check("bool", 0, 1)?;
            Ok(Value::Bool(args.get(0).is_some_and(Value::truthy)))
        }
        TypeObj::List => {
            args.check("list", 0, 1)?;
            match args.get(0) {
                Some(v) => Ok(Value::list(ops::collect(v)?)),
                None => Ok(Value::list(Vec::new())),
            }
        }
        TypeObj::Tuple => {
            args.check("tuple", 0, 1)?;
            match args.get(0) {
                Some(v) => Ok(Value::tuple(ops::collect(v)?)),
                None => Ok(Value::tuple(Vec::new())),
            }
        }
        TypeObj::Set => {
            args.check("set", 0, 1)?;
            let mut data = SetData::default();
            if let Some(v) = args.get(0) {
                for item in ops::collect(v)? {
                    data.insert(item)?;
                }
            }
            Ok(Value::set(data))
        }
        TypeObj::Dict => {
            args.check("dict", 0, 1)?;
            let mut data = DictData::default();
            if let Some(source) = args.get(0) {
                for (k, v) in methods::update_pairs(source)? {
                    data.insert(k, v)?;
                }
            }
            for (k, v) in args.kwargs {
                data.insert_str(&k, v);
            }
            Ok(Value::dict(data))
        }
        TypeObj::Range => construct_range(&args),
        TypeObj::Exception(kind) => {
            args.no_kwargs(kind.name())?;
            Ok(Value::Exception(Arc::new(ExceptionValue {
                kind,
                args: args.positional,
            })))
        }
        TypeObj::Counter | TypeObj::DefaultDict | TypeObj::OrderedDict => {
            stdlib::collections::construct(interp, class, args)
        }
        TypeObj::DateTime | TypeObj::Date | TypeObj::TimeDelta | TypeObj::Path | TypeObj::StringIO => {
            stdlib::construct_native(interp, class, args)
        }
        TypeObj::NoneType | TypeObj::Object => Err(Exception::type_error(format!(
            "cannot create '{}' instances",
            class.name()
        ))),
    }
}

fn construct_int(args: &Args) -> ExecResult<Value> {
    args.check("int", 0, 2)?;
    let base = match args.arg(1, "base") {
        Some(b) => Some(index_int(&b)?),
        None => None,
    };
    match (args.get(0), base) {
        (None, _) => Ok(Value::Int(0)),
        (Some(Value::Str(s)), base) => parse_int(s, base.unwrap_or(10)).map(Value::Int),
        (Some(_), Some(_)) => Err(Exception::type_error(
            "int() can't convert non-string with explicit base",
        )),
        (Some(Value::Float(f)), None) => float_to_int(*f).map(Value::Int),
        (Some(v), None) => v.as_int().map(Value::Int).ok_or_else(|| {
            Exception::type_error(format!(
                "int() argument must be a string, a bytes-like object or a real number, not '{}'",
                v.type_name()
            ))
        }),
    }
}

pub(crate) fn float_to_int(f: f64) -> ExecResult<i64> {
    if f.is_nan() {
        return Err(Exception::value_error("cannot convert float NaN to integer"));
    }
    if f.is_infinite() || f.trunc().abs() >= 9.223_372_036_854_775_807e18 {
        return Err(Exception::new(
            ExcType::OverflowError,
            "cannot convert float infinity to integer",
        ));
    }
    Ok(f.trunc() as i64)
}

/// `int(text, base)` parsing with sign, underscores and base prefixes.
pub(crate) fn parse_int(text: &str, base: i64) -> ExecResult<i64> {
    let invalid = || {
        Exception::value_error(format!(
            "invalid literal for int() with base {base}: {}",
            super::value::str_repr(text)
        ))
    };
    if base != 0 && !(2..=36).contains(&base) {
        return Err(Exception::value_error("int() base must be >= 2 and <= 36, or 0"));
    }
    let trimmed = text.trim();
    let (negative, body) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let lower = body.to_ascii_lowercase();
    let prefixed = |p: &str| lower.starts_with(p);
    let (radix, digits) = match base {
        0 if prefixed("0x") => (16, &body[2..]),
        0 if prefixed("0o") => (8, &body[2..]),
        0 if prefixed("0b") => (2, &body[2..]),
        0 => (10, body),
        16 if prefixed("0x") => (16, &body[2..]),
        8 if prefixed("0o") => (8, &body[2..]),
        2 if prefixed("0b") => (2, &body[2..]),
        b => (b as u32, body),
    };
    let digits = digits.strip_prefix('_').unwrap_or(digits);
    if digits.is_empty()
        || digits.starts_with('_')
        || digits.ends_with('_')
        || digits.contains("__")
    {
        return Err(invalid());
    }
    let cleaned: String = digits.chars().filter(|c| *c != '_').collect();
    let magnitude = u64::from_str_radix(&cleaned, radix).map_err(|_| invalid())?;
    if negative {
        if magnitude == 1u64 << 63 {
            return Ok(i64::MIN);
        }
        i64::try_from(magnitude).map(|n| -n).map_err(|_| Exception::overflow())
    } else {
        i64::try_from(magnitude).map_err(|_| Exception::overflow())
    }
}

pub(crate) fn parse_float(text: &str) -> ExecResult<f64> {
    let trimmed = text.trim();
    let lower = trimmed.to_ascii_lowercase();
    let special = match lower.trim_start_matches(['+', '-']) {
        "inf" | "infinity" => Some(f64::INFINITY),
        "nan" => Some(f64::NAN),
        _ => None,
    };
    if let Some(value) = special {
        return Ok(if lower.starts_with('-') { -value } else { value });
    }
    let cleaned = if trimmed.contains('_') && !trimmed.contains("__") {
        trimmed.replace('_', "")
    } else {
        trimmed.to_string()
    };
    cleaned.parse::<f64>().map_err(|_| {
        Exception::value_error(format!(
            "could not convert string to float: {}",
            super::value::str_repr(text)
        ))
    })
}

fn construct_range(args: &Args) -> ExecResult<Value> {
    args.no_kwargs("range")?;
    args.check("range", 1, 3)?;
    let ints = args
        .positional
        .iter()
        .map(index_int)
        .collect::<ExecResult<Vec<_>>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => unreachable!("arity checked above"),
    };
    if step == 0 {
        return Err(Exception::value_error("range() arg 3 must not be zero"));
    }
    Ok(Value::Range(RangeValue { start, stop, step }))
}

// ----------------------------------------------------------------------
// Functions
// ----------------------------------------------------------------------

fn builtin_len(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let value = one(&args, "len")?;
    Ok(Value::Int(ops::len(&value)? as i64))
}

fn builtin_abs(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    match one(&args, "abs")? {
        Value::Float(f) => Ok(Value::Float(f.abs())),
        Value::Native(n) => match &*n {
            Native::TimeDelta(d) => {
                let d = if *d < chrono::Duration::zero() { -*d } else { *d };
                Ok(Value::native(Native::TimeDelta(d)))
            }
            _ => Err(Exception::type_error("bad operand type for abs(): 'object'")),
        },
        v => match v.as_int() {
            Some(n) => n.checked_abs().map(Value::Int).ok_or_else(Exception::overflow),
            None => Err(Exception::type_error(format!(
                "bad operand type for abs(): '{}'",
                v.type_name()
            ))),
        },
    }
}

fn builtin_all(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let iterable = one(&args, "all")?;
    Ok(Value::Bool(ops::value_iter(&iterable)?.all(|v| v.truthy())))
}

fn builtin_any(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let iterable = one(&args, "any")?;
    Ok(Value::Bool(ops::value_iter(&iterable)?.any(|v| v.truthy())))
}

fn extreme(interp: &mut Interpreter, args: Args, name: &str, want_max: bool) -> ExecResult<Value> {
    if args.positional.is_empty() {
        return Err(Exception::type_error(format!(
            "{name} expected at least 1 argument, got 0"
        )));
    }
    let items = if args.positional.len() == 1 {
        ops::collect(&args.positional[0])?
    } else {
        args.positional.clone()
    };
    let key = args.kwarg("key").filter(|k| !k.is_none()).cloned();
    let mut best: Option<(Value, Value)> = None;
    for item in items {
        let score = match &key {
            Some(func) => interp.call1(func, item.clone())?,
            None => item.clone(),
        };
        let replace = match &best {
            None => true,
            Some((best_score, _)) => {
                let ordering = py_cmp(&score, best_score)?;
                if want_max {
                    ordering == std::cmp::Ordering::Greater
                } else {
                    ordering == std::cmp::Ordering::Less
                }
            }
        };
        if replace {
            best = Some((score, item));
        }
    }
    match (best, args.kwarg("default")) {
        (Some((_, item)), _) => Ok(item),
        (None, Some(default)) => Ok(default.clone()),
        (None, None) => Err(Exception::value_error(format!(
            "{name}() arg is an empty sequence"
        ))),
    }
}

fn builtin_min(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    extreme(interp, args, "min", false)
}

fn builtin_max(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    extreme(interp, args, "max", true)
}

fn builtin_sum(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("sum", 1, 2)?;
    let mut total = args.arg(1, "start").unwrap_or(Value::Int(0));
    if matches!(total, Value::Str(_)) {
        return Err(Exception::type_error(
            "sum() can't sum strings [use ''.join(seq) instead]",
        ));
    }
    for item in ops::value_iter(&args.positional[0])? {
        interp.tick()?;
        total = ops::binary(super::ast::BinOp::Add, &total, &item)?;
    }
    Ok(total)
}

/// Rounds half to even at `digits` decimal places.
pub(crate) fn round_float(f: f64, digits: i64) -> f64 {
    if !f.is_finite() {
        return f;
    }
    if digits >= 0 {
        let digits = digits.min(300) as usize;
        format!("{f:.digits$}").parse().unwrap_or(f)
    } else {
        let scale = 10f64.powi((-digits).min(308) as i32);
        (f / scale).round_ties_even() * scale
    }
}

fn builtin_round(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("round", 1, 2)?;
    let digits = match args.arg(1, "ndigits") {
        None | Some(Value::None) => None,
        Some(d) => Some(index_int(&d)?),
    };
    match (&args.positional[0], digits) {
        (Value::Float(f), None) => float_to_int(f.round_ties_even()).map(Value::Int),
        (Value::Float(f), Some(d)) => Ok(Value::Float(round_float(*f, d))),
        (v, digits) => {
            let n = v.as_int().ok_or_else(|| {
                Exception::type_error(format!(
                    "type {} doesn't define __round__ method",
                    v.type_name()
                ))
            })?;
            match digits {
                Some(d) if d < 0 => {
                    let Some(scale) = 10i64.checked_pow((-d) as u32) else {
                        return Ok(Value::Int(0));
                    };
                    let q = n.div_euclid(scale);
                    let r = n.rem_euclid(scale);
                    let twice = r * 2;
                    let up = twice > scale || (twice == scale && q % 2 != 0);
                    let q = if up { q + 1 } else { q };
                    q.checked_mul(scale).map(Value::Int).ok_or_else(Exception::overflow)
                }
                _ => Ok(Value::Int(n)),
            }
        }
    }
}

fn builtin_pow(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("pow", 2, 3)?;
    let base = &args.positional[0];
    let exp = &args.positional[1];
    match args.get(2) {
        None | Some(Value::None) => ops::binary(super::ast::BinOp::Pow, base, exp),
        Some(modulus) => {
            let (b, e, m) = match (base.as_int(), exp.as_int(), modulus.as_int()) {
                (Some(b), Some(e), Some(m)) => (b, e, m),
                _ => {
                    return Err(Exception::type_error(
                        "pow() 3rd argument not allowed unless all arguments are integers",
                    ))
                }
            };
            if m == 0 {
                return Err(Exception::value_error("pow() 3rd argument cannot be 0"));
            }
            if e < 0 {
                return Err(Exception::value_error(
                    "pow() negative exponent with a modulus is not supported in the sandbox",
                ));
            }
            let m128 = m as i128;
            let mut result: i128 = 1;
            let mut acc = (b as i128).rem_euclid(m128);
            let mut e = e;
            while e > 0 {
                if e & 1 == 1 {
                    result = (result * acc).rem_euclid(m128);
                }
                acc = (acc * acc).rem_euclid(m128);
                e >>= 1;
            }
            let result = result.rem_euclid(m128);
            let result = if m < 0 && result != 0 { result + m128 } else { result };
            Ok(Value::Int(result as i64))
        }
    }
}

fn builtin_divmod(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("divmod", 2, 2)?;
    let (a, b) = (&args.positional[0], &args.positional[1]);
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        return Ok(Value::tuple(vec![
            Value::Int(ops::floor_div(x, y)?),
            Value::Int(ops::floor_mod(x, y)?),
        ]));
    }
    match (a.as_float(), b.as_float()) {
        (Some(_), Some(y)) if y == 0.0 => Err(Exception::zero_division("float divmod()")),
        (Some(x), Some(y)) => {
            let m = ops::float_mod(x, y);
            Ok(Value::tuple(vec![
                Value::Float(((x - m) / y).round()),
                Value::Float(m),
            ]))
        }
        _ => Err(Exception::type_error(format!(
            "unsupported operand type(s) for divmod(): '{}' and '{}'",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn class_targets(value: &Value, func: &str) -> ExecResult<Vec<TypeObj>> {
    match value {
        Value::Type(t) => Ok(vec![*t]),
        Value::Tuple(items) => {
            let mut out = Vec::new();
            for item in items.iter() {
                out.extend(class_targets(item, func)?);
            }
            Ok(out)
        }
        _ => Err(Exception::type_error(format!(
            "{func}() arg 2 must be a type, a tuple of types, or a union"
        ))),
    }
}

fn builtin_isinstance(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("isinstance", 2, 2)?;
    let targets = class_targets(&args.positional[1], "isinstance")?;
    Ok(Value::Bool(
        targets.iter().any(|t| t.matches(&args.positional[0])),
    ))
}

fn is_subclass(child: TypeObj, parent: TypeObj) -> bool {
    match (child, parent) {
        (a, b) if a == b => true,
        (_, TypeObj::Object) => true,
        (TypeObj::Bool, TypeObj::Int) => true,
        (TypeObj::Counter | TypeObj::DefaultDict | TypeObj::OrderedDict, TypeObj::Dict) => true,
        (TypeObj::DateTime, TypeObj::Date) => true,
        (TypeObj::Exception(a), TypeObj::Exception(b)) => a.is_subclass_of(b),
        _ => false,
    }
}

fn builtin_issubclass(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("issubclass", 2, 2)?;
    let Value::Type(child) = &args.positional[0] else {
        return Err(Exception::type_error("issubclass() arg 1 must be a class"));
    };
    let targets = class_targets(&args.positional[1], "issubclass")?;
    Ok(Value::Bool(targets.iter().any(|t| is_subclass(*child, *t))))
}

fn builtin_callable(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    Ok(Value::Bool(one(&args, "callable")?.is_callable()))
}

fn attr_name(value: &Value, func: &str) -> ExecResult<String> {
    value.as_str().map(str::to_string).ok_or_else(|| {
        Exception::type_error(format!("{func}(): attribute name must be string"))
    })
}

fn builtin_hasattr(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("hasattr", 2, 2)?;
    let name = attr_name(&args.positional[1], "hasattr")?;
    match guards::guarded_getattr(&args.positional[0], &name) {
        Ok(_) => Ok(Value::Bool(true)),
        Err(e) if e.kind() == ExcType::AttributeError => Ok(Value::Bool(false)),
        Err(e) => Err(e),
    }
}

fn builtin_getattr(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("getattr", 2, 3)?;
    let name = attr_name(&args.positional[1], "getattr")?;
    match guards::guarded_getattr(&args.positional[0], &name) {
        Err(e) if e.kind() == ExcType::AttributeError && args.len() == 3 => {
            Ok(args.positional[2].clone())
        }
        other => other,
    }
}

fn builtin_setattr(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("setattr", 3, 3)?;
    let name = attr_name(&args.positional[1], "setattr")?;
    guards::write_guard(&args.positional[0])?;
    methods::set_attribute(&args.positional[0], &name, args.positional[2].clone())?;
    Ok(Value::None)
}

fn builtin_delattr(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("delattr", 2, 2)?;
    let name = attr_name(&args.positional[1], "delattr")?;
    Err(Exception::attribute_error(args.positional[0].type_name(), &name))
}

fn builtin_dir(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("dir", 0, 1)?;
    let names = match args.get(0) {
        Some(obj) => methods::attribute_names(obj),
        None => {
            let ns = interp.namespace();
            let mut names: Vec<String> = ns
                .globals()
                .keys()
                .chain(ns.locals().keys())
                .cloned()
                .collect();
            names.sort();
            names.dedup();
            names
        }
    };
    Ok(Value::list(names.into_iter().map(Value::str).collect()))
}

fn identity(value: &Value) -> Option<usize> {
    let addr = match value {
        Value::List(x) => Arc::as_ptr(x) as *const () as usize,
        Value::Dict(x) => Arc::as_ptr(x) as *const () as usize,
        Value::Set(x) => Arc::as_ptr(x) as *const () as usize,
        Value::Tuple(x) => Arc::as_ptr(x) as *const () as usize,
        Value::Function(x) => Arc::as_ptr(x) as *const () as usize,
        Value::Method(x) => Arc::as_ptr(x) as *const () as usize,
        Value::Exception(x) => Arc::as_ptr(x) as *const () as usize,
        Value::Module(x) => Arc::as_ptr(x) as *const () as usize,
        Value::Native(x) => Arc::as_ptr(x) as *const () as usize,
        _ => return None,
    };
    Some(addr)
}

fn builtin_id(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let value = one(&args, "id")?;
    if let Some(addr) = identity(&value) {
        return Ok(Value::Int(addr as i64));
    }
    let mut hasher = DefaultHasher::new();
    value.type_name().hash(&mut hasher);
    value.repr().hash(&mut hasher);
    Ok(Value::Int((hasher.finish() >> 1) as i64))
}

fn builtin_hash(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let value = one(&args, "hash")?;
    let key = value.hash_key()?;
    if let super::value::HashKey::Int(n) = key {
        return Ok(Value::Int(n));
    }
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    Ok(Value::Int(hasher.finish() as i64))
}

fn radix_text(args: &Args, name: &str, prefix: &str, radix: u32) -> ExecResult<Value> {
    let n = index_int(&one(args, name)?)?;
    let magnitude = n.unsigned_abs();
    let digits = match radix {
        16 => format!("{magnitude:x}"),
        8 => format!("{magnitude:o}"),
        _ => format!("{magnitude:b}"),
    };
    let sign = if n < 0 { "-" } else { "" };
    Ok(Value::str(format!("{sign}{prefix}{digits}")))
}

fn builtin_hex(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    radix_text(&args, "hex", "0x", 16)
}

fn builtin_oct(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    radix_text(&args, "oct", "0o", 8)
}

fn builtin_bin(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    radix_text(&args, "bin", "0b", 2)
}

fn builtin_ord(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    match one(&args, "ord")? {
        Value::Str(s) => {
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(Value::Int(c as i64)),
                _ => Err(Exception::type_error(format!(
                    "ord() expected a character, but string of length {} found",
                    s.chars().count()
                ))),
            }
        }
        other => Err(Exception::type_error(format!(
            "ord() expected string of length 1, but {} found",
            other.type_name()
        ))),
    }
}

fn builtin_chr(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let n = index_int(&one(&args, "chr")?)?;
    u32::try_from(n)
        .ok()
        .and_then(char::from_u32)
        .map(|c| Value::str(c.to_string()))
        .ok_or_else(|| Exception::value_error("chr() arg not in range(0x110000)"))
}

/// Escapes every non-ASCII character the way `ascii()` does.
pub fn ascii_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        let code = c as u32;
        if code < 0x80 {
            out.push(c);
        } else if code <= 0xff {
            out.push_str(&format!("\\x{code:02x}"));
        } else if code <= 0xffff {
            out.push_str(&format!("\\u{code:04x}"));
        } else {
            out.push_str(&format!("\\U{code:08x}"));
        }
    }
    out
}

fn builtin_ascii(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    Ok(Value::str(ascii_escape(&one(&args, "ascii")?.repr())))
}

fn builtin_repr(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    Ok(Value::str(one(&args, "repr")?.repr()))
}

fn builtin_print(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    guards::print(interp, args)
}

fn builtin_open(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    stdlib::io::open(interp, args)
}

fn builtin_sorted(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("sorted", 1, 1)?;
    let items = ops::collect(&args.positional[0])?;
    let key = args.kwarg("key").filter(|k| !k.is_none()).cloned();
    let reverse = args.kwarg("reverse").is_some_and(Value::truthy);
    let sorted = methods::sort_values(interp, items, key.as_ref(), reverse)?;
    Ok(Value::list(sorted))
}

fn builtin_reversed(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let value = one(&args, "reversed")?;
    match value {
        Value::Set(_) => Err(Exception::type_error("'set' object is not reversible")),
        other => {
            let mut items = ops::collect(&other)?;
            items.reverse();
            Ok(Value::list(items))
        }
    }
}

fn builtin_enumerate(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("enumerate", 1, 2)?;
    let start = match args.arg(1, "start") {
        Some(v) => index_int(&v)?,
        None => 0,
    };
    let items = ops::collect(&args.positional[0])?;
    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.into_iter().enumerate() {
        let index = start.checked_add(i as i64).ok_or_else(Exception::overflow)?;
        out.push(Value::tuple(vec![Value::Int(index), item]));
    }
    Ok(Value::list(out))
}

fn builtin_zip(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let strict = args.kwarg("strict").is_some_and(Value::truthy);
    let columns = args
        .positional
        .iter()
        .map(ops::collect)
        .collect::<ExecResult<Vec<_>>>()?;
    let shortest = columns.iter().map(Vec::len).min().unwrap_or(0);
    if strict {
        if let Some((i, _)) = columns
            .iter()
            .enumerate()
            .find(|(_, c)| c.len() != columns[0].len())
        {
            let relation = if columns[i].len() < columns[0].len() {
                "shorter"
            } else {
                "longer"
            };
            return Err(Exception::value_error(format!(
                "zip() argument {} is {relation} than argument 1",
                i + 1
            )));
        }
    }
    let rows = (0..shortest)
        .map(|row| Value::tuple(columns.iter().map(|c| c[row].clone()).collect()))
        .collect();
    Ok(Value::list(rows))
}

fn builtin_map(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.no_kwargs("map")?;
    if args.len() < 2 {
        return Err(Exception::type_error("map() must have at least two arguments."));
    }
    let func = args.positional[0].clone();
    let columns = args.positional[1..]
        .iter()
        .map(ops::collect)
        .collect::<ExecResult<Vec<_>>>()?;
    let shortest = columns.iter().map(Vec::len).min().unwrap_or(0);
    let mut out = Vec::with_capacity(shortest);
    for row in 0..shortest {
        let call_args = Args::new(columns.iter().map(|c| c[row].clone()).collect());
        out.push(interp.call(&func, call_args)?);
    }
    Ok(Value::list(out))
}

fn builtin_filter(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.no_kwargs("filter")?;
    args.check("filter", 2, 2)?;
    let func = args.positional[0].clone();
    let mut out = Vec::new();
    for item in ops::value_iter(&args.positional[1])? {
        let keep = if func.is_none() {
            item.truthy()
        } else {
            interp.call1(&func, item.clone())?.truthy()
        };
        if keep {
            out.push(item);
        }
    }
    Ok(Value::list(out))
}

fn builtin_slice(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("slice", 1, 3)?;
    let bound = |v: &Value| -> ExecResult<Option<i64>> {
        match v {
            Value::None => Ok(None),
            other => index_int(other).map(Some),
        }
    };
    let parts = args
        .positional
        .iter()
        .map(bound)
        .collect::<ExecResult<Vec<_>>>()?;
    Ok(match parts.as_slice() {
        [stop] => Value::Slice(None, *stop, None),
        [start, stop] => Value::Slice(*start, *stop, None),
        [start, stop, step] => Value::Slice(*start, *stop, *step),
        _ => unreachable!("arity checked above"),
    })
}

/// The class object of `value`, when it has one the sandbox can name.
pub fn type_of(value: &Value) -> TypeObj {
    match value {
        Value::None => TypeObj::NoneType,
        Value::Bool(_) => TypeObj::Bool,
        Value::Int(_) => TypeObj::Int,
        Value::Float(_) => TypeObj::Float,
        Value::Str(_) => TypeObj::Str,
        Value::List(_) => TypeObj::List,
        Value::Tuple(_) => TypeObj::Tuple,
        Value::Set(_) => TypeObj::Set,
        Value::Range(_) => TypeObj::Range,
        Value::Dict(_) => [TypeObj::Counter, TypeObj::DefaultDict, TypeObj::OrderedDict]
            .into_iter()
            .find(|t| t.matches(value))
            .unwrap_or(TypeObj::Dict),
        Value::Exception(e) => TypeObj::Exception(e.kind),
        Value::Native(n) => match &**n {
            Native::DateTime(_) => TypeObj::DateTime,
            Native::Date(_) => TypeObj::Date,
            Native::TimeDelta(_) => TypeObj::TimeDelta,
            Native::Path(_) => TypeObj::Path,
            Native::StringIO(_) => TypeObj::StringIO,
            _ => TypeObj::Object,
        },
        _ => TypeObj::Object,
    }
}

fn builtin_type(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let value = one(&args, "type")?;
    Ok(Value::Type(type_of(&value)))
}

/// `FINAL(answer)`: returns the termination marker for `str(answer)`.
fn builtin_final(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let answer = one(&args, "FINAL")?;
    Ok(Value::str(termination::literal_marker(&answer.to_str())))
}

/// `FINAL_VAR("name")` names a variable; any other value is treated as the
/// answer itself.
fn builtin_final_var(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let target = one(&args, "FINAL_VAR")?;
    if let Value::Str(name) = &target {
        if termination::is_identifier(name) && interp.lookup(name).is_some() {
            return Ok(Value::str(termination::variable_marker(name)));
        }
    }
    Ok(Value::str(termination::literal_marker(&target.to_str())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_int_forms() {
        assert_eq!(parse_int(" 42 ", 10).unwrap(), 42);
        assert_eq!(parse_int("-1_000", 10).unwrap(), -1000);
        assert_eq!(parse_int("0x1f", 16).unwrap(), 31);
        assert_eq!(parse_int("0b101", 0).unwrap(), 5);
        assert_eq!(parse_int("ff", 16).unwrap(), 255);
        let err = parse_int("abc", 10).unwrap_err();
        assert_eq!(err.message(), "invalid literal for int() with base 10: 'abc'");
    }

    #[test]
    fn test_parse_float_specials() {
        assert_eq!(parse_float(" 2.5 ").unwrap(), 2.5);
        assert!(parse_float("-inf").unwrap().is_infinite());
        assert!(parse_float("nan").unwrap().is_nan());
        assert!(parse_float("x1").is_err());
    }

    #[test]
    fn test_round_half_even() {
        assert_eq!(round_float(2.675, 2), 2.67);
        assert_eq!(round_float(1234.0, -2), 1200.0);
        assert_eq!(2.5f64.round_ties_even(), 2.0);
    }

    #[test]
    fn test_float_to_int_rejects_nan_and_inf() {
        assert_eq!(float_to_int(3.9).unwrap(), 3);
        assert_eq!(float_to_int(-3.9).unwrap(), -3);
        assert_eq!(float_to_int(f64::NAN).unwrap_err().kind(), ExcType::ValueError);
        assert_eq!(
            float_to_int(f64::INFINITY).unwrap_err().kind(),
            ExcType::OverflowError
        );
    }

    #[test]
    fn test_ascii_escape() {
        assert_eq!(ascii_escape("'é'"), "'\\xe9'");
        assert_eq!(ascii_escape("→"), "\\u2192");
    }

    #[test]
    fn test_table_exposes_exceptions_and_markers() {
        let table = builtin_table();
        assert!(matches!(
            table.get("KeyError"),
            Some(Value::Type(TypeObj::Exception(ExcType::KeyError)))
        ));
        assert!(table.contains_key("FINAL"));
        assert!(table.contains_key("FINAL_VAR"));
        assert!(!table.contains_key("eval"));
        assert!(!table.contains_key("exec"));
    }

    #[test]
    fn test_subclass_relations() {
        assert!(is_subclass(TypeObj::Bool, TypeObj::Int));
        assert!(is_subclass(
            TypeObj::Exception(ExcType::KeyError),
            TypeObj::Exception(ExcType::LookupError)
        ));
        assert!(!is_subclass(TypeObj::Int, TypeObj::Bool));
    }
}
