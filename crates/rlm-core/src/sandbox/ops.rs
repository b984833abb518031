//! Operators, subscripting and iteration over sandbox values.

use std::cmp::Ordering;
use std::sync::Arc;

use super::ast::{BinOp, CmpOp, UnaryOp};
use super::error::{ExcType, ExecResult, Exception};
use super::format;
use super::interpreter::Interpreter;
use super::stdlib;
use super::value::{py_eq, py_partial_cmp, Args, DictData, DictFlavor, Native, RangeValue, SetData, Value};

/// Largest container a single operation may materialize.
pub const MAX_SEQUENCE_LEN: usize = 10_000_000;
/// Largest string a single operation may build.
pub const MAX_STRING_BYTES: usize = 64 * 1024 * 1024;

pub fn check_len(len: usize) -> ExecResult<()> {
    if len > MAX_SEQUENCE_LEN {
        return Err(Exception::new(
            ExcType::MemoryError,
            format!("sequence of {len} items exceeds the sandbox limit"),
        ));
    }
    Ok(())
}

pub(crate) fn check_bytes(len: usize) -> ExecResult<()> {
    if len > MAX_STRING_BYTES {
        return Err(Exception::new(
            ExcType::MemoryError,
            "string result exceeds the sandbox limit",
        ));
    }
    Ok(())
}

fn unsupported(op: &str, a: &Value, b: &Value) -> Exception {
    Exception::type_error(format!(
        "unsupported operand type(s) for {op}: '{}' and '{}'",
        a.type_name(),
        b.type_name()
    ))
}

// ----------------------------------------------------------------------
// Binary and unary operators
// ----------------------------------------------------------------------

pub fn binary(op: BinOp, a: &Value, b: &Value) -> ExecResult<Value> {
    if let (Some(x), Some(y)) = (int_operand(a), int_operand(b)) {
        if let (Value::Bool(p), Value::Bool(q)) = (a, b) {
            match op {
                BinOp::BitAnd => return Ok(Value::Bool(*p & *q)),
                BinOp::BitOr => return Ok(Value::Bool(*p | *q)),
                BinOp::BitXor => return Ok(Value::Bool(*p ^ *q)),
                _ => {}
            }
        }
        return int_binary(op, x, y);
    }
    if is_number(a) && is_number(b) {
        let (x, y) = (a.as_float().unwrap_or(0.0), b.as_float().unwrap_or(0.0));
        return float_binary(op, x, y, a, b);
    }
    match (op, a, b) {
        (BinOp::Add, Value::Str(x), Value::Str(y)) => {
            check_bytes(x.len() + y.len())?;
            let mut out = String::with_capacity(x.len() + y.len());
            out.push_str(x);
            out.push_str(y);
            Ok(Value::str(out))
        }
        (BinOp::Add, Value::Str(_), other) => Err(Exception::type_error(format!(
            "can only concatenate str (not \"{}\") to str",
            other.type_name()
        ))),
        (BinOp::Mul, Value::Str(s), n) | (BinOp::Mul, n, Value::Str(s)) if int_operand(n).is_some() => {
            let times = int_operand(n).unwrap_or(0).max(0) as usize;
            check_bytes(s.len().saturating_mul(times))?;
            Ok(Value::str(s.repeat(times)))
        }
        (BinOp::Mod, Value::Str(s), args) => Ok(Value::str(format::percent_format(s, args)?)),
        (BinOp::Add, Value::List(x), Value::List(y)) => {
            let mut out = x.lock().clone();
            out.extend(y.lock().iter().cloned());
            check_len(out.len())?;
            Ok(Value::list(out))
        }
        (BinOp::Add, Value::List(_), other) => Err(Exception::type_error(format!(
            "can only concatenate list (not \"{}\") to list",
            other.type_name()
        ))),
        (BinOp::Add, Value::Tuple(x), Value::Tuple(y)) => {
            let mut out = x.to_vec();
            out.extend(y.iter().cloned());
            check_len(out.len())?;
            Ok(Value::tuple(out))
        }
        (BinOp::Mul, Value::List(l), n) | (BinOp::Mul, n, Value::List(l)) if int_operand(n).is_some() => {
            let items = l.lock().clone();
            Ok(Value::list(repeat(&items, int_operand(n).unwrap_or(0))?))
        }
        (BinOp::Mul, Value::Tuple(t), n) | (BinOp::Mul, n, Value::Tuple(t)) if int_operand(n).is_some() => {
            Ok(Value::tuple(repeat(t, int_operand(n).unwrap_or(0))?))
        }
        (_, Value::Set(x), Value::Set(y)) => {
            let (x, y) = (x.lock().clone(), y.lock().clone());
            set_binary(op, &x, &y).ok_or_else(|| unsupported(op.symbol(), a, b))
        }
        (BinOp::BitOr, Value::Dict(x), Value::Dict(y)) => {
            let mut out = x.lock().clone();
            for (k, v) in y.lock().items() {
                out.insert(k, v)?;
            }
            Ok(Value::dict(out))
        }
        (BinOp::Add | BinOp::Sub, Value::Dict(x), Value::Dict(y))
            if counter_flavor(a) && counter_flavor(b) =>
        {
            let (x, y) = (x.lock().clone(), y.lock().clone());
            counter_binary(op, &x, &y)
        }
        (_, Value::Native(_), _) | (_, _, Value::Native(_)) => native_binary(op, a, b),
        _ => Err(unsupported(op.symbol(), a, b)),
    }
}

fn int_operand(value: &Value) -> Option<i64> {
    match value {
        Value::Int(n) => Some(*n),
        Value::Bool(b) => Some(*b as i64),
        _ => None,
    }
}

fn is_number(value: &Value) -> bool {
    matches!(value, Value::Int(_) | Value::Bool(_) | Value::Float(_))
}

fn counter_flavor(value: &Value) -> bool {
    matches!(value, Value::Dict(d) if matches!(d.lock().flavor, DictFlavor::Counter))
}

fn repeat(items: &[Value], times: i64) -> ExecResult<Vec<Value>> {
    let times = times.max(0) as usize;
    check_len(items.len().saturating_mul(times))?;
    let mut out = Vec::with_capacity(items.len() * times);
    for _ in 0..times {
        out.extend(items.iter().cloned());
    }
    Ok(out)
}

/// Floor division with the sign of the divisor.
pub fn floor_div(x: i64, y: i64) -> ExecResult<i64> {
    if y == 0 {
        return Err(Exception::zero_division("integer division or modulo by zero"));
    }
    let q = x.checked_div(y).ok_or_else(Exception::overflow)?;
    if x % y != 0 && ((x < 0) != (y < 0)) {
        Ok(q - 1)
    } else {
        Ok(q)
    }
}

/// Modulo with the sign of the divisor.
pub fn floor_mod(x: i64, y: i64) -> ExecResult<i64> {
    if y == 0 {
        return Err(Exception::zero_division("integer modulo by zero"));
    }
    let r = x.checked_rem(y).unwrap_or(0);
    if r != 0 && ((r < 0) != (y < 0)) {
        Ok(r + y)
    } else {
        Ok(r)
    }
}

pub fn float_mod(x: f64, y: f64) -> f64 {
    let r = x % y;
    if r != 0.0 && ((r < 0.0) != (y < 0.0)) {
        r + y
    } else {
        r
    }
}

fn int_binary(op: BinOp, x: i64, y: i64) -> ExecResult<Value> {
    let overflow = Exception::overflow;
    let value = match op {
        BinOp::Add => x.checked_add(y).ok_or_else(overflow)?,
        BinOp::Sub => x.checked_sub(y).ok_or_else(overflow)?,
        BinOp::Mul => x.checked_mul(y).ok_or_else(overflow)?,
        BinOp::Div => {
            if y == 0 {
                return Err(Exception::zero_division("division by zero"));
            }
            return Ok(Value::Float(x as f64 / y as f64));
        }
        BinOp::FloorDiv => floor_div(x, y)?,
        BinOp::Mod => floor_mod(x, y)?,
        BinOp::Pow => {
            if y < 0 {
                if x == 0 {
                    return Err(Exception::zero_division(
                        "0.0 cannot be raised to a negative power",
                    ));
                }
                return Ok(Value::Float((x as f64).powf(y as f64)));
            }
            let exp = u32::try_from(y).map_err(|_| overflow())?;
            x.checked_pow(exp).ok_or_else(overflow)?
        }
        BinOp::BitAnd => x & y,
        BinOp::BitOr => x | y,
        BinOp::BitXor => x ^ y,
        BinOp::LShift => {
            if y < 0 {
                return Err(Exception::value_error("negative shift count"));
            }
            if x == 0 {
                0
            } else {
                let shift = u32::try_from(y).map_err(|_| overflow())?;
                let shifted = x.checked_shl(shift).ok_or_else(overflow)?;
                if shifted >> shift != x {
                    return Err(overflow());
                }
                shifted
            }
        }
        BinOp::RShift => {
            if y < 0 {
                return Err(Exception::value_error("negative shift count"));
            }
            x >> y.min(63)
        }
        BinOp::MatMul => {
            return Err(unsupported("@", &Value::Int(x), &Value::Int(y)));
        }
    };
    Ok(Value::Int(value))
}

fn float_binary(op: BinOp, x: f64, y: f64, a: &Value, b: &Value) -> ExecResult<Value> {
    let value = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => {
            if y == 0.0 {
                return Err(Exception::zero_division("float division by zero"));
            }
            x / y
        }
        BinOp::FloorDiv => {
            if y == 0.0 {
                return Err(Exception::zero_division("float floor division by zero"));
            }
            (x / y).floor()
        }
        BinOp::Mod => {
            if y == 0.0 {
                return Err(Exception::zero_division("float modulo"));
            }
            float_mod(x, y)
        }
        BinOp::Pow => {
            if x == 0.0 && y < 0.0 {
                return Err(Exception::zero_division(
                    "0.0 cannot be raised to a negative power",
                ));
            }
            if x < 0.0 && y.fract() != 0.0 {
                return Err(Exception::value_error("math domain error"));
            }
            let result = x.powf(y);
            if result.is_infinite() && x.is_finite() && y.is_finite() {
                return Err(Exception::new(
                    ExcType::OverflowError,
                    "(34, 'Numerical result out of range')",
                ));
            }
            result
        }
        _ => return Err(unsupported(op.symbol(), a, b)),
    };
    Ok(Value::Float(value))
}

fn set_binary(op: BinOp, x: &SetData, y: &SetData) -> Option<Value> {
    let mut out = SetData::default();
    match op {
        BinOp::BitOr => {
            out.items = x.items.clone();
            for (k, v) in &y.items {
                out.items.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        BinOp::BitAnd => {
            for (k, v) in &x.items {
                if y.items.contains_key(k) {
                    out.items.insert(k.clone(), v.clone());
                }
            }
        }
        BinOp::Sub => {
            for (k, v) in &x.items {
                if !y.items.contains_key(k) {
                    out.items.insert(k.clone(), v.clone());
                }
            }
        }
        BinOp::BitXor => {
            for (k, v) in x.items.iter().chain(y.items.iter()) {
                if x.items.contains_key(k) != y.items.contains_key(k) {
                    out.items.insert(k.clone(), v.clone());
                }
            }
        }
        _ => return None,
    }
    Some(Value::set(out))
}

fn counter_binary(op: BinOp, x: &DictData, y: &DictData) -> ExecResult<Value> {
    let mut out = DictData::new(DictFlavor::Counter);
    let mut keys = x.keys();
    for key in y.keys() {
        let hash = key.hash_key()?;
        if !x.entries.contains_key(&hash) {
            keys.push(key);
        }
    }
    for key in keys {
        let hash = key.hash_key()?;
        let left = x.get(&hash).and_then(|v| v.as_int()).unwrap_or(0);
        let right = y.get(&hash).and_then(|v| v.as_int()).unwrap_or(0);
        let total = match op {
            BinOp::Add => left.checked_add(right),
            _ => left.checked_sub(right),
        }
        .ok_or_else(Exception::overflow)?;
        if total > 0 {
            out.insert(key, Value::Int(total))?;
        }
    }
    Ok(Value::dict(out))
}

fn native_binary(op: BinOp, a: &Value, b: &Value) -> ExecResult<Value> {
    use chrono::Duration;
    let out_of_range = || Exception::new(ExcType::OverflowError, "date value out of range");
    let native = |v: &Value| match v {
        Value::Native(n) => Some(n.clone()),
        _ => None,
    };
    let (na, nb) = (native(a), native(b));
    let result = match (op, na.as_deref(), nb.as_deref()) {
        (BinOp::Add, Some(Native::DateTime(dt)), Some(Native::TimeDelta(td)))
        | (BinOp::Add, Some(Native::TimeDelta(td)), Some(Native::DateTime(dt))) => {
            Native::DateTime(dt.checked_add_signed(*td).ok_or_else(out_of_range)?)
        }
        (BinOp::Sub, Some(Native::DateTime(dt)), Some(Native::TimeDelta(td))) => {
            Native::DateTime(dt.checked_sub_signed(*td).ok_or_else(out_of_range)?)
        }
        (BinOp::Sub, Some(Native::DateTime(x)), Some(Native::DateTime(y))) => {
            Native::TimeDelta(x.signed_duration_since(*y))
        }
        (BinOp::Add, Some(Native::Date(d)), Some(Native::TimeDelta(td)))
        | (BinOp::Add, Some(Native::TimeDelta(td)), Some(Native::Date(d))) => {
            Native::Date(d.checked_add_signed(whole_days(td)).ok_or_else(out_of_range)?)
        }
        (BinOp::Sub, Some(Native::Date(d)), Some(Native::TimeDelta(td))) => {
            Native::Date(d.checked_sub_signed(whole_days(td)).ok_or_else(out_of_range)?)
        }
        (BinOp::Sub, Some(Native::Date(x)), Some(Native::Date(y))) => {
            Native::TimeDelta(x.signed_duration_since(*y))
        }
        (BinOp::Add, Some(Native::TimeDelta(x)), Some(Native::TimeDelta(y))) => {
            Native::TimeDelta(x.checked_add(y).ok_or_else(out_of_range)?)
        }
        (BinOp::Sub, Some(Native::TimeDelta(x)), Some(Native::TimeDelta(y))) => {
            Native::TimeDelta(x.checked_sub(y).ok_or_else(out_of_range)?)
        }
        (BinOp::Div, Some(Native::TimeDelta(x)), Some(Native::TimeDelta(y))) => {
            let divisor = micros(y);
            if divisor == 0 {
                return Err(Exception::zero_division("division by zero"));
            }
            return Ok(Value::Float(micros(x) as f64 / divisor as f64));
        }
        (BinOp::Mul | BinOp::Div, Some(Native::TimeDelta(td)), None)
        | (BinOp::Mul, None, Some(Native::TimeDelta(td))) => {
            let factor = if na.is_some() { b } else { a };
            let factor = factor
                .as_float()
                .ok_or_else(|| unsupported(op.symbol(), a, b))?;
            let scaled = if op == BinOp::Mul {
                micros(td) as f64 * factor
            } else {
                if factor == 0.0 {
                    return Err(Exception::zero_division("division by zero"));
                }
                micros(td) as f64 / factor
            };
            if !scaled.is_finite() || scaled.abs() > i64::MAX as f64 {
                return Err(out_of_range());
            }
            Native::TimeDelta(Duration::microseconds(scaled.round() as i64))
        }
        (BinOp::Div, Some(Native::Path(p)), None) => match b {
            Value::Str(s) => Native::Path(p.join(&**s)),
            _ => return Err(unsupported("/", a, b)),
        },
        (BinOp::Div, Some(Native::Path(p)), Some(Native::Path(q))) => Native::Path(p.join(q)),
        _ => return Err(unsupported(op.symbol(), a, b)),
    };
    Ok(Value::native(result))
}

fn micros(td: &chrono::Duration) -> i64 {
    td.num_microseconds().unwrap_or(i64::MAX)
}

fn whole_days(td: &chrono::Duration) -> chrono::Duration {
    chrono::Duration::days(td.num_days())
}

pub fn unary(op: UnaryOp, value: &Value) -> ExecResult<Value> {
    let bad = || {
        let symbol = match op {
            UnaryOp::Neg => "-",
            UnaryOp::Pos => "+",
            UnaryOp::Invert => "~",
            UnaryOp::Not => "not",
        };
        Exception::type_error(format!(
            "bad operand type for unary {symbol}: '{}'",
            value.type_name()
        ))
    };
    match (op, value) {
        (UnaryOp::Not, v) => Ok(Value::Bool(!v.truthy())),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Pos, Value::Float(f)) => Ok(Value::Float(*f)),
        (UnaryOp::Neg, v) if int_operand(v).is_some() => int_operand(v)
            .and_then(i64::checked_neg)
            .map(Value::Int)
            .ok_or_else(Exception::overflow),
        (UnaryOp::Pos, v) if int_operand(v).is_some() => Ok(Value::Int(int_operand(v).unwrap_or(0))),
        (UnaryOp::Invert, v) if int_operand(v).is_some() => Ok(Value::Int(!int_operand(v).unwrap_or(0))),
        (UnaryOp::Neg, Value::Native(n)) => match &**n {
            Native::TimeDelta(td) => Ok(Value::native(Native::TimeDelta(-*td))),
            _ => Err(bad()),
        },
        _ => Err(bad()),
    }
}

// ----------------------------------------------------------------------
// Comparison and membership
// ----------------------------------------------------------------------

pub fn compare(op: CmpOp, a: &Value, b: &Value) -> ExecResult<bool> {
    let ordered = |pred: fn(Ordering) -> bool| -> ExecResult<bool> {
        match py_partial_cmp(a, b) {
            Ok(ordering) => Ok(ordering.is_some_and(pred)),
            Err(_) => Err(Exception::type_error(format!(
                "'{}' not supported between instances of '{}' and '{}'",
                cmp_symbol(op),
                a.type_name(),
                b.type_name()
            ))),
        }
    };
    match op {
        CmpOp::Eq => Ok(py_eq(a, b)),
        CmpOp::NotEq => Ok(!py_eq(a, b)),
        CmpOp::Lt => ordered(|o| o == Ordering::Less),
        CmpOp::LtE => ordered(|o| o != Ordering::Greater),
        CmpOp::Gt => ordered(|o| o == Ordering::Greater),
        CmpOp::GtE => ordered(|o| o != Ordering::Less),
        CmpOp::In => contains(b, a),
        CmpOp::NotIn => Ok(!contains(b, a)?),
        CmpOp::Is => Ok(is_same(a, b)),
        CmpOp::IsNot => Ok(!is_same(a, b)),
    }
}

fn cmp_symbol(op: CmpOp) -> &'static str {
    match op {
        CmpOp::Lt => "<",
        CmpOp::LtE => "<=",
        CmpOp::Gt => ">",
        CmpOp::GtE => ">=",
        _ => "==",
    }
}

/// Identity comparison.
pub fn is_same(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::None, Value::None) | (Value::Ellipsis, Value::Ellipsis) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => Arc::ptr_eq(x, y) || x == y,
        (Value::List(x), Value::List(y)) => Arc::ptr_eq(x, y),
        (Value::Dict(x), Value::Dict(y)) => Arc::ptr_eq(x, y),
        (Value::Set(x), Value::Set(y)) => Arc::ptr_eq(x, y),
        (Value::Tuple(x), Value::Tuple(y)) => Arc::ptr_eq(x, y),
        (Value::Function(x), Value::Function(y)) => Arc::ptr_eq(x, y),
        (Value::Native(x), Value::Native(y)) => Arc::ptr_eq(x, y),
        (Value::Exception(x), Value::Exception(y)) => Arc::ptr_eq(x, y),
        (Value::Type(x), Value::Type(y)) => x == y,
        (Value::Builtin(x), Value::Builtin(y)) => x.name == y.name,
        (Value::Module(x), Value::Module(y)) => Arc::ptr_eq(x, y),
        _ => false,
    }
}

/// `item in container`.
pub fn contains(container: &Value, item: &Value) -> ExecResult<bool> {
    match container {
        Value::Str(s) => match item {
            Value::Str(needle) => Ok(s.contains(&**needle)),
            other => Err(Exception::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::List(items) => {
            let items = items.lock().clone();
            Ok(items.iter().any(|v| py_eq(v, item)))
        }
        Value::Tuple(items) => Ok(items.iter().any(|v| py_eq(v, item))),
        Value::Dict(d) => {
            let key = item.hash_key()?;
            Ok(d.lock().entries.contains_key(&key))
        }
        Value::Set(s) => {
            let key = item.hash_key()?;
            Ok(s.lock().contains(&key))
        }
        Value::Range(r) => {
            let Some(n) = item.as_int() else {
                return Ok(false);
            };
            let in_bounds = if r.step > 0 {
                n >= r.start && n < r.stop
            } else {
                n <= r.start && n > r.stop
            };
            Ok(in_bounds && (n - r.start) % r.step == 0)
        }
        Value::Module(m) => Ok(item.as_str().is_some_and(|k| m.attrs.contains_key(k))),
        other => Err(Exception::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

// ----------------------------------------------------------------------
// Subscripts
// ----------------------------------------------------------------------

/// Normalizes `index` against `len` the way sequence indexing does.
fn normalize_index(index: i64, len: usize, what: &str) -> ExecResult<usize> {
    let len = i64::try_from(len).unwrap_or(i64::MAX);
    let resolved = if index < 0 { index + len } else { index };
    if resolved < 0 || resolved >= len {
        return Err(Exception::index_error(format!("{what} index out of range")));
    }
    Ok(resolved as usize)
}

/// Start, stop and step after clamping, as `slice.indices(len)` computes.
pub fn slice_indices(
    len: usize,
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> ExecResult<(i64, i64, i64)> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(Exception::value_error("slice step cannot be zero"));
    }
    let len = i64::try_from(len).unwrap_or(i64::MAX);
    let clamp = |value: Option<i64>, default: i64| -> i64 {
        match value {
            None => default,
            Some(v) if v < 0 => {
                let v = v + len;
                if v < 0 {
                    if step < 0 {
                        -1
                    } else {
                        0
                    }
                } else {
                    v
                }
            }
            Some(v) if v >= len => {
                if step < 0 {
                    len - 1
                } else {
                    len
                }
            }
            Some(v) => v,
        }
    };
    if step > 0 {
        Ok((clamp(start, 0), clamp(stop, len), step))
    } else {
        Ok((clamp(start, len - 1), clamp(stop, -1), step))
    }
}

/// Positions selected by a slice over a sequence of length `len`.
pub fn slice_positions(
    len: usize,
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> ExecResult<Vec<usize>> {
    let (start, stop, step) = slice_indices(len, start, stop, step)?;
    let mut out = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        out.push(i as usize);
        i += step;
    }
    Ok(out)
}

fn index_type_error(container: &str, index: &Value) -> Exception {
    Exception::type_error(format!(
        "{container} indices must be integers or slices, not {}",
        index.type_name()
    ))
}

pub fn get_item(interp: &mut Interpreter, obj: &Value, index: &Value) -> ExecResult<Value> {
    match obj {
        Value::List(items) => {
            let items = items.lock();
            sequence_item(&items, index, "list").map(|r| match r {
                Selected::One(v) => v,
                Selected::Many(vs) => Value::list(vs),
            })
        }
        Value::Tuple(items) => sequence_item(items, index, "tuple").map(|r| match r {
            Selected::One(v) => v,
            Selected::Many(vs) => Value::tuple(vs),
        }),
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            match index {
                Value::Slice(start, stop, step) => {
                    let picked: String = slice_positions(chars.len(), *start, *stop, *step)?
                        .into_iter()
                        .map(|i| chars[i])
                        .collect();
                    Ok(Value::str(picked))
                }
                other => {
                    let i = other
                        .as_int()
                        .ok_or_else(|| index_type_error("string", other))?;
                    let i = normalize_index(i, chars.len(), "string")?;
                    Ok(Value::str(chars[i].to_string()))
                }
            }
        }
        Value::Range(r) => match index {
            Value::Slice(start, stop, step) => {
                let (s, e, st) = slice_indices(r.len(), *start, *stop, *step)?;
                let at = |offset: i64| {
                    offset
                        .checked_mul(r.step)
                        .and_then(|delta| r.start.checked_add(delta))
                        .ok_or_else(Exception::overflow)
                };
                Ok(Value::Range(RangeValue {
                    start: at(s)?,
                    stop: at(e)?,
                    step: r.step.checked_mul(st).ok_or_else(Exception::overflow)?,
                }))
            }
            other => {
                let i = other
                    .as_int()
                    .ok_or_else(|| index_type_error("range", other))?;
                let i = normalize_index(i, r.len(), "range object")?;
                Ok(Value::Int(r.get(i).unwrap_or(0)))
            }
        },
        Value::Dict(d) => {
            let key = index.hash_key()?;
            let (found, flavor) = {
                let data = d.lock();
                (data.get(&key), data.flavor.clone())
            };
            if let Some(value) = found {
                return Ok(value);
            }
            match flavor {
                DictFlavor::Counter => Ok(Value::Int(0)),
                DictFlavor::Default(factory) if !factory.is_none() => {
                    let value = interp.call(&factory, Args::default())?;
                    d.lock().insert(index.clone(), value.clone())?;
                    Ok(value)
                }
                _ => Err(Exception::key_error(index.clone())),
            }
        }
        Value::Native(n) => match &**n {
            Native::Match(m) => stdlib::re::match_group(m, index),
            _ => Err(not_subscriptable(obj)),
        },
        Value::Type(_) => Ok(obj.clone()),
        _ => Err(not_subscriptable(obj)),
    }
}

fn not_subscriptable(obj: &Value) -> Exception {
    Exception::type_error(format!(
        "'{}' object is not subscriptable",
        obj.type_name()
    ))
}

enum Selected {
    One(Value),
    Many(Vec<Value>),
}

fn sequence_item(items: &[Value], index: &Value, what: &str) -> ExecResult<Selected> {
    match index {
        Value::Slice(start, stop, step) => Ok(Selected::Many(
            slice_positions(items.len(), *start, *stop, *step)?
                .into_iter()
                .map(|i| items[i].clone())
                .collect(),
        )),
        other => {
            let i = other.as_int().ok_or_else(|| index_type_error(what, other))?;
            let i = normalize_index(i, items.len(), what)?;
            Ok(Selected::One(items[i].clone()))
        }
    }
}

pub fn set_item(obj: &Value, index: &Value, value: Value) -> ExecResult<()> {
    match obj {
        Value::List(items) => match index {
            Value::Slice(start, stop, step) => {
                let replacement = collect(&value)?;
                let mut items = items.lock();
                if step.unwrap_or(1) == 1 {
                    let (s, e, _) = slice_indices(items.len(), *start, *stop, Some(1))?;
                    let e = e.max(s);
                    let _replaced: Vec<Value> =
                        items.splice(s as usize..e as usize, replacement).collect();
                    return Ok(());
                }
                let positions = slice_positions(items.len(), *start, *stop, *step)?;
                if positions.len() != replacement.len() {
                    return Err(Exception::value_error(format!(
                        "attempt to assign sequence of size {} to extended slice of size {}",
                        replacement.len(),
                        positions.len()
                    )));
                }
                for (pos, v) in positions.into_iter().zip(replacement) {
                    items[pos] = v;
                }
                Ok(())
            }
            other => {
                let i = other.as_int().ok_or_else(|| index_type_error("list", other))?;
                let mut items = items.lock();
                let i = normalize_index(i, items.len(), "list assignment")?;
                items[i] = value;
                Ok(())
            }
        },
        Value::Dict(d) => d.lock().insert(index.clone(), value),
        other => Err(Exception::type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

pub fn del_item(obj: &Value, index: &Value) -> ExecResult<()> {
    match obj {
        Value::List(items) => {
            let mut items = items.lock();
            match index {
                Value::Slice(start, stop, step) => {
                    let mut positions = slice_positions(items.len(), *start, *stop, *step)?;
                    positions.sort_unstable();
                    for pos in positions.into_iter().rev() {
                        items.remove(pos);
                    }
                    Ok(())
                }
                other => {
                    let i = other.as_int().ok_or_else(|| index_type_error("list", other))?;
                    let i = normalize_index(i, items.len(), "list assignment")?;
                    items.remove(i);
                    Ok(())
                }
            }
        }
        Value::Dict(d) => {
            let key = index.hash_key()?;
            match d.lock().remove(&key) {
                Some(_) => Ok(()),
                None => Err(Exception::key_error(index.clone())),
            }
        }
        other => Err(Exception::type_error(format!(
            "'{}' object does not support item deletion",
            other.type_name()
        ))),
    }
}

// ----------------------------------------------------------------------
// Iteration
// ----------------------------------------------------------------------

/// Iterator over a snapshot of an iterable; ranges are produced lazily.
pub enum ValueIter {
    Items(std::vec::IntoIter<Value>),
    Range { next: i64, stop: i64, step: i64 },
}

impl Iterator for ValueIter {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        match self {
            ValueIter::Items(items) => items.next(),
            ValueIter::Range { next, stop, step } => {
                let more = if *step > 0 { *next < *stop } else { *next > *stop };
                if !more {
                    return None;
                }
                let current = *next;
                *next = next.saturating_add(*step);
                if *next == current {
                    *next = *stop;
                }
                Some(Value::Int(current))
            }
        }
    }
}

pub fn value_iter(value: &Value) -> ExecResult<ValueIter> {
    if let Value::Range(r) = value {
        return Ok(ValueIter::Range {
            next: r.start,
            stop: r.stop,
            step: r.step,
        });
    }
    Ok(ValueIter::Items(collect(value)?.into_iter()))
}

/// Materializes any iterable into a vector.
pub fn collect(value: &Value) -> ExecResult<Vec<Value>> {
    let items = match value {
        Value::List(items) => items.lock().clone(),
        Value::Tuple(items) => items.to_vec(),
        Value::Str(s) => s.chars().map(|c| Value::str(c.to_string())).collect(),
        Value::Dict(d) => d.lock().keys(),
        Value::Set(s) => s.lock().values(),
        Value::Range(r) => {
            check_len(r.len())?;
            (0..r.len()).filter_map(|i| r.get(i)).map(Value::Int).collect()
        }
        Value::Native(n) => match stdlib::io::iter_lines(n)? {
            Some(lines) => lines,
            None => return Err(not_iterable(value)),
        },
        _ => return Err(not_iterable(value)),
    };
    Ok(items)
}

fn not_iterable(value: &Value) -> Exception {
    Exception::type_error(format!("'{}' object is not iterable", value.type_name()))
}

/// `len()` semantics.
pub fn len(value: &Value) -> ExecResult<usize> {
    Ok(match value {
        Value::Str(s) => s.chars().count(),
        Value::List(items) => items.lock().len(),
        Value::Tuple(items) => items.len(),
        Value::Dict(d) => d.lock().len(),
        Value::Set(s) => s.lock().items.len(),
        Value::Range(r) => r.checked_len()?,
        other => {
            return Err(Exception::type_error(format!(
                "object of type '{}' has no len()",
                other.type_name()
            )))
        }
    })
}

/// Key/value pairs of a mapping, for `**` and `dict(mapping)`.
pub fn mapping_items(value: &Value) -> ExecResult<Vec<(Value, Value)>> {
    match value {
        Value::Dict(d) => Ok(d.lock().items()),
        other => Err(Exception::type_error(format!(
            "'{}' object is not a mapping",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(n: i64) -> Value {
        Value::Int(n)
    }

    #[test]
    fn test_floor_division_and_modulo_follow_divisor_sign() {
        assert_eq!(floor_div(-7, 2).unwrap(), -4);
        assert_eq!(floor_mod(-7, 2).unwrap(), 1);
        assert_eq!(floor_mod(7, -2).unwrap(), -1);
        assert!((float_mod(-1.0, 3.0) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_integer_overflow_is_reported() {
        let err = binary(BinOp::Mul, &int(i64::MAX), &int(2)).unwrap_err();
        assert_eq!(err.kind(), ExcType::OverflowError);
        let err = binary(BinOp::Pow, &int(10), &int(40)).unwrap_err();
        assert_eq!(err.kind(), ExcType::OverflowError);
        let err = binary(BinOp::Add, &int(i64::MAX), &int(1)).unwrap_err();
        assert!(err.message().contains("64-bit"));
        // Floats take over where integers stop.
        assert!(matches!(
            binary(BinOp::Pow, &Value::Float(2.0), &int(64)).unwrap(),
            Value::Float(f) if f == 18446744073709551616.0
        ));
    }

    #[test]
    fn test_division_by_zero_messages() {
        let err = binary(BinOp::Div, &int(1), &int(0)).unwrap_err();
        assert_eq!(err.message(), "division by zero");
        let err = binary(BinOp::Mod, &int(1), &int(0)).unwrap_err();
        assert_eq!(err.kind(), ExcType::ZeroDivisionError);
    }

    #[test]
    fn test_true_division_returns_float() {
        assert!(matches!(binary(BinOp::Div, &int(4), &int(2)).unwrap(), Value::Float(f) if f == 2.0));
        assert!(matches!(binary(BinOp::Pow, &int(2), &int(-1)).unwrap(), Value::Float(f) if f == 0.5));
    }

    #[test]
    fn test_string_concatenation_type_error() {
        let err = binary(BinOp::Add, &Value::str("a"), &int(1)).unwrap_err();
        assert_eq!(err.message(), "can only concatenate str (not \"int\") to str");
    }

    #[test]
    fn test_sequence_repeat_limit() {
        let err = binary(BinOp::Mul, &Value::list(vec![int(0)]), &int(100_000_000)).unwrap_err();
        assert_eq!(err.kind(), ExcType::MemoryError);
    }

    #[test]
    fn test_slice_indices_match_negative_steps() {
        assert_eq!(slice_positions(5, None, None, Some(-1)).unwrap(), vec![4, 3, 2, 1, 0]);
        assert_eq!(slice_positions(5, Some(-2), None, None).unwrap(), vec![3, 4]);
        assert_eq!(slice_positions(5, Some(1), Some(100), Some(2)).unwrap(), vec![1, 3]);
        assert!(slice_indices(3, None, None, Some(0)).is_err());
    }

    #[test]
    fn test_membership() {
        assert!(contains(&Value::str("hello"), &Value::str("ell")).unwrap());
        assert!(contains(&Value::list(vec![int(1), int(2)]), &Value::Float(2.0)).unwrap());
        let range = Value::Range(RangeValue { start: 0, stop: 10, step: 3 });
        assert!(contains(&range, &int(9)).unwrap());
        assert!(!contains(&range, &int(4)).unwrap());
        assert!(contains(&int(1), &int(1)).is_err());
    }

    #[test]
    fn test_set_operations() {
        let a = Value::set({
            let mut s = SetData::default();
            s.insert(int(1)).unwrap();
            s.insert(int(2)).unwrap();
            s
        });
        let b = Value::set({
            let mut s = SetData::default();
            s.insert(int(2)).unwrap();
            s.insert(int(3)).unwrap();
            s
        });
        assert_eq!(binary(BinOp::BitAnd, &a, &b).unwrap().repr(), "{2}");
        assert_eq!(binary(BinOp::Sub, &a, &b).unwrap().repr(), "{1}");
        assert_eq!(binary(BinOp::BitXor, &a, &b).unwrap().repr(), "{1, 3}");
    }

    #[test]
    fn test_list_slice_assignment() {
        let list = Value::list(vec![int(1), int(2), int(3), int(4)]);
        set_item(
            &list,
            &Value::Slice(Some(1), Some(3), None),
            Value::list(vec![int(9)]),
        )
        .unwrap();
        assert_eq!(list.repr(), "[1, 9, 4]");
        del_item(&list, &int(-1)).unwrap();
        assert_eq!(list.repr(), "[1, 9]");
    }

    #[test]
    fn test_range_iteration_is_lazy() {
        let huge = Value::Range(RangeValue {
            start: 0,
            stop: i64::MAX,
            step: 1,
        });
        let first: Vec<_> = value_iter(&huge).unwrap().take(3).collect();
        assert_eq!(Value::list(first).repr(), "[0, 1, 2]");
        assert!(collect(&huge).is_err());
    }
}
