//! The `math` module.

use std::f64::consts;

use super::{func, module};
use crate::sandbox::builtins::float_to_int;
use crate::sandbox::error::{ExecResult, Exception};
use crate::sandbox::interpreter::Interpreter;
use crate::sandbox::ops;
use crate::sandbox::value::{Args, Value};

pub fn module_value() -> Value {
    module(
        "math",
        vec![
            ("pi", Value::Float(consts::PI)),
            ("e", Value::Float(consts::E)),
            ("tau", Value::Float(consts::TAU)),
            ("inf", Value::Float(f64::INFINITY)),
            ("nan", Value::Float(f64::NAN)),
            ("sqrt", func("sqrt", math_sqrt)),
            ("floor", func("floor", math_floor)),
            ("ceil", func("ceil", math_ceil)),
            ("trunc", func("trunc", math_trunc)),
            ("log", func("log", math_log)),
            ("log10", func("log10", math_log10)),
            ("log2", func("log2", math_log2)),
            ("exp", func("exp", math_exp)),
            ("pow", func("pow", math_pow)),
            ("fabs", func("fabs", math_fabs)),
            ("sin", func("sin", math_sin)),
            ("cos", func("cos", math_cos)),
            ("tan", func("tan", math_tan)),
            ("asin", func("asin", math_asin)),
            ("acos", func("acos", math_acos)),
            ("atan", func("atan", math_atan)),
            ("atan2", func("atan2", math_atan2)),
            ("hypot", func("hypot", math_hypot)),
            ("degrees", func("degrees", math_degrees)),
            ("radians", func("radians", math_radians)),
            ("copysign", func("copysign", math_copysign)),
            ("isnan", func("isnan", math_isnan)),
            ("isinf", func("isinf", math_isinf)),
            ("isfinite", func("isfinite", math_isfinite)),
            ("isclose", func("isclose", math_isclose)),
            ("factorial", func("factorial", math_factorial)),
            ("gcd", func("gcd", math_gcd)),
            ("lcm", func("lcm", math_lcm)),
            ("comb", func("comb", math_comb)),
            ("perm", func("perm", math_perm)),
            ("fsum", func("fsum", math_fsum)),
            ("prod", func("prod", math_prod)),
        ],
    )
}

fn real(value: &Value) -> ExecResult<f64> {
    value.as_float().ok_or_else(|| {
        Exception::type_error(format!(
            "must be real number, not {}",
            value.type_name()
        ))
    })
}

fn integer(value: &Value, func: &str) -> ExecResult<i64> {
    match value {
        Value::Int(n) => Ok(*n),
        Value::Bool(b) => Ok(i64::from(*b)),
        other => Err(Exception::type_error(format!(
            "{func}() only accepts integral values, not {}",
            other.type_name()
        ))),
    }
}

fn domain_error() -> Exception {
    Exception::value_error("math domain error")
}

fn unary(args: &Args, name: &str) -> ExecResult<f64> {
    args.check(name, 1, 1)?;
    real(&args.positional[0])
}

fn binary(args: &Args, name: &str) -> ExecResult<(f64, f64)> {
    args.check(name, 2, 2)?;
    Ok((real(&args.positional[0])?, real(&args.positional[1])?))
}

/// Applies `f` and rejects NaN results for finite input.
fn checked(x: f64, f: impl Fn(f64) -> f64) -> ExecResult<Value> {
    let y = f(x);
    if y.is_nan() && !x.is_nan() {
        return Err(domain_error());
    }
    Ok(Value::Float(y))
}

fn math_sqrt(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    checked(unary(&args, "sqrt")?, f64::sqrt)
}

fn rounded(args: &Args, name: &str, f: fn(f64) -> f64) -> ExecResult<Value> {
    args.check(name, 1, 1)?;
    match &args.positional[0] {
        Value::Int(n) => Ok(Value::Int(*n)),
        Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
        other => Ok(Value::Int(float_to_int(f(real(other)?))?)),
    }
}

fn math_floor(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    rounded(&args, "floor", f64::floor)
}

fn math_ceil(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    rounded(&args, "ceil", f64::ceil)
}

fn math_trunc(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    rounded(&args, "trunc", f64::trunc)
}

fn math_log(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("log", 1, 2)?;
    let x = real(&args.positional[0])?;
    if x <= 0.0 {
        return Err(domain_error());
    }
    match args.get(1) {
        None => Ok(Value::Float(x.ln())),
        Some(base) => {
            let base = real(base)?;
            if base <= 0.0 || base == 1.0 {
                return Err(domain_error());
            }
            Ok(Value::Float(x.ln() / base.ln()))
        }
    }
}

fn positive_log(args: &Args, name: &str, f: fn(f64) -> f64) -> ExecResult<Value> {
    let x = unary(args, name)?;
    if x <= 0.0 {
        return Err(domain_error());
    }
    Ok(Value::Float(f(x)))
}

fn math_log10(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    positive_log(&args, "log10", f64::log10)
}

fn math_log2(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    positive_log(&args, "log2", f64::log2)
}

fn math_exp(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let y = unary(&args, "exp")?.exp();
    if y.is_infinite() {
        return Err(Exception::overflow());
    }
    Ok(Value::Float(y))
}

fn math_pow(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let (x, y) = binary(&args, "pow")?;
    if x == 0.0 && y < 0.0 {
        return Err(domain_error());
    }
    let z = x.powf(y);
    if z.is_nan() && !x.is_nan() && !y.is_nan() {
        return Err(domain_error());
    }
    Ok(Value::Float(z))
}

fn math_fabs(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    Ok(Value::Float(unary(&args, "fabs")?.abs()))
}

fn math_sin(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    checked(unary(&args, "sin")?, f64::sin)
}

fn math_cos(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    checked(unary(&args, "cos")?, f64::cos)
}

fn math_tan(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    checked(unary(&args, "tan")?, f64::tan)
}

fn math_asin(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    checked(unary(&args, "asin")?, f64::asin)
}

fn math_acos(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    checked(unary(&args, "acos")?, f64::acos)
}

fn math_atan(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    Ok(Value::Float(unary(&args, "atan")?.atan()))
}

fn math_atan2(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let (y, x) = binary(&args, "atan2")?;
    Ok(Value::Float(y.atan2(x)))
}

fn math_hypot(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let mut total = 0.0_f64;
    for value in &args.positional {
        let x = real(value)?;
        total = total.hypot(x);
    }
    Ok(Value::Float(total))
}

fn math_degrees(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    Ok(Value::Float(unary(&args, "degrees")?.to_degrees()))
}

fn math_radians(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    Ok(Value::Float(unary(&args, "radians")?.to_radians()))
}

fn math_copysign(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let (x, y) = binary(&args, "copysign")?;
    Ok(Value::Float(x.copysign(y)))
}

fn math_isnan(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    Ok(Value::Bool(unary(&args, "isnan")?.is_nan()))
}

fn math_isinf(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    Ok(Value::Bool(unary(&args, "isinf")?.is_infinite()))
}

fn math_isfinite(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    Ok(Value::Bool(unary(&args, "isfinite")?.is_finite()))
}

fn math_isclose(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let (a, b) = binary(&args, "isclose")?;
    let rel_tol = args.kwarg("rel_tol").map(real).transpose()?.unwrap_or(1e-9);
    let abs_tol = args.kwarg("abs_tol").map(real).transpose()?.unwrap_or(0.0);
    if rel_tol < 0.0 || abs_tol < 0.0 {
        return Err(Exception::value_error("tolerances must be non-negative"));
    }
    if a == b {
        return Ok(Value::Bool(true));
    }
    if a.is_infinite() || b.is_infinite() {
        return Ok(Value::Bool(false));
    }
    let diff = (a - b).abs();
    let close = diff <= (rel_tol * b.abs()).max(rel_tol * a.abs()) || diff <= abs_tol;
    Ok(Value::Bool(close))
}

fn math_factorial(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("factorial", 1, 1)?;
    let n = integer(&args.positional[0], "factorial")?;
    if n < 0 {
        return Err(Exception::value_error(
            "factorial() not defined for negative values",
        ));
    }
    let mut acc: i64 = 1;
    for k in 2..=n {
        acc = acc.checked_mul(k).ok_or_else(Exception::overflow)?;
    }
    Ok(Value::Int(acc))
}

fn gcd(a: i64, b: i64) -> i64 {
    let (mut a, mut b) = (a.unsigned_abs(), b.unsigned_abs());
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a as i64
}

fn math_gcd(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let mut acc = 0;
    for value in &args.positional {
        acc = gcd(acc, integer(value, "gcd")?);
    }
    Ok(Value::Int(acc))
}

fn math_lcm(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let mut acc: i64 = 1;
    for value in &args.positional {
        let n = integer(value, "lcm")?;
        if n == 0 || acc == 0 {
            acc = 0;
            continue;
        }
        acc = (acc / gcd(acc, n))
            .checked_mul(n.abs())
            .ok_or_else(Exception::overflow)?;
    }
    Ok(Value::Int(acc))
}

fn counting_args(args: &Args, name: &str) -> ExecResult<(i64, i64)> {
    args.check(name, 2, 2)?;
    let n = integer(&args.positional[0], name)?;
    let k = integer(&args.positional[1], name)?;
    if n < 0 {
        return Err(Exception::value_error("n must be a non-negative integer"));
    }
    if k < 0 {
        return Err(Exception::value_error("k must be a non-negative integer"));
    }
    Ok((n, k))
}

fn math_comb(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let (n, k) = counting_args(&args, "comb")?;
    if k > n {
        return Ok(Value::Int(0));
    }
    let k = k.min(n - k);
    let mut acc: i128 = 1;
    for i in 0..k {
        acc = acc * i128::from(n - i) / i128::from(i + 1);
        if acc > i128::from(i64::MAX) {
            return Err(Exception::overflow());
        }
    }
    Ok(Value::Int(acc as i64))
}

fn math_perm(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let (n, k) = counting_args(&args, "perm")?;
    if k > n {
        return Ok(Value::Int(0));
    }
    let mut acc: i64 = 1;
    for i in 0..k {
        acc = acc.checked_mul(n - i).ok_or_else(Exception::overflow)?;
    }
    Ok(Value::Int(acc))
}

/// Neumaier-compensated sum.
fn math_fsum(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("fsum", 1, 1)?;
    let mut sum = 0.0_f64;
    let mut compensation = 0.0_f64;
    for item in ops::collect(&args.positional[0])? {
        let x = real(&item)?;
        let t = sum + x;
        if sum.abs() >= x.abs() {
            compensation += (sum - t) + x;
        } else {
            compensation += (x - t) + sum;
        }
        sum = t;
    }
    Ok(Value::Float(sum + compensation))
}

fn math_prod(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("prod", 1, 1)?;
    let mut acc = args.kwarg("start").cloned().unwrap_or(Value::Int(1));
    for item in ops::collect(&args.positional[0])? {
        acc = ops::binary(crate::sandbox::ast::BinOp::Mul, &acc, &item)?;
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::interpreter::{ExecContext, ExecutionLimits};
    use crate::sandbox::namespace::Namespace;
    use indexmap::IndexMap;
    use std::sync::Arc;

    fn call(f: fn(&mut Interpreter, Args) -> ExecResult<Value>, args: Vec<Value>) -> ExecResult<Value> {
        let ns = Namespace::new(Arc::new(IndexMap::new()), IndexMap::new());
        let mut interp = Interpreter::new(ns, ExecContext::default(), ExecutionLimits::default());
        f(&mut interp, Args::new(args))
    }

    #[test]
    fn test_floor_and_ceil_return_ints() {
        assert_eq!(call(math_floor, vec![Value::Float(-1.5)]).unwrap().repr(), "-2");
        assert_eq!(call(math_ceil, vec![Value::Float(1.2)]).unwrap().repr(), "2");
    }

    #[test]
    fn test_domain_errors() {
        let err = call(math_sqrt, vec![Value::Float(-1.0)]).unwrap_err();
        assert_eq!(err.message(), "math domain error");
        assert!(call(math_log, vec![Value::Int(0)]).is_err());
    }

    #[test]
    fn test_integer_functions() {
        assert_eq!(call(math_factorial, vec![Value::Int(5)]).unwrap().repr(), "120");
        assert_eq!(call(math_gcd, vec![Value::Int(12), Value::Int(18)]).unwrap().repr(), "6");
        assert_eq!(call(math_lcm, vec![Value::Int(4), Value::Int(6)]).unwrap().repr(), "12");
        assert_eq!(call(math_comb, vec![Value::Int(5), Value::Int(2)]).unwrap().repr(), "10");
        assert_eq!(call(math_perm, vec![Value::Int(5), Value::Int(2)]).unwrap().repr(), "20");
    }

    #[test]
    fn test_fsum_is_exact_for_small_terms() {
        let items = Value::list(vec![Value::Float(0.1); 10]);
        assert_eq!(call(math_fsum, vec![items]).unwrap().repr(), "1.0");
    }

    #[test]
    fn test_isclose_default_tolerance() {
        let close = call(math_isclose, vec![Value::Float(1.0), Value::Float(1.0 + 1e-10)]).unwrap();
        assert!(close.truthy());
    }
}
