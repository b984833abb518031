//! The `statistics` module.

use super::{func, module};
use crate::sandbox::error::{ExcType, ExecResult, Exception};
use crate::sandbox::interpreter::Interpreter;
use crate::sandbox::ops;
use crate::sandbox::value::{py_cmp, py_eq, Args, Value, TypeObj};

pub fn module_value() -> Value {
    module(
        "statistics",
        vec![
            ("mean", func("mean", stats_mean)),
            ("fmean", func("fmean", stats_fmean)),
            ("median", func("median", stats_median)),
            ("mode", func("mode", stats_mode)),
            ("stdev", func("stdev", stats_stdev)),
            ("pstdev", func("pstdev", stats_pstdev)),
            ("variance", func("variance", stats_variance)),
            ("pvariance", func("pvariance", stats_pvariance)),
            (
                "StatisticsError",
                Value::Type(TypeObj::Exception(ExcType::ValueError)),
            ),
        ],
    )
}

fn statistics_error(message: &str) -> Exception {
    Exception::value_error(message)
}

/// Numeric data plus whether every point was an integer.
struct Sample {
    points: Vec<f64>,
    integral: bool,
}

fn sample(args: &Args, name: &str, min: usize) -> ExecResult<Sample> {
    args.check(name, 1, 1)?;
    let items = ops::collect(&args.positional[0])?;
    let mut points = Vec::with_capacity(items.len());
    let mut integral = true;
    for item in &items {
        if !matches!(item, Value::Int(_) | Value::Bool(_)) {
            integral = false;
        }
        points.push(item.as_float().ok_or_else(|| {
            Exception::type_error(format!(
                "can't convert type '{}' to numerator/denominator",
                item.type_name()
            ))
        })?);
    }
    if points.len() < min {
        let message = if min == 1 {
            format!("{name} requires at least one data point")
        } else {
            format!("{name} requires at least two data points")
        };
        return Err(statistics_error(&message));
    }
    Ok(Sample { points, integral })
}

/// Integral results stay `int` when the input was all integers.
fn number(value: f64, integral: bool) -> Value {
    if integral && value.fract() == 0.0 && value.abs() < 9.0e15 {
        Value::Int(value as i64)
    } else {
        Value::Float(value)
    }
}

fn mean_of(points: &[f64]) -> f64 {
    points.iter().sum::<f64>() / points.len() as f64
}

fn squared_deviations(points: &[f64]) -> f64 {
    let mu = mean_of(points);
    points.iter().map(|x| (x - mu) * (x - mu)).sum()
}

fn stats_mean(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let s = sample(&args, "mean", 1)?;
    Ok(number(mean_of(&s.points), s.integral))
}

fn stats_fmean(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let s = sample(&args, "fmean", 1)?;
    Ok(Value::Float(mean_of(&s.points)))
}

fn stats_median(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("median", 1, 1)?;
    let mut items = ops::collect(&args.positional[0])?;
    if items.is_empty() {
        return Err(statistics_error("no median for empty data"));
    }
    let mut failure = None;
    items.sort_by(|a, b| {
        py_cmp(a, b).unwrap_or_else(|e| {
            failure.get_or_insert(e);
            std::cmp::Ordering::Equal
        })
    });
    if let Some(err) = failure {
        return Err(err);
    }
    let n = items.len();
    if n % 2 == 1 {
        return Ok(items[n / 2].clone());
    }
    let lo = real(&items[n / 2 - 1])?;
    let hi = real(&items[n / 2])?;
    Ok(Value::Float((lo + hi) / 2.0))
}

fn real(value: &Value) -> ExecResult<f64> {
    value.as_float().ok_or_else(|| {
        Exception::type_error(format!(
            "unsupported operand type(s) for +: '{0}' and '{0}'",
            value.type_name()
        ))
    })
}

/// First value among the most common.
fn stats_mode(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("mode", 1, 1)?;
    let items = ops::collect(&args.positional[0])?;
    let mut counts: Vec<(Value, usize)> = Vec::new();
    for item in items {
        match counts.iter_mut().find(|(v, _)| py_eq(v, &item)) {
            Some((_, n)) => *n += 1,
            None => counts.push((item, 1)),
        }
    }
    let best = counts.iter().map(|(_, n)| *n).max();
    match best {
        Some(best) => Ok(counts
            .into_iter()
            .find(|(_, n)| *n == best)
            .map(|(v, _)| v)
            .unwrap_or(Value::None)),
        None => Err(statistics_error("no mode for empty data")),
    }
}

fn stats_variance(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let s = sample(&args, "variance", 2)?;
    let var = squared_deviations(&s.points) / (s.points.len() - 1) as f64;
    Ok(number(var, s.integral))
}

fn stats_pvariance(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let s = sample(&args, "pvariance", 1)?;
    let var = squared_deviations(&s.points) / s.points.len() as f64;
    Ok(number(var, s.integral))
}

fn stats_stdev(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let s = sample(&args, "stdev", 2)?;
    let var = squared_deviations(&s.points) / (s.points.len() - 1) as f64;
    Ok(Value::Float(var.sqrt()))
}

fn stats_pstdev(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let s = sample(&args, "pstdev", 1)?;
    let var = squared_deviations(&s.points) / s.points.len() as f64;
    Ok(Value::Float(var.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::interpreter::{ExecContext, ExecutionLimits};
    use crate::sandbox::namespace::Namespace;
    use indexmap::IndexMap;
    use std::sync::Arc;

    fn call(f: fn(&mut Interpreter, Args) -> ExecResult<Value>, data: Vec<Value>) -> ExecResult<Value> {
        let ns = Namespace::new(Arc::new(IndexMap::new()), IndexMap::new());
        let mut interp = Interpreter::new(ns, ExecContext::default(), ExecutionLimits::default());
        f(&mut interp, Args::new(vec![Value::list(data)]))
    }

    fn ints(values: &[i64]) -> Vec<Value> {
        values.iter().map(|n| Value::Int(*n)).collect()
    }

    #[test]
    fn test_mean_keeps_int_when_exact() {
        assert_eq!(call(stats_mean, ints(&[1, 2, 3])).unwrap().repr(), "2");
        assert_eq!(call(stats_mean, ints(&[1, 2])).unwrap().repr(), "1.5");
    }

    #[test]
    fn test_median_even_and_odd() {
        assert_eq!(call(stats_median, ints(&[3, 1, 2])).unwrap().repr(), "2");
        assert_eq!(call(stats_median, ints(&[4, 1, 3, 2])).unwrap().repr(), "2.5");
    }

    #[test]
    fn test_mode_prefers_first_seen() {
        assert_eq!(call(stats_mode, ints(&[2, 1, 1, 2, 3])).unwrap().repr(), "2");
    }

    #[test]
    fn test_variance_needs_two_points() {
        let err = call(stats_variance, ints(&[1])).unwrap_err();
        assert_eq!(err.message(), "variance requires at least two data points");
        assert_eq!(call(stats_variance, ints(&[1, 2, 3])).unwrap().repr(), "1");
        assert_eq!(call(stats_pstdev, ints(&[2, 4])).unwrap().repr(), "1.0");
    }
}
