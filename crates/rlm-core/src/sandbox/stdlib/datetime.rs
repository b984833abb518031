//! `datetime`, `date` and `timedelta` backed by `chrono`.

use std::sync::Arc;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use super::{module, text_arg};
use crate::sandbox::error::{ExecResult, Exception};
use crate::sandbox::format::strftime;
use crate::sandbox::value::{format_datetime, timedelta_parts, Args, Native, TypeObj, Value};

pub const DATETIME_METHODS: &[&str] = &[
    "strftime", "isoformat", "date", "weekday", "isoweekday", "timestamp", "replace",
];
pub const DATETIME_PROPERTIES: &[&str] = &[
    "year", "month", "day", "hour", "minute", "second", "microsecond",
];
pub const DATE_METHODS: &[&str] = &["strftime", "isoformat", "weekday", "isoweekday", "replace"];
pub const DATE_PROPERTIES: &[&str] = &["year", "month", "day"];
pub const TIMEDELTA_METHODS: &[&str] = &["total_seconds"];
pub const TIMEDELTA_PROPERTIES: &[&str] = &["days", "seconds", "microseconds"];
pub const DATETIME_CLASS_METHODS: &[&str] = &[
    "now", "today", "utcnow", "fromisoformat", "strptime", "fromtimestamp",
];
pub const DATE_CLASS_METHODS: &[&str] = &["today", "fromisoformat"];

const ISO_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

pub fn module_value() -> Value {
    module(
        "datetime",
        vec![
            ("datetime", Value::Type(TypeObj::DateTime)),
            ("date", Value::Type(TypeObj::Date)),
            ("timedelta", Value::Type(TypeObj::TimeDelta)),
            ("MINYEAR", Value::Int(1)),
            ("MAXYEAR", Value::Int(9999)),
        ],
    )
}

fn int_field(args: &Args, index: usize, name: &str, default: Option<i64>) -> ExecResult<i64> {
    match args.arg(index, name) {
        Some(v) => v.as_int().ok_or_else(|| {
            Exception::type_error(format!(
                "'{}' object cannot be interpreted as an integer",
                v.type_name()
            ))
        }),
        None => default.ok_or_else(|| {
            Exception::type_error(format!("function missing required argument '{name}'"))
        }),
    }
}

fn build_date(year: i64, month: i64, day: i64) -> ExecResult<NaiveDate> {
    if !(1..=9999).contains(&year) {
        return Err(Exception::value_error(format!("year {year} is out of range")));
    }
    if !(1..=12).contains(&month) {
        return Err(Exception::value_error("month must be in 1..12"));
    }
    NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
        .ok_or_else(|| Exception::value_error("day is out of range for month"))
}

fn build_time(hour: i64, minute: i64, second: i64, micro: i64) -> ExecResult<NaiveTime> {
    let check = |value: i64, max: i64, what: &str| {
        if (0..=max).contains(&value) {
            Ok(value as u32)
        } else {
            Err(Exception::value_error(format!("{what} must be in 0..{max}")))
        }
    };
    let t = NaiveTime::from_hms_micro_opt(
        check(hour, 23, "hour")?,
        check(minute, 59, "minute")?,
        check(second, 59, "second")?,
        check(micro, 999_999, "microsecond")?,
    );
    t.ok_or_else(|| Exception::value_error("invalid time"))
}

fn number(value: &Value, name: &str) -> ExecResult<f64> {
    value.as_float().ok_or_else(|| {
        Exception::type_error(format!(
            "unsupported type for timedelta {name} component: {}",
            value.type_name()
        ))
    })
}

/// Builds a duration from the `timedelta` keyword units.
pub fn timedelta_from_args(args: &Args) -> ExecResult<Duration> {
    const UNITS: [(&str, f64); 7] = [
        ("days", 86_400_000_000.0),
        ("seconds", 1_000_000.0),
        ("microseconds", 1.0),
        ("milliseconds", 1_000.0),
        ("minutes", 60_000_000.0),
        ("hours", 3_600_000_000.0),
        ("weeks", 604_800_000_000.0),
    ];
    args.check("timedelta", 0, UNITS.len())?;
    if let Some(key) = args
        .kwargs
        .keys()
        .find(|k| !UNITS.iter().any(|(u, _)| u == k))
    {
        return Err(Exception::type_error(format!(
            "timedelta() got an unexpected keyword argument '{key}'"
        )));
    }
    let mut micros = 0.0;
    for (index, (unit, scale)) in UNITS.iter().enumerate() {
        if let Some(value) = args.arg(index, unit) {
            micros += number(&value, unit)? * scale;
        }
    }
    if !micros.is_finite() || micros.abs() > 999_999_999.0 * 86_400_000_000.0 {
        return Err(Exception::overflow());
    }
    Ok(Duration::microseconds(micros.round() as i64))
}

pub fn construct(class: TypeObj, args: Args) -> ExecResult<Value> {
    match class {
        TypeObj::DateTime => {
            args.check("datetime", 0, 7)?;
            let date = build_date(
                int_field(&args, 0, "year", None)?,
                int_field(&args, 1, "month", None)?,
                int_field(&args, 2, "day", None)?,
            )?;
            let time = build_time(
                int_field(&args, 3, "hour", Some(0))?,
                int_field(&args, 4, "minute", Some(0))?,
                int_field(&args, 5, "second", Some(0))?,
                int_field(&args, 6, "microsecond", Some(0))?,
            )?;
            Ok(Value::native(Native::DateTime(date.and_time(time))))
        }
        TypeObj::Date => {
            args.check("date", 0, 3)?;
            let date = build_date(
                int_field(&args, 0, "year", None)?,
                int_field(&args, 1, "month", None)?,
                int_field(&args, 2, "day", None)?,
            )?;
            Ok(Value::native(Native::Date(date)))
        }
        _ => Ok(Value::native(Native::TimeDelta(timedelta_from_args(&args)?))),
    }
}

pub fn property(n: &Arc<Native>, name: &str) -> Option<Value> {
    let int = |v: i64| Some(Value::Int(v));
    match &**n {
        Native::DateTime(dt) => match name {
            "year" => int(dt.year() as i64),
            "month" => int(dt.month() as i64),
            "day" => int(dt.day() as i64),
            "hour" => int(dt.hour() as i64),
            "minute" => int(dt.minute() as i64),
            "second" => int(dt.second() as i64),
            "microsecond" => int((dt.nanosecond() / 1000) as i64),
            _ => None,
        },
        Native::Date(d) => match name {
            "year" => int(d.year() as i64),
            "month" => int(d.month() as i64),
            "day" => int(d.day() as i64),
            _ => None,
        },
        Native::TimeDelta(td) => {
            let (days, seconds, micros) = timedelta_parts(td);
            match name {
                "days" => int(days),
                "seconds" => int(seconds),
                "microseconds" => int(micros),
                _ => None,
            }
        }
        _ => None,
    }
}

fn replace_datetime(dt: &NaiveDateTime, args: &Args) -> ExecResult<NaiveDateTime> {
    args.check("replace", 0, 0)?;
    let field = |name: &str, current: i64| -> ExecResult<i64> {
        match args.kwarg(name) {
            Some(v) => v
                .as_int()
                .ok_or_else(|| Exception::type_error(format!("{name} must be an integer"))),
            None => Ok(current),
        }
    };
    let date = build_date(
        field("year", dt.year() as i64)?,
        field("month", dt.month() as i64)?,
        field("day", dt.day() as i64)?,
    )?;
    let time = build_time(
        field("hour", dt.hour() as i64)?,
        field("minute", dt.minute() as i64)?,
        field("second", dt.second() as i64)?,
        field("microsecond", (dt.nanosecond() / 1000) as i64)?,
    )?;
    Ok(date.and_time(time))
}

fn midnight(d: &NaiveDate) -> NaiveDateTime {
    d.and_time(NaiveTime::default())
}

/// Instance methods of the three date types.
pub fn method(n: &Arc<Native>, name: &str, args: Args) -> ExecResult<Value> {
    match (&**n, name) {
        (Native::DateTime(dt), "strftime") => {
            let fmt = text_arg(&args, 0, "format", "strftime")?;
            strftime(dt, &fmt).map(Value::str)
        }
        (Native::Date(d), "strftime") => {
            let fmt = text_arg(&args, 0, "format", "strftime")?;
            strftime(&midnight(d), &fmt).map(Value::str)
        }
        (Native::DateTime(dt), "isoformat") => {
            let sep = match args.arg(0, "sep") {
                Some(Value::Str(s)) => s.chars().next().unwrap_or('T'),
                _ => 'T',
            };
            Ok(Value::str(format_datetime(dt, sep)))
        }
        (Native::Date(d), "isoformat") => Ok(Value::str(d.format("%Y-%m-%d").to_string())),
        (Native::DateTime(dt), "date") => Ok(Value::native(Native::Date(dt.date()))),
        (Native::DateTime(dt), "weekday") => {
            Ok(Value::Int(dt.weekday().num_days_from_monday() as i64))
        }
        (Native::Date(d), "weekday") => Ok(Value::Int(d.weekday().num_days_from_monday() as i64)),
        (Native::DateTime(dt), "isoweekday") => {
            Ok(Value::Int(dt.weekday().number_from_monday() as i64))
        }
        (Native::Date(d), "isoweekday") => Ok(Value::Int(d.weekday().number_from_monday() as i64)),
        (Native::DateTime(dt), "timestamp") => {
            let utc = dt.and_utc();
            Ok(Value::Float(
                utc.timestamp() as f64 + utc.timestamp_subsec_micros() as f64 / 1e6,
            ))
        }
        (Native::DateTime(dt), "replace") => {
            Ok(Value::native(Native::DateTime(replace_datetime(dt, &args)?)))
        }
        (Native::Date(d), "replace") => {
            let replaced = replace_datetime(&midnight(d), &args)?;
            Ok(Value::native(Native::Date(replaced.date())))
        }
        (Native::TimeDelta(td), "total_seconds") => {
            args.check("total_seconds", 0, 0)?;
            let micros = td.num_microseconds().unwrap_or(i64::MAX);
            Ok(Value::Float(micros as f64 / 1e6))
        }
        (other, _) => Err(Exception::attribute_error(other.type_name(), name)),
    }
}

fn parse_iso(text: &str) -> Option<NaiveDateTime> {
    ISO_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(text, f).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .map(|d| midnight(&d))
        })
}

/// `datetime.strptime`: dates without a time component parse at midnight.
pub fn strptime(text: &str, pattern: &str) -> ExecResult<NaiveDateTime> {
    let translated = pattern.replace("%f", "%6f");
    NaiveDateTime::parse_from_str(text, &translated)
        .or_else(|_| NaiveDate::parse_from_str(text, &translated).map(|d| midnight(&d)))
        .map_err(|_| {
            Exception::value_error(format!(
                "time data '{text}' does not match format '{pattern}'"
            ))
        })
}

pub fn class_method(class: TypeObj, name: &str, args: Args) -> ExecResult<Value> {
    let datetime = |dt: NaiveDateTime| Ok(Value::native(Native::DateTime(dt)));
    let date = |d: NaiveDate| Ok(Value::native(Native::Date(d)));
    match (class, name) {
        (TypeObj::DateTime, "now" | "today") => datetime(chrono::Local::now().naive_local()),
        (TypeObj::DateTime, "utcnow") => datetime(chrono::Utc::now().naive_utc()),
        (TypeObj::Date, "today") => date(chrono::Local::now().date_naive()),
        (TypeObj::DateTime, "fromisoformat") | (TypeObj::Date, "fromisoformat") => {
            let text = text_arg(&args, 0, "date_string", "fromisoformat")?;
            let parsed = parse_iso(&text).ok_or_else(|| {
                Exception::value_error(format!("Invalid isoformat string: '{text}'"))
            })?;
            if class == TypeObj::Date {
                date(parsed.date())
            } else {
                datetime(parsed)
            }
        }
        (TypeObj::DateTime, "strptime") => {
            args.check("strptime", 2, 2)?;
            let text = text_arg(&args, 0, "date_string", "strptime")?;
            let pattern = text_arg(&args, 1, "format", "strptime")?;
            datetime(strptime(&text, &pattern)?)
        }
        (TypeObj::DateTime, "fromtimestamp") => {
            args.check("fromtimestamp", 1, 1)?;
            let ts = args.positional[0]
                .as_float()
                .ok_or_else(|| Exception::type_error("a number is required"))?;
            let secs = ts.floor();
            let nanos = ((ts - secs) * 1e9).round() as u32;
            let dt = chrono::DateTime::from_timestamp(secs as i64, nanos.min(999_999_999))
                .ok_or_else(|| Exception::value_error("timestamp out of range for platform"))?;
            datetime(dt.with_timezone(&chrono::Local).naive_local())
        }
        _ => Err(Exception::new(
            crate::sandbox::error::ExcType::AttributeError,
            format!("type object '{}' has no attribute '{name}'", class.name()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timedelta_units_combine() {
        let mut args = Args::new(vec![Value::Int(1)]);
        args.kwargs.insert("hours".into(), Value::Float(1.5));
        let td = timedelta_from_args(&args).unwrap();
        assert_eq!(timedelta_parts(&td), (1, 5400, 0));
    }

    #[test]
    fn test_negative_timedelta_normalizes() {
        let mut args = Args::default();
        args.kwargs.insert("seconds".into(), Value::Int(-1));
        let td = timedelta_from_args(&args).unwrap();
        assert_eq!(timedelta_parts(&td), (-1, 86_399, 0));
    }

    #[test]
    fn test_invalid_dates_are_value_errors() {
        assert!(build_date(2024, 2, 30).is_err());
        assert!(build_date(2024, 13, 1).is_err());
        assert!(build_date(2024, 2, 29).is_ok());
    }

    #[test]
    fn test_strptime_date_only_pattern() {
        let dt = strptime("2024-03-05", "%Y-%m-%d").unwrap();
        assert_eq!(format_datetime(&dt, ' '), "2024-03-05 00:00:00");
        assert!(strptime("05/03", "%Y-%m-%d").is_err());
    }

    #[test]
    fn test_parse_iso_variants() {
        assert!(parse_iso("2024-01-02T03:04:05").is_some());
        assert!(parse_iso("2024-01-02 03:04").is_some());
        assert!(parse_iso("2024-01-02").is_some());
        assert!(parse_iso("yesterday").is_none());
    }
}
