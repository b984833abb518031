//! Format-spec mini-language, `%`-interpolation and `strftime`.

use super::error::{ExecResult, Exception};
use super::ops::check_bytes;
use super::value::{float_repr, Native, Value};

#[derive(Debug, Default, Clone)]
struct Spec {
    fill: Option<char>,
    align: Option<char>,
    sign: Option<char>,
    alternate: bool,
    zero: bool,
    width: Option<usize>,
    grouping: Option<char>,
    precision: Option<usize>,
    kind: Option<char>,
}

fn parse_spec(spec: &str) -> ExecResult<Spec> {
    let chars: Vec<char> = spec.chars().collect();
    let mut out = Spec::default();
    let mut i = 0;
    let is_align = |c: char| matches!(c, '<' | '>' | '^' | '=');
    if chars.len() >= 2 && is_align(chars[1]) {
        out.fill = Some(chars[0]);
        out.align = Some(chars[1]);
        i = 2;
    } else if !chars.is_empty() && is_align(chars[0]) {
        out.align = Some(chars[0]);
        i = 1;
    }
    if let Some(&c) = chars.get(i) {
        if matches!(c, '+' | '-' | ' ') {
            out.sign = Some(c);
            i += 1;
        }
    }
    if chars.get(i) == Some(&'#') {
        out.alternate = true;
        i += 1;
    }
    if chars.get(i) == Some(&'0') {
        out.zero = true;
        i += 1;
    }
    let start = i;
    while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
        i += 1;
    }
    if i > start {
        out.width = Some(spec_number(&chars[start..i])?);
    }
    if let Some(&c) = chars.get(i) {
        if c == ',' || c == '_' {
            out.grouping = Some(c);
            i += 1;
        }
    }
    if chars.get(i) == Some(&'.') {
        i += 1;
        let start = i;
        while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
            i += 1;
        }
        if i == start {
            return Err(Exception::value_error("Format specifier missing precision"));
        }
        out.precision = Some(spec_number(&chars[start..i])?);
    }
    if let Some(&c) = chars.get(i) {
        out.kind = Some(c);
        i += 1;
    }
    if i != chars.len() {
        return Err(Exception::value_error("Invalid format specifier"));
    }
    Ok(out)
}

/// A width or precision; anything that would pad past the string cap is refused.
fn spec_number(digits: &[char]) -> ExecResult<usize> {
    let n: usize = digits
        .iter()
        .collect::<String>()
        .parse()
        .map_err(|_| Exception::value_error("Too many decimal digits in format string"))?;
    check_bytes(n)?;
    Ok(n)
}

/// `format(value, spec)` as used by f-strings.
pub fn format_value(value: &Value, spec: &str) -> ExecResult<String> {
    if spec.is_empty() {
        return Ok(value.to_str());
    }
    if let Value::Native(native) = value {
        match &**native {
            Native::DateTime(dt) => return strftime(dt, spec),
            Native::Date(d) => return strftime(&d.and_hms_opt(0, 0, 0).unwrap_or_default(), spec),
            _ => {}
        }
    }
    let spec = parse_spec(spec)?;
    match value {
        Value::Int(_) | Value::Bool(_) => {
            let n = value.as_int().unwrap_or(0);
            match spec.kind {
                Some('e' | 'E' | 'f' | 'F' | 'g' | 'G' | '%') => format_float(n as f64, &spec),
                _ => format_int(n, &spec),
            }
        }
        Value::Float(f) => format_float(*f, &spec),
        Value::Str(s) => {
            if !matches!(spec.kind, None | Some('s')) {
                return Err(unknown_code(spec.kind, "str"));
            }
            if spec.sign.is_some() {
                return Err(Exception::value_error(
                    "Sign not allowed in string format specifier",
                ));
            }
            let text: String = match spec.precision {
                Some(p) => s.chars().take(p).collect(),
                None => s.to_string(),
            };
            Ok(pad(&text, &spec, '<'))
        }
        other => {
            if !matches!(spec.kind, None | Some('s')) {
                return Err(unknown_code(spec.kind, other.type_name()));
            }
            Ok(pad(&other.to_str(), &spec, '<'))
        }
    }
}

fn unknown_code(kind: Option<char>, type_name: &str) -> Exception {
    Exception::value_error(format!(
        "Unknown format code '{}' for object of type '{type_name}'",
        kind.unwrap_or(' ')
    ))
}

fn format_int(n: i64, spec: &Spec) -> ExecResult<String> {
    if spec.precision.is_some() {
        return Err(Exception::value_error(
            "Precision not allowed in integer format specifier",
        ));
    }
    let magnitude = n.unsigned_abs();
    let (digits, prefix) = match spec.kind {
        None | Some('d' | 'n') => (magnitude.to_string(), ""),
        Some('b') => (format!("{magnitude:b}"), "0b"),
        Some('o') => (format!("{magnitude:o}"), "0o"),
        Some('x') => (format!("{magnitude:x}"), "0x"),
        Some('X') => (format!("{magnitude:X}"), "0X"),
        Some('c') => {
            let c = u32::try_from(n)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| Exception::new(super::error::ExcType::OverflowError, "%c arg not in range(0x110000)"))?;
            return Ok(pad(&c.to_string(), spec, '<'));
        }
        other => return Err(unknown_code(other, "int")),
    };
    let digits = match spec.grouping {
        Some(sep) => {
            let every = if matches!(spec.kind, None | Some('d' | 'n')) { 3 } else { 4 };
            group_digits(&digits, sep, every)
        }
        None => digits,
    };
    let prefix = if spec.alternate { prefix } else { "" };
    Ok(finish_number(n < 0, &format!("{prefix}{digits}"), spec))
}

fn format_float(f: f64, spec: &Spec) -> ExecResult<String> {
    let negative = f.is_sign_negative() && !f.is_nan();
    let magnitude = f.abs();
    let body = if !magnitude.is_finite() {
        let text = if magnitude.is_nan() { "nan" } else { "inf" };
        if matches!(spec.kind, Some('E' | 'F' | 'G')) {
            text.to_uppercase()
        } else {
            text.to_string()
        }
    } else {
        match spec.kind {
            Some('f' | 'F') => fixed(magnitude, spec.precision.unwrap_or(6), spec.alternate),
            Some('e') => exponent(magnitude, spec.precision.unwrap_or(6), false, spec.alternate),
            Some('E') => exponent(magnitude, spec.precision.unwrap_or(6), true, spec.alternate),
            Some('g') => general(magnitude, spec.precision.unwrap_or(6), false, spec.alternate, false),
            Some('G') => general(magnitude, spec.precision.unwrap_or(6), true, spec.alternate, false),
            Some('%') => format!("{}%", fixed(magnitude * 100.0, spec.precision.unwrap_or(6), spec.alternate)),
            None => match spec.precision {
                Some(p) => general(magnitude, p, false, spec.alternate, true),
                None => float_repr(magnitude),
            },
            other => return Err(unknown_code(other, "float")),
        }
    };
    let body = match spec.grouping {
        Some(sep) if magnitude.is_finite() => {
            let split = body
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(body.len());
            format!("{}{}", group_digits(&body[..split], sep, 3), &body[split..])
        }
        _ => body,
    };
    Ok(finish_number(negative, &body, spec))
}

pub fn fixed(f: f64, precision: usize, alternate: bool) -> String {
    let text = format!("{f:.precision$}");
    if alternate && precision == 0 {
        format!("{text}.")
    } else {
        text
    }
}

/// Exponent notation with a signed, at least two-digit exponent.
pub fn exponent(f: f64, precision: usize, upper: bool, alternate: bool) -> String {
    let text = format!("{f:.precision$e}");
    let (mantissa, exp) = text.split_once('e').unwrap_or((text.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    let mantissa = if alternate && precision == 0 {
        format!("{mantissa}.")
    } else {
        mantissa.to_string()
    };
    let marker = if upper { 'E' } else { 'e' };
    let sign = if exp < 0 { '-' } else { '+' };
    format!("{mantissa}{marker}{sign}{:02}", exp.abs())
}

fn general(f: f64, precision: usize, upper: bool, alternate: bool, keep_point: bool) -> String {
    let precision = precision.max(1);
    if f == 0.0 {
        return if keep_point { "0.0".into() } else if alternate { format!("{:.*}", precision - 1, 0.0) } else { "0".into() };
    }
    let probe = format!("{:.*e}", precision - 1, f);
    let exp: i32 = probe
        .split_once('e')
        .and_then(|(_, e)| e.parse().ok())
        .unwrap_or(0);
    if exp >= -4 && exp < precision as i32 {
        let decimals = (precision as i32 - 1 - exp).max(0) as usize;
        let mut text = format!("{f:.decimals$}");
        if !alternate {
            text = strip_zeros(&text);
        }
        if keep_point && !text.contains('.') {
            text.push_str(".0");
        }
        text
    } else {
        let text = exponent(f, precision - 1, upper, alternate);
        if alternate {
            return text;
        }
        let marker = if upper { 'E' } else { 'e' };
        match text.split_once(marker) {
            Some((mantissa, exp)) => format!("{}{marker}{exp}", strip_zeros(mantissa)),
            None => text,
        }
    }
}

fn strip_zeros(text: &str) -> String {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text.to_string()
    }
}

fn group_digits(digits: &str, sep: char, every: usize) -> String {
    let chars: Vec<char> = digits.chars().collect();
    let mut out = String::with_capacity(chars.len() + chars.len() / every);
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && (chars.len() - i) % every == 0 {
            out.push(sep);
        }
        out.push(*c);
    }
    out
}

fn finish_number(negative: bool, body: &str, spec: &Spec) -> String {
    let sign = if negative {
        "-"
    } else {
        match spec.sign {
            Some('+') => "+",
            Some(' ') => " ",
            _ => "",
        }
    };
    let zero_pad = spec.zero && spec.align.is_none() && spec.fill.is_none();
    if zero_pad || spec.align == Some('=') {
        let fill = if zero_pad { '0' } else { spec.fill.unwrap_or(' ') };
        let width = spec.width.unwrap_or(0);
        let used = sign.chars().count() + body.chars().count();
        let padding: String = std::iter::repeat(fill).take(width.saturating_sub(used)).collect();
        return format!("{sign}{padding}{body}");
    }
    pad(&format!("{sign}{body}"), spec, '>')
}

fn pad(text: &str, spec: &Spec, default_align: char) -> String {
    let width = spec.width.unwrap_or(0);
    let len = text.chars().count();
    if len >= width {
        return text.to_string();
    }
    let fill = spec.fill.unwrap_or(if spec.zero && spec.fill.is_none() && spec.align.is_none() {
        '0'
    } else {
        ' '
    });
    let total = width - len;
    let run = |n: usize| std::iter::repeat(fill).take(n).collect::<String>();
    match spec.align.unwrap_or(default_align) {
        '<' => format!("{text}{}", run(total)),
        '^' => format!("{}{text}{}", run(total / 2), run(total - total / 2)),
        _ => format!("{}{text}", run(total)),
    }
}

// ----------------------------------------------------------------------
// %-interpolation
// ----------------------------------------------------------------------

/// `template % args`.
pub fn percent_format(template: &str, args: &Value) -> ExecResult<String> {
    let positional: Vec<Value> = match args {
        Value::Tuple(items) => items.to_vec(),
        other => vec![other.clone()],
    };
    let mapping = match args {
        Value::Dict(d) => Some(d.clone()),
        _ => None,
    };
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::with_capacity(template.len());
    let mut next = 0usize;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        i += 1;
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut key = None;
        if chars.get(i) == Some(&'(') {
            let close = chars[i..]
                .iter()
                .position(|c| *c == ')')
                .ok_or_else(|| Exception::value_error("incomplete format key"))?;
            key = Some(chars[i + 1..i + close].iter().collect::<String>());
            i += close + 1;
        }
        let mut spec = Spec::default();
        while let Some(&flag) = chars.get(i) {
            match flag {
                '-' => spec.align = Some('<'),
                '+' => spec.sign = Some('+'),
                ' ' => spec.sign = spec.sign.or(Some(' ')),
                '0' => spec.zero = true,
                '#' => spec.alternate = true,
                _ => break,
            }
            i += 1;
        }
        let start = i;
        while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
            i += 1;
        }
        if i > start {
            spec.width = Some(spec_number(&chars[start..i])?);
        }
        if chars.get(i) == Some(&'.') {
            i += 1;
            let start = i;
            while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
                i += 1;
            }
            spec.precision = Some(if i > start { spec_number(&chars[start..i])? } else { 0 });
        }
        let Some(&conversion) = chars.get(i) else {
            return Err(Exception::value_error("incomplete format"));
        };
        i += 1;
        if conversion == '%' {
            out.push('%');
            continue;
        }
        if spec.align == Some('<') {
            spec.zero = false;
        }
        let value = match (&key, &mapping) {
            (Some(k), Some(map)) => map
                .lock()
                .get(&super::value::HashKey::Str(k.as_str().into()))
                .ok_or_else(|| Exception::key_error(Value::str(k.as_str())))?,
            (Some(_), None) => {
                return Err(Exception::type_error("format requires a mapping"));
            }
            (None, _) => {
                let value = positional.get(next).cloned().ok_or_else(|| {
                    Exception::type_error("not enough arguments for format string")
                })?;
                next += 1;
                value
            }
        };
        out.push_str(&percent_one(conversion, &value, &spec)?);
    }
    if mapping.is_none() && next < positional.len() {
        return Err(Exception::type_error(
            "not all arguments converted during string formatting",
        ));
    }
    Ok(out)
}

fn percent_one(conversion: char, value: &Value, spec: &Spec) -> ExecResult<String> {
    let number = |v: &Value| -> ExecResult<f64> {
        v.as_float().ok_or_else(|| {
            Exception::type_error(format!(
                "must be real number, not {}",
                v.type_name()
            ))
        })
    };
    let mut spec = spec.clone();
    match conversion {
        's' => Ok(pad(&truncate(&value.to_str(), spec.precision), &spec, '>')),
        'r' | 'a' => Ok(pad(&truncate(&value.repr(), spec.precision), &spec, '>')),
        'd' | 'i' | 'u' => {
            let n = match value {
                Value::Float(f) => f.trunc() as i64,
                other => other.as_int().ok_or_else(|| {
                    Exception::type_error(format!(
                        "%d format: a real number is required, not {}",
                        other.type_name()
                    ))
                })?,
            };
            spec.precision = None;
            format_int(n, &spec)
        }
        'x' | 'X' | 'o' => {
            let n = value.as_int().ok_or_else(|| {
                Exception::type_error(format!(
                    "%{conversion} format: an integer is required, not {}",
                    value.type_name()
                ))
            })?;
            spec.kind = Some(conversion);
            spec.precision = None;
            format_int(n, &spec)
        }
        'c' => match value {
            Value::Str(s) if s.chars().count() == 1 => Ok(pad(s, &spec, '>')),
            other => {
                spec.kind = Some('c');
                format_int(other.as_int().unwrap_or(0), &spec)
            }
        },
        'f' | 'F' | 'e' | 'E' | 'g' | 'G' => {
            spec.kind = Some(conversion);
            format_float(number(value)?, &spec)
        }
        other => Err(Exception::value_error(format!(
            "unsupported format character '{other}'"
        ))),
    }
}

fn truncate(text: &str, precision: Option<usize>) -> String {
    match precision {
        Some(p) => text.chars().take(p).collect(),
        None => text.to_string(),
    }
}

// ----------------------------------------------------------------------
// strftime
// ----------------------------------------------------------------------

/// `datetime.strftime`; `%f` renders microseconds.
pub fn strftime(dt: &chrono::NaiveDateTime, pattern: &str) -> ExecResult<String> {
    use chrono::format::{Item, StrftimeItems};
    use std::fmt::Write;
    let invalid = || Exception::value_error(format!("Invalid format string: '{pattern}'"));
    let translated = pattern.replace("%f", "%6f");
    if StrftimeItems::new(&translated).any(|item| matches!(item, Item::Error)) {
        return Err(invalid());
    }
    let mut out = String::new();
    write!(out, "{}", dt.format(&translated)).map_err(|_| invalid())?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(value: Value, spec: &str) -> String {
        format_value(&value, spec).unwrap()
    }

    #[test]
    fn test_float_specs() {
        assert_eq!(fmt(Value::Float(3.14159), ".2f"), "3.14");
        assert_eq!(fmt(Value::Float(1234567.891), ",.2f"), "1,234,567.89");
        assert_eq!(fmt(Value::Float(0.256), ".1%"), "25.6%");
        assert_eq!(fmt(Value::Float(12345.678), ".3e"), "1.235e+04");
        assert_eq!(fmt(Value::Float(0.00001234), "g"), "1.234e-05");
        assert_eq!(fmt(Value::Float(2.5), ".3"), "2.5");
        assert_eq!(fmt(Value::Float(-1.5), "+.1f"), "-1.5");
    }

    #[test]
    fn test_int_specs() {
        assert_eq!(fmt(Value::Int(42), "05d"), "00042");
        assert_eq!(fmt(Value::Int(255), "#x"), "0xff");
        assert_eq!(fmt(Value::Int(1234567), ","), "1,234,567");
        assert_eq!(fmt(Value::Int(-7), ">+6"), "    -7");
        assert_eq!(fmt(Value::Int(7), "+>6"), "+++++7");
        assert_eq!(fmt(Value::Int(5), "b"), "101");
        assert_eq!(fmt(Value::Int(3), ".2f"), "3.00");
    }

    #[test]
    fn test_string_alignment() {
        assert_eq!(fmt(Value::str("ab"), ">5"), "   ab");
        assert_eq!(fmt(Value::str("ab"), "*^6"), "**ab**");
        assert_eq!(fmt(Value::str("abcdef"), ".3"), "abc");
        assert!(format_value(&Value::str("x"), "d").is_err());
    }

    #[test]
    fn test_percent_format() {
        let args = Value::tuple(vec![Value::str("x"), Value::Int(3), Value::Float(2.5)]);
        assert_eq!(percent_format("%s=%d (%.2f)", &args).unwrap(), "x=3 (2.50)");
        assert_eq!(percent_format("100%%", &Value::tuple(vec![])).unwrap(), "100%");
        assert_eq!(percent_format("%5s|%-5s|", &Value::tuple(vec![Value::str("a"), Value::str("b")])).unwrap(), "    a|b    |");
        let map = Value::str_dict([("name", Value::str("bob"))]);
        assert_eq!(percent_format("hi %(name)s", &map).unwrap(), "hi bob");
        assert!(percent_format("%s %s", &Value::str("one")).is_err());
    }

    #[test]
    fn test_oversized_width_is_refused() {
        use crate::sandbox::error::ExcType;

        let err = format_value(&Value::Int(1), ">9223372036854775807").unwrap_err();
        assert_eq!(err.kind(), ExcType::MemoryError);
        let err = percent_format("%9223372036854775807d", &Value::Int(1)).unwrap_err();
        assert_eq!(err.kind(), ExcType::MemoryError);
        let err = format_value(&Value::Float(1.0), ".99999999999999999999f").unwrap_err();
        assert_eq!(err.kind(), ExcType::ValueError);
        assert_eq!(percent_format("%.f", &Value::Float(3.7)).unwrap(), "4");
    }

    #[test]
    fn test_strftime_microseconds() {
        let dt = chrono::NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_micro_opt(7, 8, 9, 42)
            .unwrap();
        assert_eq!(strftime(&dt, "%Y-%m-%d %H:%M:%S.%f").unwrap(), "2024-03-05 07:08:09.000042");
        assert!(strftime(&dt, "%Q").is_err());
    }
}
