//! `csv.reader` and `csv.DictReader`, read eagerly into lists.

use super::{func, module};
use crate::sandbox::error::{ExecResult, Exception};
use crate::sandbox::interpreter::Interpreter;
use crate::sandbox::methods;
use crate::sandbox::ops;
use crate::sandbox::value::{Args, DictData, Value};

pub fn module_value() -> Value {
    module(
        "csv",
        vec![
            ("reader", func("reader", csv_reader)),
            ("DictReader", func("DictReader", csv_dict_reader)),
        ],
    )
}

fn delimiter(args: &Args) -> ExecResult<char> {
    match args.kwarg("delimiter") {
        None => Ok(','),
        Some(Value::Str(s)) if s.chars().count() == 1 => Ok(s.chars().next().unwrap_or(',')),
        Some(_) => Err(Exception::type_error(
            "\"delimiter\" must be a 1-character string",
        )),
    }
}

/// Text of a `str`, a list of lines or a file-like object.
fn source_text(interp: &mut Interpreter, source: &Value) -> ExecResult<String> {
    match source {
        Value::Str(s) => Ok(s.to_string()),
        Value::List(_) | Value::Tuple(_) => {
            let lines = ops::collect(source)?
                .iter()
                .map(|line| {
                    line.as_str()
                        .map(|s| s.trim_end_matches(['\r', '\n']).to_string())
                        .ok_or_else(|| Exception::type_error("iterator should return strings"))
                })
                .collect::<ExecResult<Vec<_>>>()?;
            Ok(lines.join("\n"))
        }
        other => Ok(methods::call_method(interp, other, "read", Args::default())?.to_str()),
    }
}

/// Splits `text` into records, honouring quoted fields and doubled quotes.
pub fn parse(text: &str, delim: char) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut row_started = false;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    field.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(c);
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => {
                in_quotes = true;
                row_started = true;
            }
            '\r' => {}
            '\n' => {
                if row_started || !field.is_empty() || !row.is_empty() {
                    row.push(std::mem::take(&mut field));
                    rows.push(std::mem::take(&mut row));
                }
                row_started = false;
            }
            c if c == delim => {
                row.push(std::mem::take(&mut field));
                row_started = true;
            }
            c => {
                field.push(c);
                row_started = true;
            }
        }
    }
    if row_started || !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows
}

fn csv_reader(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("reader", 1, 2)?;
    let delim = delimiter(&args)?;
    let text = source_text(interp, &args.positional[0])?;
    Ok(Value::list(
        parse(&text, delim)
            .into_iter()
            .map(|row| Value::list(row.into_iter().map(Value::str).collect()))
            .collect(),
    ))
}

fn csv_dict_reader(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("DictReader", 1, 2)?;
    let delim = delimiter(&args)?;
    let text = source_text(interp, &args.positional[0])?;
    let mut rows = parse(&text, delim).into_iter();
    let fieldnames = match args.arg(1, "fieldnames").filter(|v| !v.is_none()) {
        Some(names) => ops::collect(&names)?.iter().map(Value::to_str).collect(),
        None => rows.next().unwrap_or_default(),
    };
    let restval = args.kwarg("restval").cloned().unwrap_or(Value::None);
    let mut out = Vec::new();
    for row in rows {
        let mut data = DictData::default();
        for (i, name) in fieldnames.iter().enumerate() {
            let value = row.get(i).map_or_else(|| restval.clone(), |s| Value::str(s.as_str()));
            data.insert_str(name, value);
        }
        if row.len() > fieldnames.len() {
            let extra = row[fieldnames.len()..]
                .iter()
                .map(|s| Value::str(s.as_str()))
                .collect();
            data.insert(Value::None, Value::list(extra))?;
        }
        out.push(Value::dict(data));
    }
    Ok(Value::list(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_handles_quotes_and_newlines() {
        let rows = parse("name,notes\n\"Smith, J\",\"said \"\"hi\"\"\nthen left\"\n", ',');
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][0], "Smith, J");
        assert_eq!(rows[1][1], "said \"hi\"\nthen left");
    }

    #[test]
    fn test_parse_keeps_empty_fields() {
        let rows = parse("a,,c\r\n,\n", ',');
        assert_eq!(rows, vec![vec!["a", "", "c"], vec!["", ""]]);
    }

    #[test]
    fn test_parse_custom_delimiter() {
        let rows = parse("x;y", ';');
        assert_eq!(rows, vec![vec!["x", "y"]]);
    }
}
