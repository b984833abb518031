//! The `json` module over `serde_json`, with the separators and escaping of
//! the source language's encoder.

use std::io;

use serde::Serialize;
use serde_json::ser::{Formatter, Serializer};
use serde_json::{Map, Number};

use super::{func, module, text_arg};
use crate::sandbox::error::{ExcType, ExecResult, Exception};
use crate::sandbox::interpreter::Interpreter;
use crate::sandbox::methods;
use crate::sandbox::value::{float_repr, Args, DictData, TypeObj, Value};

const MAX_DEPTH: usize = 200;

pub fn module_value() -> Value {
    module(
        "json",
        vec![
            ("dumps", func("dumps", json_dumps)),
            ("loads", func("loads", json_loads)),
            ("dump", func("dump", json_dump)),
            ("load", func("load", json_load)),
            (
                "JSONDecodeError",
                Value::Type(TypeObj::Exception(ExcType::ValueError)),
            ),
        ],
    )
}

/// Encoder options taken from keyword arguments.
#[derive(Debug, Clone, Default)]
pub struct DumpOptions {
    pub indent: Option<String>,
    pub sort_keys: bool,
    pub ensure_ascii: bool,
    pub default: Option<Value>,
}

impl DumpOptions {
    fn from_args(args: &Args) -> ExecResult<Self> {
        let indent = match args.kwarg("indent") {
            None | Some(Value::None) => None,
            Some(Value::Str(s)) => Some(s.to_string()),
            Some(v) => match v.as_int() {
                Some(n) => Some(" ".repeat(n.max(0) as usize)),
                None => return Err(Exception::type_error("indent must be an int or str")),
            },
        };
        Ok(Self {
            indent,
            sort_keys: args.kwarg("sort_keys").is_some_and(Value::truthy),
            ensure_ascii: args.kwarg("ensure_ascii").map_or(true, Value::truthy),
            default: args.kwarg("default").filter(|v| !v.is_none()).cloned(),
        })
    }
}

/// Item and key separators with optional indentation.
struct PyFormatter {
    indent: Option<Vec<u8>>,
    level: usize,
    has_value: bool,
    ensure_ascii: bool,
}

impl PyFormatter {
    fn newline<W: ?Sized + io::Write>(&self, writer: &mut W) -> io::Result<()> {
        if let Some(indent) = &self.indent {
            writer.write_all(b"\n")?;
            for _ in 0..self.level {
                writer.write_all(indent)?;
            }
        }
        Ok(())
    }

    fn separator<W: ?Sized + io::Write>(&self, writer: &mut W, first: bool) -> io::Result<()> {
        if !first {
            writer.write_all(if self.indent.is_some() { b"," } else { b", " })?;
        }
        self.newline(writer)
    }

    fn close<W: ?Sized + io::Write>(&mut self, writer: &mut W, bracket: &[u8]) -> io::Result<()> {
        self.level -= 1;
        if self.has_value {
            self.newline(writer)?;
        }
        self.has_value = true;
        writer.write_all(bracket)
    }
}

impl Formatter for PyFormatter {
    fn begin_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.level += 1;
        self.has_value = false;
        writer.write_all(b"[")
    }

    fn end_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.close(writer, b"]")
    }

    fn begin_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        self.separator(writer, first)
    }

    fn end_array_value<W: ?Sized + io::Write>(&mut self, _writer: &mut W) -> io::Result<()> {
        self.has_value = true;
        Ok(())
    }

    fn begin_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.level += 1;
        self.has_value = false;
        writer.write_all(b"{")
    }

    fn end_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.close(writer, b"}")
    }

    fn begin_object_key<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        self.separator(writer, first)
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }

    fn end_object_value<W: ?Sized + io::Write>(&mut self, _writer: &mut W) -> io::Result<()> {
        self.has_value = true;
        Ok(())
    }

    fn write_f64<W: ?Sized + io::Write>(&mut self, writer: &mut W, value: f64) -> io::Result<()> {
        writer.write_all(float_repr(value).as_bytes())
    }

    fn write_string_fragment<W: ?Sized + io::Write>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()> {
        if !self.ensure_ascii || fragment.is_ascii() {
            return writer.write_all(fragment.as_bytes());
        }
        let mut units = [0u16; 2];
        for c in fragment.chars() {
            if c.is_ascii() {
                writer.write_all(&[c as u8])?;
            } else {
                for unit in c.encode_utf16(&mut units) {
                    write!(writer, "\\u{unit:04x}")?;
                }
            }
        }
        Ok(())
    }
}

fn key_text(key: &Value) -> ExecResult<String> {
    Ok(match key {
        Value::Str(s) => s.to_string(),
        Value::Bool(b) => if *b { "true" } else { "false" }.to_string(),
        Value::None => "null".to_string(),
        Value::Int(n) => n.to_string(),
        Value::Float(f) => float_repr(*f),
        other => {
            return Err(Exception::type_error(format!(
                "keys must be str, int, float, bool or None, not {}",
                other.type_name()
            )))
        }
    })
}

/// Converts a sandbox value into a JSON document.
pub fn to_json(
    interp: &mut Interpreter,
    value: &Value,
    options: &DumpOptions,
    depth: usize,
) -> ExecResult<serde_json::Value> {
    if depth > MAX_DEPTH {
        return Err(Exception::value_error("Circular reference detected"));
    }
    Ok(match value {
        Value::None => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(n) => serde_json::Value::Number((*n).into()),
        Value::Float(f) => Number::from_f64(*f).map(serde_json::Value::Number).ok_or_else(|| {
            Exception::value_error("Out of range float values are not JSON compliant")
        })?,
        Value::Str(s) => serde_json::Value::String(s.to_string()),
        Value::List(_) | Value::Tuple(_) => {
            let items = crate::sandbox::ops::collect(value)?;
            let mut out = Vec::with_capacity(items.len());
            for item in &items {
                out.push(to_json(interp, item, options, depth + 1)?);
            }
            serde_json::Value::Array(out)
        }
        Value::Dict(d) => {
            let items = d.lock().items();
            let mut entries = Vec::with_capacity(items.len());
            for (k, v) in &items {
                entries.push((key_text(k)?, to_json(interp, v, options, depth + 1)?));
            }
            if options.sort_keys {
                entries.sort_by(|a, b| a.0.cmp(&b.0));
            }
            serde_json::Value::Object(entries.into_iter().collect::<Map<_, _>>())
        }
        other => match &options.default {
            Some(default) => {
                let replacement = interp.call1(default, other.clone())?;
                to_json(interp, &replacement, options, depth + 1)?
            }
            None => {
                return Err(Exception::type_error(format!(
                    "Object of type {} is not JSON serializable",
                    other.type_name()
                )))
            }
        },
    })
}

/// Renders a JSON document with the given options.
pub fn render(doc: &serde_json::Value, options: &DumpOptions) -> ExecResult<String> {
    let formatter = PyFormatter {
        indent: options.indent.as_ref().map(|s| s.as_bytes().to_vec()),
        level: 0,
        has_value: false,
        ensure_ascii: options.ensure_ascii,
    };
    let mut buf = Vec::new();
    let mut serializer = Serializer::with_formatter(&mut buf, formatter);
    doc.serialize(&mut serializer)
        .map_err(|e| Exception::value_error(e.to_string()))?;
    String::from_utf8(buf).map_err(|e| Exception::value_error(e.to_string()))
}

/// Converts a parsed JSON document into sandbox values.
pub fn from_json(doc: serde_json::Value) -> ExecResult<Value> {
    Ok(match doc {
        serde_json::Value::Null => Value::None,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::str(s),
        serde_json::Value::Array(items) => Value::list(
            items
                .into_iter()
                .map(from_json)
                .collect::<ExecResult<Vec<_>>>()?,
        ),
        serde_json::Value::Object(map) => {
            let mut data = DictData::default();
            for (k, v) in map {
                data.insert_str(&k, from_json(v)?);
            }
            Value::dict(data)
        }
    })
}

pub fn loads(text: &str) -> ExecResult<Value> {
    let doc: serde_json::Value =
        serde_json::from_str(text).map_err(|e| Exception::value_error(e.to_string()))?;
    from_json(doc)
}

fn json_dumps(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("dumps", 1, 1)?;
    let options = DumpOptions::from_args(&args)?;
    let doc = to_json(interp, &args.positional[0], &options, 0)?;
    render(&doc, &options).map(Value::str)
}

fn json_loads(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("loads", 1, 1)?;
    let text = text_arg(&args, 0, "s", "loads")?;
    loads(&text)
}

fn json_dump(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("dump", 2, 2)?;
    let options = DumpOptions::from_args(&args)?;
    let doc = to_json(interp, &args.positional[0], &options, 0)?;
    let text = render(&doc, &options)?;
    let target = args.positional[1].clone();
    methods::call_method(interp, &target, "write", Args::new(vec![Value::str(text)]))?;
    Ok(Value::None)
}

fn json_load(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("load", 1, 1)?;
    let source = args.positional[0].clone();
    let text = methods::call_method(interp, &source, "read", Args::default())?;
    loads(&text.to_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dumps(doc: serde_json::Value, options: DumpOptions) -> String {
        render(&doc, &options).unwrap()
    }

    fn ascii() -> DumpOptions {
        DumpOptions {
            ensure_ascii: true,
            ..DumpOptions::default()
        }
    }

    #[test]
    fn test_compact_separators_have_spaces() {
        let out = dumps(json!({"a": [1, 2], "b": null}), ascii());
        assert_eq!(out, r#"{"a": [1, 2], "b": null}"#);
    }

    #[test]
    fn test_indented_output() {
        let options = DumpOptions {
            indent: Some("  ".into()),
            ..ascii()
        };
        let out = dumps(json!({"a": [1], "e": {}}), options);
        assert_eq!(out, "{\n  \"a\": [\n    1\n  ],\n  \"e\": {}\n}");
    }

    #[test]
    fn test_ensure_ascii_escapes() {
        assert_eq!(dumps(json!("é😀"), ascii()), r#""\u00e9\ud83d\ude00""#);
        assert_eq!(dumps(json!("é"), DumpOptions::default()), "\"é\"");
    }

    #[test]
    fn test_float_rendering() {
        assert_eq!(dumps(json!(1.0), ascii()), "1.0");
        assert_eq!(dumps(json!(1e20), ascii()), "1e+20");
    }

    #[test]
    fn test_loads_numbers_and_order() {
        let value = loads(r#"{"z": 1, "a": 2.5, "big": 18446744073709551615}"#).unwrap();
        assert_eq!(value.repr(), "{'z': 1, 'a': 2.5, 'big': 1.8446744073709552e+19}");
    }

    #[test]
    fn test_loads_error_is_value_error() {
        let err = loads("{bad").unwrap_err();
        assert_eq!(err.kind(), ExcType::ValueError);
    }
}
