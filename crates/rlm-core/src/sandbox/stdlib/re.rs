//! The `re` module on top of the `regex` crate.
//!
//! Offsets reported to sandboxed code are character positions; the match
//! keeps byte spans internally.

use std::sync::Arc;

use regex::{Captures, Regex};

use super::{func, module, text_arg};
use crate::sandbox::error::{ExcType, ExecResult, Exception};
use crate::sandbox::interpreter::Interpreter;
use crate::sandbox::value::{Args, DictData, Native, Value};

pub const IGNORECASE: i64 = 2;
pub const MULTILINE: i64 = 8;
pub const DOTALL: i64 = 16;
pub const VERBOSE: i64 = 64;
pub const ASCII: i64 = 256;

pub const PATTERN_METHODS: &[&str] = &[
    "search", "match", "fullmatch", "findall", "finditer", "sub", "subn", "split",
];
pub const PATTERN_PROPERTIES: &[&str] = &["pattern", "flags", "groups", "groupindex"];
pub const MATCH_METHODS: &[&str] = &["group", "groups", "groupdict", "start", "end", "span"];
pub const MATCH_PROPERTIES: &[&str] = &["string", "re", "lastindex"];

/// A compiled pattern with its anchored variants.
pub struct RegexPattern {
    pub source: String,
    pub flags: i64,
    regex: Regex,
    anchored: Regex,
    full: Regex,
}

impl RegexPattern {
    pub fn compile(source: &str, flags: i64) -> ExecResult<Self> {
        let translated = translate(source, flags);
        let build = |text: &str| {
            Regex::new(text).map_err(|e| {
                Exception::new(ExcType::ValueError, format!("re.error: {e}"))
            })
        };
        Ok(Self {
            source: source.to_string(),
            flags,
            regex: build(&translated)?,
            anchored: build(&format!(r"\A(?:{translated})"))?,
            full: build(&format!(r"\A(?:{translated})\z"))?,
        })
    }

    fn group_count(&self) -> usize {
        self.regex.captures_len() - 1
    }

    fn group_names(&self) -> Vec<(String, usize)> {
        self.regex
            .capture_names()
            .enumerate()
            .filter_map(|(i, n)| n.map(|n| (n.to_string(), i)))
            .collect()
    }
}

/// Rewrites the few constructs whose spelling differs from `regex` syntax.
fn translate(source: &str, flags: i64) -> String {
    let mut out = String::with_capacity(source.len() + 8);
    let mut inline = String::new();
    if flags & IGNORECASE != 0 {
        inline.push('i');
    }
    if flags & MULTILINE != 0 {
        inline.push('m');
    }
    if flags & DOTALL != 0 {
        inline.push('s');
    }
    if flags & VERBOSE != 0 {
        inline.push('x');
    }
    if !inline.is_empty() {
        out.push_str(&format!("(?{inline})"));
    }
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                if chars[i + 1] == 'Z' {
                    out.push_str(r"\z");
                } else {
                    out.push('\\');
                    out.push(chars[i + 1]);
                }
                i += 2;
                continue;
            }
            '{' if !is_repetition(&chars[i..]) => out.push_str(r"\{"),
            c => out.push(c),
        }
        i += 1;
    }
    out
}

fn is_repetition(rest: &[char]) -> bool {
    let Some(close) = rest.iter().position(|c| *c == '}') else {
        return false;
    };
    let body: String = rest[1..close].iter().collect();
    let mut parts = body.splitn(2, ',');
    let low = parts.next().unwrap_or_default();
    let high = parts.next();
    !low.is_empty()
        && low.chars().all(|c| c.is_ascii_digit())
        && high.map_or(true, |h| h.chars().all(|c| c.is_ascii_digit()))
}

/// A successful match.
#[derive(Clone)]
pub struct MatchData {
    text: Arc<str>,
    spans: Vec<Option<(usize, usize)>>,
    pattern: Arc<RegexPattern>,
}

impl MatchData {
    fn from_captures(pattern: &Arc<RegexPattern>, text: &Arc<str>, caps: &Captures<'_>) -> Self {
        Self {
            text: text.clone(),
            spans: (0..caps.len())
                .map(|i| caps.get(i).map(|m| (m.start(), m.end())))
                .collect(),
            pattern: pattern.clone(),
        }
    }

    fn char_offset(&self, byte: usize) -> usize {
        self.text[..byte].chars().count()
    }

    /// Character span of group `i`.
    pub fn span(&self, i: usize) -> Option<(usize, usize)> {
        self.spans
            .get(i)
            .copied()
            .flatten()
            .map(|(s, e)| (self.char_offset(s), self.char_offset(e)))
    }

    pub fn group_text(&self, i: usize) -> Option<String> {
        self.spans
            .get(i)
            .copied()
            .flatten()
            .map(|(s, e)| self.text[s..e].to_string())
    }

    fn group_index(&self, key: &Value) -> ExecResult<usize> {
        let index = match key {
            Value::Str(name) => self
                .pattern
                .group_names()
                .into_iter()
                .find(|(n, _)| n.as_str() == &**name)
                .map(|(_, i)| i),
            other => other.as_int().and_then(|n| usize::try_from(n).ok()),
        };
        index
            .filter(|i| *i < self.spans.len())
            .ok_or_else(|| Exception::index_error("no such group"))
    }

    fn group_value(&self, i: usize, default: &Value) -> Value {
        self.group_text(i).map(Value::str).unwrap_or_else(|| default.clone())
    }
}

/// `m[index]`.
pub fn match_group(m: &MatchData, index: &Value) -> ExecResult<Value> {
    let i = m.group_index(index)?;
    Ok(m.group_value(i, &Value::None))
}

pub fn pattern_property(p: &Arc<RegexPattern>, name: &str) -> Option<Value> {
    match name {
        "pattern" => Some(Value::str(p.source.as_str())),
        "flags" => Some(Value::Int(p.flags)),
        "groups" => Some(Value::Int(p.group_count() as i64)),
        "groupindex" => Some(Value::str_dict(
            p.group_names()
                .into_iter()
                .map(|(n, i)| (n, Value::Int(i as i64))),
        )),
        _ => None,
    }
}

pub fn match_property(m: &MatchData, name: &str) -> Option<Value> {
    match name {
        "string" => Some(Value::Str(m.text.clone())),
        "re" => Some(Value::native(Native::Pattern(m.pattern.clone()))),
        "lastindex" => Some(
            (1..m.spans.len())
                .rev()
                .find(|i| m.spans[*i].is_some())
                .map_or(Value::None, |i| Value::Int(i as i64)),
        ),
        _ => None,
    }
}

pub fn module_value() -> Value {
    module(
        "re",
        vec![
            ("compile", func("compile", re_compile)),
            ("search", func("search", re_search)),
            ("match", func("match", re_match)),
            ("fullmatch", func("fullmatch", re_fullmatch)),
            ("findall", func("findall", re_findall)),
            ("finditer", func("finditer", re_finditer)),
            ("sub", func("sub", re_sub)),
            ("subn", func("subn", re_subn)),
            ("split", func("split", re_split)),
            ("escape", func("escape", re_escape)),
            ("I", Value::Int(IGNORECASE)),
            ("IGNORECASE", Value::Int(IGNORECASE)),
            ("M", Value::Int(MULTILINE)),
            ("MULTILINE", Value::Int(MULTILINE)),
            ("S", Value::Int(DOTALL)),
            ("DOTALL", Value::Int(DOTALL)),
            ("X", Value::Int(VERBOSE)),
            ("VERBOSE", Value::Int(VERBOSE)),
            ("A", Value::Int(ASCII)),
            ("ASCII", Value::Int(ASCII)),
        ],
    )
}

fn flags_arg(args: &Args, index: usize) -> ExecResult<i64> {
    match args.arg(index, "flags") {
        None => Ok(0),
        Some(v) => v
            .as_int()
            .ok_or_else(|| Exception::type_error("flags must be an integer")),
    }
}

fn pattern_arg(value: &Value, flags: i64) -> ExecResult<Arc<RegexPattern>> {
    match value {
        Value::Str(source) => Ok(Arc::new(RegexPattern::compile(source, flags)?)),
        Value::Native(n) => match &**n {
            Native::Pattern(p) if flags == 0 => Ok(p.clone()),
            Native::Pattern(_) => Err(Exception::value_error(
                "cannot process flags argument with a compiled pattern",
            )),
            _ => Err(Exception::type_error("first argument must be string or compiled pattern")),
        },
        _ => Err(Exception::type_error("first argument must be string or compiled pattern")),
    }
}

/// Splits module-level arguments into the pattern and the remaining
/// arguments the pattern method expects.
fn module_call(args: Args, name: &str, method_arity: usize) -> ExecResult<(Arc<RegexPattern>, Args)> {
    args.check(name, 1 + method_arity.min(1), 1 + method_arity + 1)?;
    let flags_index = 1 + method_arity;
    let flags = flags_arg(&args, flags_index)?;
    let pattern = pattern_arg(&args.positional[0], flags)?;
    let mut rest = Args::new(
        args.positional
            .iter()
            .skip(1)
            .take(method_arity)
            .cloned()
            .collect(),
    );
    rest.kwargs = args.kwargs.clone();
    rest.kwargs.shift_remove("flags");
    Ok((pattern, rest))
}

fn re_compile(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("compile", 1, 2)?;
    let flags = flags_arg(&args, 1)?;
    let pattern = pattern_arg(&args.positional[0], flags)?;
    Ok(Value::native(Native::Pattern(pattern)))
}

fn re_search(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let (p, rest) = module_call(args, "search", 1)?;
    pattern_method(interp, &p, "search", rest)
}

fn re_match(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let (p, rest) = module_call(args, "match", 1)?;
    pattern_method(interp, &p, "match", rest)
}

fn re_fullmatch(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let (p, rest) = module_call(args, "fullmatch", 1)?;
    pattern_method(interp, &p, "fullmatch", rest)
}

fn re_findall(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let (p, rest) = module_call(args, "findall", 1)?;
    pattern_method(interp, &p, "findall", rest)
}

fn re_finditer(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    let (p, rest) = module_call(args, "finditer", 1)?;
    pattern_method(interp, &p, "finditer", rest)
}

fn re_sub(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("sub", 3, 5)?;
    let flags = flags_arg(&args, 4)?;
    let p = pattern_arg(&args.positional[0], flags)?;
    let count = args.arg(3, "count").unwrap_or(Value::Int(0));
    let rest = Args::new(vec![
        args.positional[1].clone(),
        args.positional[2].clone(),
        count,
    ]);
    pattern_method(interp, &p, "sub", rest)
}

fn re_subn(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("subn", 3, 5)?;
    let flags = flags_arg(&args, 4)?;
    let p = pattern_arg(&args.positional[0], flags)?;
    let count = args.arg(3, "count").unwrap_or(Value::Int(0));
    let rest = Args::new(vec![
        args.positional[1].clone(),
        args.positional[2].clone(),
        count,
    ]);
    pattern_method(interp, &p, "subn", rest)
}

fn re_split(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("split", 2, 4)?;
    let flags = flags_arg(&args, 3)?;
    let p = pattern_arg(&args.positional[0], flags)?;
    let maxsplit = args.arg(2, "maxsplit").unwrap_or(Value::Int(0));
    let rest = Args::new(vec![args.positional[1].clone(), maxsplit]);
    pattern_method(interp, &p, "split", rest)
}

/// Backslash-escapes every character with a special meaning.
pub fn escape(text: &str) -> String {
    const SPECIAL: &str = "()[]{}?*+-|^$\\.&~# \t\n\r\x0b\x0c";
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if SPECIAL.contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn re_escape(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("escape", 1, 1)?;
    let text = text_arg(&args, 0, "pattern", "escape")?;
    Ok(Value::str(escape(&text)))
}

fn match_value(p: &Arc<RegexPattern>, text: &Arc<str>, caps: &Captures<'_>) -> Value {
    Value::native(Native::Match(MatchData::from_captures(p, text, caps)))
}

fn count_arg(args: &Args, index: usize, name: &str) -> ExecResult<usize> {
    match args.arg(index, name) {
        None => Ok(0),
        Some(v) => v
            .as_int()
            .map(|n| n.max(0) as usize)
            .ok_or_else(|| Exception::type_error(format!("{name} must be an integer"))),
    }
}

/// `pattern.<name>(*args)`.
pub fn pattern_method(
    interp: &mut Interpreter,
    p: &Arc<RegexPattern>,
    name: &str,
    args: Args,
) -> ExecResult<Value> {
    match name {
        "search" | "match" | "fullmatch" => {
            args.check(name, 1, 1)?;
            let text = text_arg(&args, 0, "string", name)?;
            let regex = match name {
                "search" => &p.regex,
                "match" => &p.anchored,
                _ => &p.full,
            };
            Ok(regex
                .captures(&text)
                .map_or(Value::None, |caps| match_value(p, &text, &caps)))
        }
        "findall" => {
            args.check(name, 1, 1)?;
            let text = text_arg(&args, 0, "string", name)?;
            let groups = p.group_count();
            let mut out = Vec::new();
            for caps in p.regex.captures_iter(&text) {
                interp.tick()?;
                let group = |i: usize| Value::str(caps.get(i).map_or("", |m| m.as_str()));
                out.push(match groups {
                    0 => group(0),
                    1 => group(1),
                    n => Value::tuple((1..=n).map(group).collect()),
                });
            }
            Ok(Value::list(out))
        }
        "finditer" => {
            args.check(name, 1, 1)?;
            let text = text_arg(&args, 0, "string", name)?;
            let mut out = Vec::new();
            for caps in p.regex.captures_iter(&text) {
                interp.tick()?;
                out.push(match_value(p, &text, &caps));
            }
            Ok(Value::list(out))
        }
        "sub" | "subn" => {
            args.check(name, 2, 3)?;
            let repl = args.positional[0].clone();
            let text = text_arg(&args, 1, "string", name)?;
            let count = count_arg(&args, 2, "count")?;
            let (result, n) = substitute(interp, p, &repl, &text, count)?;
            if name == "sub" {
                Ok(Value::str(result))
            } else {
                Ok(Value::tuple(vec![Value::str(result), Value::Int(n as i64)]))
            }
        }
        "split" => {
            args.check(name, 1, 2)?;
            let text = text_arg(&args, 0, "string", name)?;
            let maxsplit = count_arg(&args, 1, "maxsplit")?;
            let mut out = Vec::new();
            let mut last = 0;
            for (n, caps) in p.regex.captures_iter(&text).enumerate() {
                if maxsplit > 0 && n >= maxsplit {
                    break;
                }
                interp.tick()?;
                let Some(whole) = caps.get(0) else { continue };
                out.push(Value::str(&text[last..whole.start()]));
                for i in 1..caps.len() {
                    out.push(caps.get(i).map_or(Value::None, |m| Value::str(m.as_str())));
                }
                last = whole.end();
            }
            out.push(Value::str(&text[last..]));
            Ok(Value::list(out))
        }
        _ => Err(Exception::attribute_error("re.Pattern", name)),
    }
}

fn substitute(
    interp: &mut Interpreter,
    p: &Arc<RegexPattern>,
    repl: &Value,
    text: &Arc<str>,
    count: usize,
) -> ExecResult<(String, usize)> {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    let mut replaced = 0;
    for caps in p.regex.captures_iter(text) {
        if count > 0 && replaced >= count {
            break;
        }
        interp.tick()?;
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&text[last..whole.start()]);
        match repl {
            Value::Str(template) => expand_template(p, template, &caps, &mut out)?,
            func if func.is_callable() => {
                let m = match_value(p, text, &caps);
                let piece = interp.call1(func, m)?;
                out.push_str(&piece.to_str());
            }
            other => {
                return Err(Exception::type_error(format!(
                    "expected str instance, {} found",
                    other.type_name()
                )))
            }
        }
        last = whole.end();
        replaced += 1;
    }
    out.push_str(&text[last..]);
    Ok((out, replaced))
}

/// Expands `\1`, `\g<name>` and character escapes in a replacement string.
fn expand_template(
    p: &RegexPattern,
    template: &str,
    caps: &Captures<'_>,
    out: &mut String,
) -> ExecResult<()> {
    let bad_group = |g: &str| Exception::new(ExcType::IndexError, format!("invalid group reference {g}"));
    let push_group = |out: &mut String, index: usize| -> ExecResult<()> {
        if index >= caps.len() {
            return Err(bad_group(&index.to_string()));
        }
        if let Some(m) = caps.get(index) {
            out.push_str(m.as_str());
        }
        Ok(())
    };
    let chars: Vec<char> = template.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c != '\\' || i + 1 == chars.len() {
            out.push(c);
            i += 1;
            continue;
        }
        let next = chars[i + 1];
        i += 2;
        match next {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            '\\' => out.push('\\'),
            'g' if chars.get(i) == Some(&'<') => {
                let Some(close) = chars[i..].iter().position(|c| *c == '>') else {
                    return Err(Exception::value_error("missing >, unterminated name"));
                };
                let name: String = chars[i + 1..i + close].iter().collect();
                i += close + 1;
                let index = match name.parse::<usize>() {
                    Ok(n) => n,
                    Err(_) => p
                        .group_names()
                        .into_iter()
                        .find(|(n, _)| *n == name)
                        .map(|(_, idx)| idx)
                        .ok_or_else(|| bad_group(&name))?,
                };
                push_group(out, index)?;
            }
            d if d.is_ascii_digit() => {
                let mut digits = d.to_string();
                if let Some(second) = chars.get(i).filter(|c| c.is_ascii_digit()) {
                    digits.push(*second);
                    i += 1;
                }
                let index = digits.parse::<usize>().unwrap_or(0);
                push_group(out, index)?;
            }
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    Ok(())
}

/// `match.<name>(*args)`.
pub fn match_method(m: &MatchData, name: &str, args: Args) -> ExecResult<Value> {
    let default = args.kwarg("default").cloned().unwrap_or(Value::None);
    match name {
        "group" => {
            if args.positional.is_empty() {
                return Ok(m.group_value(0, &Value::None));
            }
            let values = args
                .positional
                .iter()
                .map(|key| m.group_index(key).map(|i| m.group_value(i, &Value::None)))
                .collect::<ExecResult<Vec<_>>>()?;
            Ok(if values.len() == 1 {
                values.into_iter().next().unwrap_or(Value::None)
            } else {
                Value::tuple(values)
            })
        }
        "groups" => {
            let default = args.get(0).cloned().unwrap_or(default);
            Ok(Value::tuple(
                (1..m.spans.len()).map(|i| m.group_value(i, &default)).collect(),
            ))
        }
        "groupdict" => {
            let default = args.get(0).cloned().unwrap_or(default);
            let mut data = DictData::default();
            for (group, index) in m.pattern.group_names() {
                data.insert_str(&group, m.group_value(index, &default));
            }
            Ok(Value::dict(data))
        }
        "start" | "end" | "span" => {
            args.check(name, 0, 1)?;
            let index = match args.get(0) {
                Some(key) => m.group_index(key)?,
                None => 0,
            };
            let (start, end) = m
                .span(index)
                .map_or((-1, -1), |(s, e)| (s as i64, e as i64));
            Ok(match name {
                "start" => Value::Int(start),
                "end" => Value::Int(end),
                _ => Value::tuple(vec![Value::Int(start), Value::Int(end)]),
            })
        }
        _ => Err(Exception::attribute_error("re.Match", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_python_spellings() {
        assert_eq!(translate(r"abc\Z", 0), r"abc\z");
        assert_eq!(translate(r"{name}", 0), r"\{name}");
        assert_eq!(translate(r"a{2,3}", IGNORECASE), r"(?i)a{2,3}");
    }

    #[test]
    fn test_match_spans_are_character_offsets() {
        let p = Arc::new(RegexPattern::compile(r"(\d+)", 0).unwrap());
        let text: Arc<str> = Arc::from("héllo 42");
        let caps = p.regex.captures(&text).unwrap();
        let m = MatchData::from_captures(&p, &text, &caps);
        assert_eq!(m.span(1), Some((6, 8)));
        assert_eq!(m.group_text(1).as_deref(), Some("42"));
    }

    #[test]
    fn test_anchored_variants() {
        let p = RegexPattern::compile("a|ab", 0).unwrap();
        assert!(p.full.is_match("ab"));
        assert!(!p.anchored.is_match("cab"));
        assert!(p.regex.is_match("cab"));
    }

    #[test]
    fn test_escape_special_characters() {
        assert_eq!(escape("1+1=2?"), r"1\+1=2\?");
        assert_eq!(escape("a b"), r"a\ b");
    }

    #[test]
    fn test_invalid_pattern_is_value_error() {
        let err = RegexPattern::compile("(unclosed", 0).err().unwrap();
        assert_eq!(err.kind(), ExcType::ValueError);
        assert!(err.message().starts_with("re.error"));
    }
}
