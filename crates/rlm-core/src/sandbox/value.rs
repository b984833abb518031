//! Runtime values of the sandbox language.
//!
//! Containers are shared (`Arc<Mutex<..>>`) so aliasing behaves like the
//! source language. Code that walks a container clones its contents out of the
//! lock first; no lock is held while calling back into the interpreter.

use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use super::ast::FunctionDef;
use super::error::{ExcType, ExceptionValue, ExecResult, Exception};
use super::guards::GuardHook;
use super::interpreter::Interpreter;
use super::stdlib::io::{FileHandle, TextBuffer};
use super::stdlib::re::{MatchData, RegexPattern};
use crate::tools::ToolKind;

/// Maximum nesting followed by `repr` and equality before giving up.
const MAX_DEPTH: usize = 48;

pub type Scope = Arc<Mutex<IndexMap<String, Value>>>;
pub type ListRef = Arc<Mutex<Vec<Value>>>;
pub type DictRef = Arc<Mutex<DictData>>;
pub type SetRef = Arc<Mutex<SetData>>;

pub type BuiltinFn = fn(&mut Interpreter, Args) -> ExecResult<Value>;

#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    List(ListRef),
    Tuple(Arc<Vec<Value>>),
    Dict(DictRef),
    Set(SetRef),
    Range(RangeValue),
    Slice(Option<i64>, Option<i64>, Option<i64>),
    Ellipsis,
    Function(Arc<Function>),
    Builtin(Builtin),
    Method(Arc<BoundMethod>),
    Type(TypeObj),
    Exception(Arc<ExceptionValue>),
    Module(Arc<Module>),
    Native(Arc<Native>),
    Hook(GuardHook),
    Tool(ToolKind),
}

/// A user-defined function or lambda.
pub struct Function {
    pub def: Arc<FunctionDef>,
    /// Defaults for the trailing positional parameters, in order.
    pub defaults: Vec<Value>,
    pub kw_defaults: IndexMap<String, Value>,
    /// Enclosing function scopes, outermost first.
    pub closure: Vec<Scope>,
}

#[derive(Clone, Copy)]
pub struct Builtin {
    pub name: &'static str,
    pub func: BuiltinFn,
}

pub struct BoundMethod {
    pub receiver: Value,
    pub name: Arc<str>,
}

pub struct Module {
    pub name: String,
    pub attrs: IndexMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeValue {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl RangeValue {
    fn len_wide(&self) -> i128 {
        let (start, stop, step) = (self.start as i128, self.stop as i128, self.step as i128);
        let span = if step > 0 { stop - start } else { start - stop };
        if span <= 0 {
            return 0;
        }
        let step = step.abs();
        (span + step - 1) / step
    }

    /// Item count, saturating at `usize::MAX` for iteration.
    pub fn len(&self) -> usize {
        usize::try_from(self.len_wide()).unwrap_or(usize::MAX)
    }

    /// Item count as `len()` reports it; counts past `i64::MAX` overflow.
    pub fn checked_len(&self) -> ExecResult<usize> {
        i64::try_from(self.len_wide())
            .ok()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| {
                Exception::new(
                    ExcType::OverflowError,
                    "Python int too large to convert to C ssize_t",
                )
            })
    }

    pub fn is_empty(&self) -> bool {
        self.len_wide() == 0
    }

    pub fn get(&self, index: usize) -> Option<i64> {
        let index = i128::try_from(index).ok()?;
        if index >= self.len_wide() {
            return None;
        }
        i64::try_from(self.start as i128 + self.step as i128 * index).ok()
    }
}

/// Class objects: constructors and `isinstance` targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeObj {
    Int,
    Float,
    Str,
    Bool,
    List,
    Dict,
    Tuple,
    Set,
    Range,
    NoneType,
    Object,
    Exception(ExcType),
    DateTime,
    Date,
    TimeDelta,
    Path,
    StringIO,
    Counter,
    DefaultDict,
    OrderedDict,
}

impl TypeObj {
    pub fn name(self) -> &'static str {
        match self {
            TypeObj::Int => "int",
            TypeObj::Float => "float",
            TypeObj::Str => "str",
            TypeObj::Bool => "bool",
            TypeObj::List => "list",
            TypeObj::Dict => "dict",
            TypeObj::Tuple => "tuple",
            TypeObj::Set => "set",
            TypeObj::Range => "range",
            TypeObj::NoneType => "NoneType",
            TypeObj::Object => "object",
            TypeObj::Exception(kind) => kind.name(),
            TypeObj::DateTime => "datetime",
            TypeObj::Date => "date",
            TypeObj::TimeDelta => "timedelta",
            TypeObj::Path => "PosixPath",
            TypeObj::StringIO => "StringIO",
            TypeObj::Counter => "Counter",
            TypeObj::DefaultDict => "defaultdict",
            TypeObj::OrderedDict => "OrderedDict",
        }
    }

    /// `isinstance(value, self)`.
    pub fn matches(self, value: &Value) -> bool {
        match (self, value) {
            (TypeObj::Object, _) => true,
            (TypeObj::Int, Value::Int(_) | Value::Bool(_)) => true,
            (TypeObj::Float, Value::Float(_)) => true,
            (TypeObj::Str, Value::Str(_)) => true,
            (TypeObj::Bool, Value::Bool(_)) => true,
            (TypeObj::List, Value::List(_)) => true,
            (TypeObj::Tuple, Value::Tuple(_)) => true,
            (TypeObj::Set, Value::Set(_)) => true,
            (TypeObj::Range, Value::Range(_)) => true,
            (TypeObj::NoneType, Value::None) => true,
            (TypeObj::Dict, Value::Dict(_)) => true,
            (TypeObj::Counter, Value::Dict(d)) => matches!(d.lock().flavor, DictFlavor::Counter),
            (TypeObj::DefaultDict, Value::Dict(d)) => {
                matches!(d.lock().flavor, DictFlavor::Default(_))
            }
            (TypeObj::OrderedDict, Value::Dict(d)) => {
                matches!(d.lock().flavor, DictFlavor::Ordered)
            }
            (TypeObj::Exception(kind), Value::Exception(exc)) => exc.kind.is_subclass_of(kind),
            (TypeObj::DateTime, Value::Native(n)) => matches!(**n, Native::DateTime(_)),
            (TypeObj::Date, Value::Native(n)) => {
                matches!(**n, Native::Date(_) | Native::DateTime(_))
            }
            (TypeObj::TimeDelta, Value::Native(n)) => matches!(**n, Native::TimeDelta(_)),
            (TypeObj::Path, Value::Native(n)) => matches!(**n, Native::Path(_)),
            (TypeObj::StringIO, Value::Native(n)) => matches!(**n, Native::StringIO(_)),
            _ => false,
        }
    }
}

/// Host objects exposed through the utility modules.
pub enum Native {
    Path(PathBuf),
    DateTime(chrono::NaiveDateTime),
    Date(chrono::NaiveDate),
    TimeDelta(chrono::Duration),
    Pattern(Arc<RegexPattern>),
    Match(MatchData),
    StringIO(Mutex<TextBuffer>),
    File(Mutex<FileHandle>),
}

impl Native {
    pub fn type_name(&self) -> &'static str {
        match self {
            Native::Path(_) => "PosixPath",
            Native::DateTime(_) => "datetime",
            Native::Date(_) => "date",
            Native::TimeDelta(_) => "timedelta",
            Native::Pattern(_) => "re.Pattern",
            Native::Match(_) => "re.Match",
            Native::StringIO(_) => "StringIO",
            Native::File(_) => "TextIOWrapper",
        }
    }
}

#[derive(Clone)]
pub enum DictFlavor {
    Plain,
    Counter,
    /// `defaultdict` with its factory.
    Default(Value),
    Ordered,
}

/// Insertion-ordered mapping; keys keep their original value for display.
#[derive(Clone)]
pub struct DictData {
    pub entries: IndexMap<HashKey, (Value, Value)>,
    pub flavor: DictFlavor,
}

impl Default for DictData {
    fn default() -> Self {
        Self::new(DictFlavor::Plain)
    }
}

impl DictData {
    pub fn new(flavor: DictFlavor) -> Self {
        Self {
            entries: IndexMap::new(),
            flavor,
        }
    }

    pub fn get(&self, key: &HashKey) -> Option<Value> {
        self.entries.get(key).map(|(_, v)| v.clone())
    }

    pub fn insert(&mut self, key: Value, value: Value) -> ExecResult<()> {
        let hash = key.hash_key()?;
        match self.entries.get_mut(&hash) {
            Some(slot) => slot.1 = value,
            None => {
                self.entries.insert(hash, (key, value));
            }
        }
        Ok(())
    }

    pub fn insert_str(&mut self, key: &str, value: Value) {
        self.entries.insert(
            HashKey::Str(Arc::from(key)),
            (Value::str(key), value),
        );
    }

    pub fn remove(&mut self, key: &HashKey) -> Option<Value> {
        self.entries.shift_remove(key).map(|(_, v)| v)
    }

    pub fn keys(&self) -> Vec<Value> {
        self.entries.values().map(|(k, _)| k.clone()).collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.entries.values().map(|(_, v)| v.clone()).collect()
    }

    pub fn items(&self) -> Vec<(Value, Value)> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone, Default)]
pub struct SetData {
    pub items: IndexMap<HashKey, Value>,
}

impl SetData {
    pub fn insert(&mut self, value: Value) -> ExecResult<()> {
        let key = value.hash_key()?;
        self.items.entry(key).or_insert(value);
        Ok(())
    }

    pub fn contains(&self, key: &HashKey) -> bool {
        self.items.contains_key(key)
    }

    pub fn values(&self) -> Vec<Value> {
        self.items.values().cloned().collect()
    }
}

/// Hashable projection of a value used as dictionary and set key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    None,
    Int(i64),
    Float(u64),
    Str(Arc<str>),
    Tuple(Vec<HashKey>),
    Other(String),
}

/// Positional and keyword arguments of a call.
#[derive(Clone, Default)]
pub struct Args {
    pub positional: Vec<Value>,
    pub kwargs: IndexMap<String, Value>,
}

impl Args {
    pub fn new(positional: Vec<Value>) -> Self {
        Self {
            positional,
            kwargs: IndexMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.positional.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.kwargs.is_empty()
    }

    /// Validates the positional count against `min..=max`.
    pub fn check(&self, name: &str, min: usize, max: usize) -> ExecResult<()> {
        let n = self.positional.len();
        if n < min || n > max {
            let expected = if min == max {
                format!("exactly {min}")
            } else if n < min {
                format!("at least {min}")
            } else {
                format!("at most {max}")
            };
            let plural = if min == max && min == 1 || n < min && min == 1 || n > max && max == 1 {
                "argument"
            } else {
                "arguments"
            };
            return Err(Exception::type_error(format!(
                "{name}() takes {expected} {plural} ({n} given)"
            )));
        }
        Ok(())
    }

    pub fn no_kwargs(&self, name: &str) -> ExecResult<()> {
        match self.kwargs.keys().next() {
            Some(key) => Err(Exception::type_error(format!(
                "{name}() got an unexpected keyword argument '{key}'"
            ))),
            None => Ok(()),
        }
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    /// Positional argument `index`, or the keyword `name`.
    pub fn arg(&self, index: usize, name: &str) -> Option<Value> {
        self.positional
            .get(index)
            .cloned()
            .or_else(|| self.kwargs.get(name).cloned())
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    pub fn required(&self, index: usize, name: &str, func: &str) -> ExecResult<Value> {
        self.arg(index, name).ok_or_else(|| {
            Exception::type_error(format!(
                "{func}() missing required argument: '{name}'"
            ))
        })
    }
}

impl Value {
    pub fn str(s: impl Into<Arc<str>>) -> Value {
        Value::Str(s.into())
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Arc::new(Mutex::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Arc::new(items))
    }

    pub fn dict(data: DictData) -> Value {
        Value::Dict(Arc::new(Mutex::new(data)))
    }

    pub fn set(data: SetData) -> Value {
        Value::Set(Arc::new(Mutex::new(data)))
    }

    pub fn native(native: Native) -> Value {
        Value::Native(Arc::new(native))
    }

    /// Builds a plain dict from string keys.
    pub fn str_dict<I, K>(entries: I) -> Value
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        let mut data = DictData::default();
        for (key, value) in entries {
            data.insert_str(key.as_ref(), value);
        }
        Value::dict(data)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(d) => match d.lock().flavor {
                DictFlavor::Plain => "dict",
                DictFlavor::Counter => "Counter",
                DictFlavor::Default(_) => "defaultdict",
                DictFlavor::Ordered => "OrderedDict",
            },
            Value::Set(_) => "set",
            Value::Range(_) => "range",
            Value::Slice(..) => "slice",
            Value::Ellipsis => "ellipsis",
            Value::Function(_) => "function",
            Value::Builtin(_) | Value::Tool(_) | Value::Hook(_) => "builtin_function_or_method",
            Value::Method(_) => "method",
            Value::Type(_) => "type",
            Value::Exception(e) => e.kind.name(),
            Value::Module(_) => "module",
            Value::Native(n) => n.type_name(),
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.lock().is_empty(),
            Value::Tuple(t) => !t.is_empty(),
            Value::Dict(d) => !d.lock().is_empty(),
            Value::Set(s) => !s.lock().items.is_empty(),
            Value::Range(r) => !r.is_empty(),
            Value::Native(n) => match &**n {
                Native::TimeDelta(d) => *d != chrono::Duration::zero(),
                _ => true,
            },
            _ => true,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Bool(b) => Some(*b as i64 as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Value::Function(_)
                | Value::Builtin(_)
                | Value::Method(_)
                | Value::Type(_)
                | Value::Tool(_)
        )
    }

    pub fn hash_key(&self) -> ExecResult<HashKey> {
        let key = match self {
            Value::None => HashKey::None,
            Value::Bool(b) => HashKey::Int(*b as i64),
            Value::Int(n) => HashKey::Int(*n),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.abs() < 9.2e18 {
                    HashKey::Int(*f as i64)
                } else {
                    HashKey::Float(f.to_bits())
                }
            }
            Value::Str(s) => HashKey::Str(s.clone()),
            Value::Tuple(items) => HashKey::Tuple(
                items
                    .iter()
                    .map(Value::hash_key)
                    .collect::<ExecResult<Vec<_>>>()?,
            ),
            Value::List(_) | Value::Dict(_) | Value::Set(_) | Value::Slice(..) => {
                return Err(Exception::type_error(format!(
                    "unhashable type: '{}'",
                    self.type_name()
                )))
            }
            Value::Native(n) => match &**n {
                Native::StringIO(_) | Native::File(_) | Native::Match(_) | Native::Pattern(_) => {
                    HashKey::Other(format!("{}@{:p}", n.type_name(), Arc::as_ptr(n)))
                }
                _ => HashKey::Other(format!("{}:{}", n.type_name(), self.repr())),
            },
            Value::Function(f) => HashKey::Other(format!("fn@{:p}", Arc::as_ptr(f))),
            Value::Exception(e) => HashKey::Other(format!("exc@{:p}", Arc::as_ptr(e))),
            Value::Method(m) => HashKey::Other(format!("method@{:p}", Arc::as_ptr(m))),
            other => HashKey::Other(format!("{}:{}", other.type_name(), other.repr())),
        };
        Ok(key)
    }

    /// `repr()` semantics.
    pub fn repr(&self) -> String {
        self.repr_depth(0)
    }

    /// `str()` semantics.
    pub fn to_str(&self) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            Value::Exception(e) => e.message(),
            Value::Native(n) => match &**n {
                Native::Path(p) => p.display().to_string(),
                Native::DateTime(dt) => format_datetime(dt, ' '),
                Native::Date(d) => d.format("%Y-%m-%d").to_string(),
                Native::TimeDelta(td) => format_timedelta(td),
                _ => self.repr(),
            },
            _ => self.repr(),
        }
    }

    fn repr_depth(&self, depth: usize) -> String {
        if depth > MAX_DEPTH {
            return "...".to_string();
        }
        let seq = |items: &[Value]| -> String {
            items
                .iter()
                .map(|v| v.repr_depth(depth + 1))
                .collect::<Vec<_>>()
                .join(", ")
        };
        match self {
            Value::None => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(f) => float_repr(*f),
            Value::Str(s) => str_repr(s),
            Value::List(l) => {
                let items = l.lock().clone();
                format!("[{}]", seq(&items))
            }
            Value::Tuple(t) => {
                if t.len() == 1 {
                    format!("({},)", t[0].repr_depth(depth + 1))
                } else {
                    format!("({})", seq(t))
                }
            }
            Value::Dict(d) => {
                let data = d.lock().clone();
                let body = data
                    .entries
                    .values()
                    .map(|(k, v)| format!("{}: {}", k.repr_depth(depth + 1), v.repr_depth(depth + 1)))
                    .collect::<Vec<_>>()
                    .join(", ");
                match &data.flavor {
                    DictFlavor::Plain => format!("{{{body}}}"),
                    DictFlavor::Counter => format!("Counter({{{body}}})"),
                    DictFlavor::Ordered => format!("OrderedDict({{{body}}})"),
                    DictFlavor::Default(factory) => {
                        format!("defaultdict({}, {{{body}}})", factory.repr_depth(depth + 1))
                    }
                }
            }
            Value::Set(s) => {
                let items = s.lock().values();
                if items.is_empty() {
                    "set()".to_string()
                } else {
                    format!("{{{}}}", seq(&items))
                }
            }
            Value::Range(r) => {
                if r.step == 1 {
                    format!("range({}, {})", r.start, r.stop)
                } else {
                    format!("range({}, {}, {})", r.start, r.stop, r.step)
                }
            }
            Value::Slice(a, b, c) => {
                let show = |v: &Option<i64>| v.map_or("None".to_string(), |n| n.to_string());
                format!("slice({}, {}, {})", show(a), show(b), show(c))
            }
            Value::Ellipsis => "Ellipsis".to_string(),
            Value::Function(f) => format!("<function {}>", f.def.name),
            Value::Builtin(b) => format!("<built-in function {}>", b.name),
            Value::Method(m) => format!(
                "<built-in method {} of {} object>",
                m.name,
                m.receiver.type_name()
            ),
            Value::Type(t) => format!("<class '{}'>", t.name()),
            Value::Exception(e) => {
                format!("{}({})", e.kind.name(), seq(&e.args))
            }
            Value::Module(m) => format!("<module '{}'>", m.name),
            Value::Hook(h) => format!("<guard {}>", h.reserved_name()),
            Value::Tool(t) => format!("<tool {}>", t.name()),
            Value::Native(n) => match &**n {
                Native::Path(p) => format!("PosixPath({})", str_repr(&p.display().to_string())),
                Native::DateTime(dt) => {
                    use chrono::{Datelike, Timelike};
                    let mut fields = vec![
                        dt.year().to_string(),
                        dt.month().to_string(),
                        dt.day().to_string(),
                        dt.hour().to_string(),
                        dt.minute().to_string(),
                    ];
                    let micros = dt.nanosecond() / 1000;
                    if dt.second() != 0 || micros != 0 {
                        fields.push(dt.second().to_string());
                    }
                    if micros != 0 {
                        fields.push(micros.to_string());
                    }
                    format!("datetime.datetime({})", fields.join(", "))
                }
                Native::Date(d) => {
                    use chrono::Datelike;
                    format!("datetime.date({}, {}, {})", d.year(), d.month(), d.day())
                }
                Native::TimeDelta(td) => {
                    let (days, seconds, micros) = timedelta_parts(td);
                    let mut fields = Vec::new();
                    if days != 0 {
                        fields.push(format!("days={days}"));
                    }
                    if seconds != 0 {
                        fields.push(format!("seconds={seconds}"));
                    }
                    if micros != 0 {
                        fields.push(format!("microseconds={micros}"));
                    }
                    format!("datetime.timedelta({})", fields.join(", "))
                }
                Native::Pattern(p) => format!("re.compile({})", str_repr(&p.source)),
                Native::Match(m) => {
                    let (start, end) = m.span(0).unwrap_or((0, 0));
                    format!(
                        "<re.Match object; span=({start}, {end}), match={}>",
                        str_repr(&m.group_text(0).unwrap_or_default())
                    )
                }
                Native::StringIO(_) => "<_io.StringIO object>".to_string(),
                Native::File(f) => {
                    let f = f.lock();
                    format!(
                        "<_io.TextIOWrapper name={} mode={}>",
                        str_repr(&f.name),
                        str_repr(f.mode.as_str())
                    )
                }
            },
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_str())
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<function {}>", self.def.name)
    }
}

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<built-in function {}>", self.name)
    }
}

/// Equality with numeric cross-type comparison and deep container equality.
pub fn py_eq(a: &Value, b: &Value) -> bool {
    eq_depth(a, b, 0)
}

fn eq_depth(a: &Value, b: &Value, depth: usize) -> bool {
    if depth > MAX_DEPTH {
        return false;
    }
    let seq_eq = |x: &[Value], y: &[Value]| {
        x.len() == y.len() && x.iter().zip(y).all(|(p, q)| eq_depth(p, q, depth + 1))
    };
    match (a, b) {
        (Value::None, Value::None) | (Value::Ellipsis, Value::Ellipsis) => true,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Int(_) | Value::Bool(_) | Value::Float(_), Value::Int(_) | Value::Bool(_) | Value::Float(_)) => {
            match (a.as_int(), b.as_int()) {
                (Some(x), Some(y)) => x == y,
                _ => a.as_float() == b.as_float(),
            }
        }
        (Value::List(x), Value::List(y)) => {
            if Arc::ptr_eq(x, y) {
                return true;
            }
            let (x, y) = (x.lock().clone(), y.lock().clone());
            seq_eq(&x, &y)
        }
        (Value::Tuple(x), Value::Tuple(y)) => seq_eq(x, y),
        (Value::Dict(x), Value::Dict(y)) => {
            if Arc::ptr_eq(x, y) {
                return true;
            }
            let (x, y) = (x.lock().clone(), y.lock().clone());
            x.len() == y.len()
                && x.entries.iter().all(|(key, (_, value))| {
                    y.entries
                        .get(key)
                        .is_some_and(|(_, other)| eq_depth(value, other, depth + 1))
                })
        }
        (Value::Set(x), Value::Set(y)) => {
            if Arc::ptr_eq(x, y) {
                return true;
            }
            let (x, y) = (x.lock().clone(), y.lock().clone());
            x.items.len() == y.items.len() && x.items.keys().all(|k| y.items.contains_key(k))
        }
        (Value::Range(x), Value::Range(y)) => {
            x.len() == y.len() && (x.is_empty() || (x.start == y.start && x.step == y.step))
        }
        (Value::Type(x), Value::Type(y)) => x == y,
        (Value::Function(x), Value::Function(y)) => Arc::ptr_eq(x, y),
        (Value::Builtin(x), Value::Builtin(y)) => x.name == y.name,
        (Value::Exception(x), Value::Exception(y)) => Arc::ptr_eq(x, y),
        (Value::Module(x), Value::Module(y)) => x.name == y.name,
        (Value::Native(x), Value::Native(y)) => match (&**x, &**y) {
            (Native::Path(p), Native::Path(q)) => p == q,
            (Native::DateTime(p), Native::DateTime(q)) => p == q,
            (Native::Date(p), Native::Date(q)) => p == q,
            (Native::TimeDelta(p), Native::TimeDelta(q)) => p == q,
            _ => Arc::ptr_eq(x, y),
        },
        _ => false,
    }
}

/// Ordering for `<`-style comparisons. `None` means unordered (NaN).
pub fn py_partial_cmp(a: &Value, b: &Value) -> ExecResult<Option<Ordering>> {
    match (a, b) {
        (Value::Int(_) | Value::Bool(_) | Value::Float(_), Value::Int(_) | Value::Bool(_) | Value::Float(_)) => {
            match (a.as_int(), b.as_int()) {
                (Some(x), Some(y)) => Ok(Some(x.cmp(&y))),
                _ => Ok(a.as_float().partial_cmp(&b.as_float())),
            }
        }
        (Value::Str(x), Value::Str(y)) => Ok(Some(x.cmp(y))),
        (Value::List(x), Value::List(y)) => {
            let (x, y) = (x.lock().clone(), y.lock().clone());
            seq_cmp(&x, &y)
        }
        (Value::Tuple(x), Value::Tuple(y)) => seq_cmp(x, y),
        (Value::Set(x), Value::Set(y)) => {
            let (x, y) = (x.lock().clone(), y.lock().clone());
            let x_in_y = x.items.keys().all(|k| y.items.contains_key(k));
            let y_in_x = y.items.keys().all(|k| x.items.contains_key(k));
            Ok(match (x_in_y, y_in_x) {
                (true, true) => Some(Ordering::Equal),
                (true, false) => Some(Ordering::Less),
                (false, true) => Some(Ordering::Greater),
                (false, false) => None,
            })
        }
        (Value::Native(x), Value::Native(y)) => match (&**x, &**y) {
            (Native::DateTime(p), Native::DateTime(q)) => Ok(Some(p.cmp(q))),
            (Native::Date(p), Native::Date(q)) => Ok(Some(p.cmp(q))),
            (Native::TimeDelta(p), Native::TimeDelta(q)) => Ok(Some(p.cmp(q))),
            (Native::Path(p), Native::Path(q)) => Ok(Some(p.cmp(q))),
            _ => Err(unorderable(a, b)),
        },
        _ => Err(unorderable(a, b)),
    }
}

fn seq_cmp(x: &[Value], y: &[Value]) -> ExecResult<Option<Ordering>> {
    for (p, q) in x.iter().zip(y) {
        if !py_eq(p, q) {
            return py_partial_cmp(p, q);
        }
    }
    Ok(Some(x.len().cmp(&y.len())))
}

fn unorderable(a: &Value, b: &Value) -> Exception {
    Exception::type_error(format!(
        "'<' not supported between instances of '{}' and '{}'",
        a.type_name(),
        b.type_name()
    ))
}

/// Total order used by `sorted`, `min` and `max`.
pub fn py_cmp(a: &Value, b: &Value) -> ExecResult<Ordering> {
    Ok(py_partial_cmp(a, b)?.unwrap_or(Ordering::Equal))
}

/// Shortest round-trip float rendering in the source language's format.
pub fn float_repr(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if f == 0.0 {
        return if f.is_sign_negative() { "-0.0" } else { "0.0" }.to_string();
    }
    let sci = format!("{f:e}");
    let (mantissa, exp) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    let sign = if mantissa.starts_with('-') { "-" } else { "" };
    let digits: String = mantissa
        .trim_start_matches('-')
        .chars()
        .filter(|c| *c != '.')
        .collect();
    if (-4..16).contains(&exp) {
        let body = if exp >= 0 {
            let int_len = exp as usize + 1;
            if digits.len() <= int_len {
                format!("{}{}.0", digits, "0".repeat(int_len - digits.len()))
            } else {
                format!("{}.{}", &digits[..int_len], &digits[int_len..])
            }
        } else {
            format!("0.{}{}", "0".repeat((-exp - 1) as usize), digits)
        };
        format!("{sign}{body}")
    } else {
        let m = if digits.len() > 1 {
            format!("{}.{}", &digits[..1], &digits[1..])
        } else {
            digits
        };
        let exp_sign = if exp < 0 { '-' } else { '+' };
        format!("{sign}{m}e{exp_sign}{:02}", exp.abs())
    }
}

/// String literal rendering with quote selection and escapes.
pub fn str_repr(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

pub fn format_datetime(dt: &chrono::NaiveDateTime, sep: char) -> String {
    use chrono::Timelike;
    let base = dt.format(&format!("%Y-%m-%d{sep}%H:%M:%S")).to_string();
    let micros = dt.nanosecond() / 1000;
    if micros == 0 {
        base
    } else {
        format!("{base}.{micros:06}")
    }
}

/// Splits a duration into normalized `(days, seconds, microseconds)`.
pub fn timedelta_parts(td: &chrono::Duration) -> (i64, i64, i64) {
    let total = td.num_microseconds().unwrap_or(i64::MAX);
    let day = 86_400_000_000i64;
    let days = total.div_euclid(day);
    let rest = total.rem_euclid(day);
    (days, rest / 1_000_000, rest % 1_000_000)
}

pub fn format_timedelta(td: &chrono::Duration) -> String {
    let (days, seconds, micros) = timedelta_parts(td);
    let clock = format!(
        "{}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    );
    let clock = if micros != 0 {
        format!("{clock}.{micros:06}")
    } else {
        clock
    };
    match days {
        0 => clock,
        1 | -1 => format!("{days} day, {clock}"),
        _ => format!("{days} days, {clock}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_repr_matches_source_language() {
        assert_eq!(float_repr(1.0), "1.0");
        assert_eq!(float_repr(0.1), "0.1");
        assert_eq!(float_repr(123.45), "123.45");
        assert_eq!(float_repr(1e16), "1e+16");
        assert_eq!(float_repr(1.5e-7), "1.5e-07");
        assert_eq!(float_repr(-2.5), "-2.5");
        assert_eq!(float_repr(100.0), "100.0");
        assert_eq!(float_repr(0.0001), "0.0001");
    }

    #[test]
    fn test_str_repr_quote_selection() {
        assert_eq!(str_repr("abc"), "'abc'");
        assert_eq!(str_repr("it's"), "\"it's\"");
        assert_eq!(str_repr("a\nb"), "'a\\nb'");
    }

    #[test]
    fn test_container_repr() {
        let list = Value::list(vec![Value::Int(1), Value::str("a"), Value::None]);
        assert_eq!(list.repr(), "[1, 'a', None]");
        assert_eq!(Value::tuple(vec![Value::Int(1)]).repr(), "(1,)");
        let dict = Value::str_dict([("k", Value::Bool(true))]);
        assert_eq!(dict.repr(), "{'k': True}");
    }

    #[test]
    fn test_self_referential_list_repr_terminates() {
        let list = Value::list(vec![]);
        if let Value::List(inner) = &list {
            inner.lock().push(list.clone());
        }
        assert!(list.repr().contains("..."));
    }

    #[test]
    fn test_numeric_equality_and_hash_agree() {
        assert!(py_eq(&Value::Int(1), &Value::Float(1.0)));
        assert!(py_eq(&Value::Bool(true), &Value::Int(1)));
        assert_eq!(
            Value::Int(1).hash_key().unwrap(),
            Value::Float(1.0).hash_key().unwrap()
        );
        assert!(Value::list(vec![]).hash_key().is_err());
    }

    #[test]
    fn test_range_len() {
        let r = RangeValue {
            start: 0,
            stop: 10,
            step: 3,
        };
        assert_eq!(r.len(), 4);
        assert_eq!(r.get(3), Some(9));
        let empty = RangeValue {
            start: 5,
            stop: 0,
            step: 1,
        };
        assert!(empty.is_empty());
    }

    #[test]
    fn test_range_len_at_integer_extremes() {
        let halves = RangeValue {
            start: 0,
            stop: i64::MAX,
            step: 2,
        };
        assert_eq!(halves.checked_len().unwrap(), 4611686018427387904);
        assert_eq!(halves.get(4611686018427387903), Some(i64::MAX - 1));

        let down = RangeValue {
            start: i64::MAX,
            stop: i64::MIN,
            step: -1,
        };
        assert_eq!(down.len(), usize::MAX);
        let err = down.checked_len().unwrap_err();
        assert_eq!(err.kind(), ExcType::OverflowError);
    }

    #[test]
    fn test_timedelta_format() {
        let td = chrono::Duration::seconds(90_061);
        assert_eq!(format_timedelta(&td), "1 day, 1:01:01");
        assert_eq!(format_timedelta(&chrono::Duration::seconds(5)), "0:00:05");
    }
}
