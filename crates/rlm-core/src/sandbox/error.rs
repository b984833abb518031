//! Runtime exceptions raised inside the sandbox and the compile error type.

use std::fmt;
use std::sync::Arc;

use super::value::Value;

/// Result alias used throughout the interpreter.
pub type ExecResult<T> = std::result::Result<T, Exception>;

/// Errors produced by the lexer, parser or restricted compiler.
///
/// Each message is already formatted as `Line N: ...`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", messages.join(", "))]
pub struct CompileError {
    pub messages: Vec<String>,
}

impl CompileError {
    pub fn single(message: impl Into<String>) -> Self {
        Self {
            messages: vec![message.into()],
        }
    }

    pub fn syntax(line: usize, message: impl fmt::Display) -> Self {
        Self::single(format!("Line {line}: SyntaxError: {message}"))
    }
}

/// Exception classes visible to sandboxed code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExcType {
    BaseException,
    Exception,
    ArithmeticError,
    ZeroDivisionError,
    OverflowError,
    LookupError,
    KeyError,
    IndexError,
    ValueError,
    TypeError,
    NameError,
    AttributeError,
    ImportError,
    AssertionError,
    RuntimeError,
    RecursionError,
    NotImplementedError,
    StopIteration,
    OSError,
    FileNotFoundError,
    PermissionError,
    MemoryError,
    /// Raised when execution limits are exhausted. Never matched by `except`.
    Timeout,
}

impl ExcType {
    pub fn name(self) -> &'static str {
        match self {
            ExcType::BaseException => "BaseException",
            ExcType::Exception => "Exception",
            ExcType::ArithmeticError => "ArithmeticError",
            ExcType::ZeroDivisionError => "ZeroDivisionError",
            ExcType::OverflowError => "OverflowError",
            ExcType::LookupError => "LookupError",
            ExcType::KeyError => "KeyError",
            ExcType::IndexError => "IndexError",
            ExcType::ValueError => "ValueError",
            ExcType::TypeError => "TypeError",
            ExcType::NameError => "NameError",
            ExcType::AttributeError => "AttributeError",
            ExcType::ImportError => "ImportError",
            ExcType::AssertionError => "AssertionError",
            ExcType::RuntimeError => "RuntimeError",
            ExcType::RecursionError => "RecursionError",
            ExcType::NotImplementedError => "NotImplementedError",
            ExcType::StopIteration => "StopIteration",
            ExcType::OSError => "OSError",
            ExcType::FileNotFoundError => "FileNotFoundError",
            ExcType::PermissionError => "PermissionError",
            ExcType::MemoryError => "MemoryError",
            ExcType::Timeout => "TimeoutError",
        }
    }

    pub fn parent(self) -> Option<ExcType> {
        match self {
            ExcType::BaseException => None,
            ExcType::Exception | ExcType::Timeout => Some(ExcType::BaseException),
            ExcType::ZeroDivisionError | ExcType::OverflowError => Some(ExcType::ArithmeticError),
            ExcType::KeyError | ExcType::IndexError => Some(ExcType::LookupError),
            ExcType::RecursionError | ExcType::NotImplementedError => Some(ExcType::RuntimeError),
            ExcType::FileNotFoundError | ExcType::PermissionError => Some(ExcType::OSError),
            _ => Some(ExcType::Exception),
        }
    }

    /// Whether `self` is `other` or one of its subclasses.
    pub fn is_subclass_of(self, other: ExcType) -> bool {
        let mut current = Some(self);
        while let Some(kind) = current {
            if kind == other {
                return true;
            }
            current = kind.parent();
        }
        false
    }

    /// Exception classes bound as builtins.
    pub const EXPOSED: &'static [ExcType] = &[
        ExcType::Exception,
        ExcType::ValueError,
        ExcType::TypeError,
        ExcType::RuntimeError,
        ExcType::KeyError,
        ExcType::IndexError,
        ExcType::ZeroDivisionError,
        ExcType::FileNotFoundError,
        ExcType::AttributeError,
        ExcType::NameError,
        ExcType::AssertionError,
        ExcType::LookupError,
        ExcType::ArithmeticError,
        ExcType::OSError,
        ExcType::NotImplementedError,
    ];
}

impl fmt::Display for ExcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An exception instance as seen by sandboxed code (`except E as e`).
#[derive(Debug, Clone)]
pub struct ExceptionValue {
    pub kind: ExcType,
    pub args: Vec<Value>,
}

impl ExceptionValue {
    /// `str(e)` semantics.
    pub fn message(&self) -> String {
        match self.args.as_slice() {
            [] => String::new(),
            [Value::Str(s)] if self.kind != ExcType::KeyError => s.to_string(),
            [single] if self.kind == ExcType::KeyError => single.repr(),
            [single] => single.to_str(),
            many => Value::tuple(many.to_vec()).repr(),
        }
    }
}

/// One line of a traceback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub function: String,
    pub line: usize,
}

/// A raised exception propagating through the interpreter.
#[derive(Debug, Clone)]
pub struct Exception {
    pub value: Arc<ExceptionValue>,
    pub traceback: Vec<TraceFrame>,
}

impl Exception {
    pub fn new(kind: ExcType, message: impl Into<String>) -> Self {
        Self::from_value(ExceptionValue {
            kind,
            args: vec![Value::str(message.into())],
        })
    }

    pub fn from_value(value: ExceptionValue) -> Self {
        Self {
            value: Arc::new(value),
            traceback: Vec::new(),
        }
    }

    pub fn kind(&self) -> ExcType {
        self.value.kind
    }

    pub fn message(&self) -> String {
        self.value.message()
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ExcType::TypeError, message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(ExcType::ValueError, message)
    }

    pub fn index_error(message: impl Into<String>) -> Self {
        Self::new(ExcType::IndexError, message)
    }

    pub fn key_error(key: Value) -> Self {
        Self::from_value(ExceptionValue {
            kind: ExcType::KeyError,
            args: vec![key],
        })
    }

    pub fn attribute_error(type_name: &str, attr: &str) -> Self {
        Self::new(
            ExcType::AttributeError,
            format!("'{type_name}' object has no attribute '{attr}'"),
        )
    }

    pub fn zero_division(message: &str) -> Self {
        Self::new(ExcType::ZeroDivisionError, message)
    }

    pub fn overflow() -> Self {
        Self::new(
            ExcType::OverflowError,
            "integer result too large (sandbox integers are 64-bit)",
        )
    }

    pub fn os_error(kind: ExcType, err: &std::io::Error, path: &str) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ExcType::FileNotFoundError,
            std::io::ErrorKind::PermissionDenied => ExcType::PermissionError,
            _ => kind,
        };
        Self::new(kind, format!("{err}: '{path}'"))
    }

    /// `Traceback (most recent call last): ...` rendering.
    pub fn format_traceback(&self) -> String {
        let mut out = String::from("Traceback (most recent call last):\n");
        for frame in &self.traceback {
            out.push_str(&format!(
                "  File \"<sandbox>\", line {}, in {}\n",
                frame.line, frame.function
            ));
        }
        let message = self.message();
        if message.is_empty() {
            out.push_str(self.kind().name());
        } else {
            out.push_str(&format!("{}: {}", self.kind().name(), message));
        }
        out
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind().name(), self.message())
    }
}

impl std::error::Error for Exception {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_hierarchy() {
        assert!(ExcType::KeyError.is_subclass_of(ExcType::LookupError));
        assert!(ExcType::KeyError.is_subclass_of(ExcType::Exception));
        assert!(ExcType::FileNotFoundError.is_subclass_of(ExcType::OSError));
        assert!(!ExcType::Timeout.is_subclass_of(ExcType::Exception));
        assert!(!ExcType::ValueError.is_subclass_of(ExcType::TypeError));
    }

    #[test]
    fn test_key_error_message_is_repr() {
        let err = Exception::key_error(Value::str("missing"));
        assert_eq!(err.message(), "'missing'");
    }

    #[test]
    fn test_traceback_format() {
        let mut err = Exception::zero_division("division by zero");
        err.traceback.push(TraceFrame {
            function: "<module>".into(),
            line: 3,
        });
        let text = err.format_traceback();
        assert!(text.starts_with("Traceback (most recent call last):"));
        assert!(text.contains("line 3, in <module>"));
        assert!(text.ends_with("ZeroDivisionError: division by zero"));
    }

    #[test]
    fn test_compile_error_joins_messages() {
        let err = CompileError {
            messages: vec!["Line 1: a".into(), "Line 2: b".into()],
        };
        assert_eq!(err.to_string(), "Line 1: a, Line 2: b");
    }
}
