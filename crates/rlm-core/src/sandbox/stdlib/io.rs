//! Text buffers, sandboxed `open` and the `with` protocol.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::sandbox::error::{ExcType, ExecResult, Exception};
use crate::sandbox::fs::Access;
use crate::sandbox::interpreter::Interpreter;
use crate::sandbox::ops;
use crate::sandbox::value::{Args, Native, Value};

pub const STRINGIO_METHODS: &[&str] = &[
    "write", "writelines", "read", "readline", "readlines", "getvalue", "seek", "tell", "close",
];
pub const FILE_METHODS: &[&str] = &[
    "read", "readline", "readlines", "write", "writelines", "flush", "close",
];
pub const FILE_PROPERTIES: &[&str] = &["name", "mode", "closed"];

/// In-memory text with a cursor measured in characters.
#[derive(Debug, Default)]
pub struct TextBuffer {
    chars: Vec<char>,
    pos: usize,
    closed: bool,
}

impl TextBuffer {
    pub fn new(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
            closed: false,
        }
    }

    fn check_open(&self) -> ExecResult<()> {
        if self.closed {
            Err(Exception::value_error("I/O operation on closed file."))
        } else {
            Ok(())
        }
    }

    /// Writes at the cursor, overwriting existing characters.
    pub fn write(&mut self, text: &str) -> ExecResult<usize> {
        self.check_open()?;
        let incoming: Vec<char> = text.chars().collect();
        let end = self.pos + incoming.len();
        if self.pos > self.chars.len() {
            self.chars.resize(self.pos, '\0');
        }
        let overlap = end.min(self.chars.len());
        self.chars.splice(self.pos..overlap, incoming.iter().copied());
        ops::check_len(self.chars.len())?;
        self.pos = end;
        Ok(incoming.len())
    }

    pub fn read(&mut self, size: Option<usize>) -> ExecResult<String> {
        self.check_open()?;
        let start = self.pos.min(self.chars.len());
        let end = match size {
            Some(n) => (start + n).min(self.chars.len()),
            None => self.chars.len(),
        };
        self.pos = end;
        Ok(self.chars[start..end].iter().collect())
    }

    pub fn readline(&mut self) -> ExecResult<String> {
        self.check_open()?;
        let start = self.pos.min(self.chars.len());
        let end = self.chars[start..]
            .iter()
            .position(|c| *c == '\n')
            .map_or(self.chars.len(), |i| start + i + 1);
        self.pos = end;
        Ok(self.chars[start..end].iter().collect())
    }

    pub fn readlines(&mut self) -> ExecResult<Vec<String>> {
        let mut lines = Vec::new();
        loop {
            let line = self.readline()?;
            if line.is_empty() {
                return Ok(lines);
            }
            lines.push(line);
        }
    }

    pub fn getvalue(&self) -> ExecResult<String> {
        self.check_open()?;
        Ok(self.chars.iter().collect())
    }

    pub fn close(&mut self) {
        self.closed = true;
    }
}

/// An open file inside the sandbox directory.
pub struct FileHandle {
    pub name: String,
    pub mode: String,
    reader: TextBuffer,
    writer: Option<File>,
    closed: bool,
}

impl FileHandle {
    fn check_open(&self) -> ExecResult<()> {
        if self.closed {
            Err(Exception::value_error("I/O operation on closed file."))
        } else {
            Ok(())
        }
    }

    fn readable(&self) -> ExecResult<()> {
        self.check_open()?;
        if self.mode.contains('r') || self.mode.contains('+') {
            Ok(())
        } else {
            Err(Exception::new(ExcType::OSError, "not readable"))
        }
    }

    fn write(&mut self, text: &str) -> ExecResult<usize> {
        self.check_open()?;
        let Some(file) = self.writer.as_mut() else {
            return Err(Exception::new(ExcType::OSError, "not writable"));
        };
        file.write_all(text.as_bytes())
            .map_err(|e| io_error(&e, &self.name))?;
        Ok(text.chars().count())
    }

    fn close(&mut self) {
        if let Some(file) = self.writer.as_mut() {
            let _ = file.flush();
        }
        self.writer = None;
        self.closed = true;
    }
}

/// Maps a host I/O error onto the matching exception class.
pub(crate) fn io_error(err: &std::io::Error, path: &str) -> Exception {
    Exception::os_error(ExcType::OSError, err, path)
}

/// Opens `path` relative to the sandbox working directory.
pub fn open_path(interp: &Interpreter, path: &str, mode: &str) -> ExecResult<Value> {
    if mode.contains('b') {
        return Err(Exception::value_error(
            "binary mode is not supported in the sandbox",
        ));
    }
    let valid = !mode.is_empty()
        && mode.chars().all(|c| "rwaxt+".contains(c))
        && mode.chars().filter(|c| "rwax".contains(*c)).count() == 1;
    if !valid {
        return Err(Exception::value_error(format!("invalid mode: '{mode}'")));
    }
    let writing = mode.contains(['w', 'a', 'x', '+']);
    let access = if writing { Access::Write } else { Access::Read };
    let resolved = interp.fs().resolve(path, access)?;
    let mut reader = TextBuffer::default();
    let writer = if writing {
        let mut options = OpenOptions::new();
        options.read(mode.contains('+'));
        match mode.chars().find(|c| "rwax".contains(*c)) {
            Some('w') => options.write(true).create(true).truncate(true),
            Some('a') => options.append(true).create(true),
            Some('x') => options.write(true).create_new(true),
            _ => options.write(true),
        };
        Some(options.open(&resolved).map_err(|e| io_error(&e, path))?)
    } else {
        None
    };
    if mode.contains('r') {
        let text = std::fs::read_to_string(&resolved).map_err(|e| io_error(&e, path))?;
        reader = TextBuffer::new(&text);
    }
    Ok(Value::native(Native::File(Mutex::new(FileHandle {
        name: path.to_string(),
        mode: mode.to_string(),
        reader,
        writer,
        closed: false,
    }))))
}

/// The `open` builtin.
pub fn open(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("open", 1, 3)?;
    let path = match args.arg(0, "file") {
        Some(Value::Str(s)) => s.to_string(),
        Some(Value::Native(n)) => match &*n {
            Native::Path(p) => p.display().to_string(),
            _ => return Err(Exception::type_error("expected str or Path for file")),
        },
        _ => return Err(Exception::type_error("expected str or Path for file")),
    };
    let mode = match args.arg(1, "mode") {
        Some(Value::Str(s)) => s.to_string(),
        None => "r".to_string(),
        Some(other) => {
            return Err(Exception::type_error(format!(
                "open() argument 'mode' must be str, not {}",
                other.type_name()
            )))
        }
    };
    open_path(interp, &path, &mode)
}

pub fn construct_stringio(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("StringIO", 0, 1)?;
    let initial = match args.arg(0, "initial_value") {
        Some(Value::Str(s)) => s.to_string(),
        None | Some(Value::None) => String::new(),
        Some(other) => {
            return Err(Exception::type_error(format!(
                "initial_value must be str or None, not {}",
                other.type_name()
            )))
        }
    };
    Ok(Value::native(Native::StringIO(Mutex::new(TextBuffer::new(&initial)))))
}

fn size_arg(args: &Args) -> Option<usize> {
    args.get(0)
        .and_then(Value::as_int)
        .filter(|n| *n >= 0)
        .map(|n| n as usize)
}

fn text_of(args: &Args, func: &str) -> ExecResult<String> {
    args.check(func, 1, 1)?;
    match &args.positional[0] {
        Value::Str(s) => Ok(s.to_string()),
        other => Err(Exception::type_error(format!(
            "{func}() argument must be str, not {}",
            other.type_name()
        ))),
    }
}

fn lines_value(lines: Vec<String>) -> Value {
    Value::list(lines.into_iter().map(Value::str).collect())
}

pub fn stringio_method(buffer: &Mutex<TextBuffer>, name: &str, args: Args) -> ExecResult<Value> {
    let mut buffer = buffer.lock();
    match name {
        "write" => {
            let text = text_of(&args, "write")?;
            Ok(Value::Int(buffer.write(&text)? as i64))
        }
        "writelines" => {
            for line in ops::collect(&args.positional.first().cloned().unwrap_or(Value::None))? {
                buffer.write(&line.to_str())?;
            }
            Ok(Value::None)
        }
        "read" => Ok(Value::str(buffer.read(size_arg(&args))?)),
        "readline" => Ok(Value::str(buffer.readline()?)),
        "readlines" => Ok(lines_value(buffer.readlines()?)),
        "getvalue" => Ok(Value::str(buffer.getvalue()?)),
        "seek" => {
            buffer.check_open()?;
            let pos = args
                .get(0)
                .and_then(Value::as_int)
                .filter(|n| *n >= 0)
                .ok_or_else(|| Exception::value_error("Negative seek position"))?;
            buffer.pos = pos as usize;
            Ok(Value::Int(pos))
        }
        "tell" => {
            buffer.check_open()?;
            Ok(Value::Int(buffer.pos as i64))
        }
        "close" => {
            buffer.close();
            Ok(Value::None)
        }
        _ => Err(Exception::attribute_error("StringIO", name)),
    }
}

pub fn file_property(file: &Mutex<FileHandle>, name: &str) -> Option<Value> {
    let file = file.lock();
    match name {
        "name" => Some(Value::str(file.name.as_str())),
        "mode" => Some(Value::str(file.mode.as_str())),
        "closed" => Some(Value::Bool(file.closed)),
        _ => None,
    }
}

pub fn file_method(
    interp: &mut Interpreter,
    file: &Mutex<FileHandle>,
    name: &str,
    args: Args,
) -> ExecResult<Value> {
    interp.tick()?;
    let mut file = file.lock();
    match name {
        "read" => {
            file.readable()?;
            Ok(Value::str(file.reader.read(size_arg(&args))?))
        }
        "readline" => {
            file.readable()?;
            Ok(Value::str(file.reader.readline()?))
        }
        "readlines" => {
            file.readable()?;
            Ok(lines_value(file.reader.readlines()?))
        }
        "write" => {
            let text = text_of(&args, "write")?;
            Ok(Value::Int(file.write(&text)? as i64))
        }
        "writelines" => {
            for line in ops::collect(&args.positional.first().cloned().unwrap_or(Value::None))? {
                file.write(&line.to_str())?;
            }
            Ok(Value::None)
        }
        "flush" => {
            file.check_open()?;
            if let Some(writer) = file.writer.as_mut() {
                writer
                    .flush()
                    .map_err(|e| Exception::new(ExcType::OSError, e.to_string()))?;
            }
            Ok(Value::None)
        }
        "close" => {
            file.close();
            Ok(Value::None)
        }
        _ => Err(Exception::attribute_error("TextIOWrapper", name)),
    }
}

/// `with manager as target`: files and buffers yield themselves.
pub fn context_enter(manager: &Value) -> ExecResult<Value> {
    match manager {
        Value::Native(n) if matches!(**n, Native::File(_) | Native::StringIO(_)) => {
            Ok(manager.clone())
        }
        other => Err(Exception::type_error(format!(
            "'{}' object does not support the context manager protocol",
            other.type_name()
        ))),
    }
}

/// Leaving a `with` block closes the managed object.
pub fn context_exit(manager: &Value) {
    if let Value::Native(n) = manager {
        match &**n {
            Native::File(f) => f.lock().close(),
            Native::StringIO(b) => b.lock().close(),
            _ => {}
        }
    }
}

/// Remaining lines when iterating a file-like object.
pub fn iter_lines(n: &Arc<Native>) -> ExecResult<Option<Vec<Value>>> {
    let lines = match &**n {
        Native::File(f) => {
            let mut file = f.lock();
            file.readable()?;
            file.reader.readlines()?
        }
        Native::StringIO(b) => b.lock().readlines()?,
        _ => return Ok(None),
    };
    Ok(Some(lines.into_iter().map(Value::str).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_overwrites_from_cursor() {
        let mut buf = TextBuffer::new("abc");
        buf.write("x").unwrap();
        assert_eq!(buf.getvalue().unwrap(), "xbc");
        buf.pos = 3;
        buf.write("de").unwrap();
        assert_eq!(buf.getvalue().unwrap(), "xbcde");
    }

    #[test]
    fn test_buffer_readline_and_readlines() {
        let mut buf = TextBuffer::new("one\ntwo\nthree");
        assert_eq!(buf.readline().unwrap(), "one\n");
        assert_eq!(buf.readlines().unwrap(), vec!["two\n", "three"]);
        assert_eq!(buf.read(None).unwrap(), "");
    }

    #[test]
    fn test_closed_buffer_rejects_io() {
        let mut buf = TextBuffer::new("data");
        buf.close();
        let err = buf.getvalue().unwrap_err();
        assert_eq!(err.message(), "I/O operation on closed file.");
    }

    #[test]
    fn test_io_error_mapping() {
        let err = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(io_error(&err, "x.txt").kind(), ExcType::FileNotFoundError);
        let err = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert_eq!(io_error(&err, "x.txt").kind(), ExcType::PermissionError);
    }
}
