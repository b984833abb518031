//! `os` and `os.path`, routed through [`SandboxFs`](crate::sandbox::fs::SandboxFs).

use std::path::PathBuf;

use super::io::io_error;
use super::pathlib::segment;
use super::{func, module};
use crate::sandbox::error::{ExcType, ExecResult, Exception};
use crate::sandbox::fs::Access;
use crate::sandbox::interpreter::Interpreter;
use crate::sandbox::value::{Args, Value};

pub fn module_value() -> Value {
    module(
        "os",
        vec![
            ("listdir", func("listdir", os_listdir)),
            ("getcwd", func("getcwd", os_getcwd)),
            ("makedirs", func("makedirs", os_makedirs)),
            ("remove", func("remove", os_remove)),
            ("sep", Value::str("/")),
            ("linesep", Value::str("\n")),
            ("path", path_module()),
        ],
    )
}

pub fn path_module() -> Value {
    module(
        "posixpath",
        vec![
            ("exists", func("exists", path_exists)),
            ("isfile", func("isfile", path_isfile)),
            ("isdir", func("isdir", path_isdir)),
            ("getsize", func("getsize", path_getsize)),
            ("abspath", func("abspath", path_abspath)),
            ("join", func("join", path_join)),
            ("basename", func("basename", path_basename)),
            ("dirname", func("dirname", path_dirname)),
            ("split", func("split", path_split)),
            ("splitext", func("splitext", path_splitext)),
            ("sep", Value::str("/")),
        ],
    )
}

fn path_text(args: &Args, index: usize, name: &str, func: &str) -> ExecResult<String> {
    let value = args.required(index, name, func)?;
    Ok(segment(&value)?.display().to_string())
}

fn os_listdir(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("listdir", 0, 1)?;
    let path = match args.get(0) {
        Some(v) => segment(v)?.display().to_string(),
        None => ".".to_string(),
    };
    let dir = interp.fs().resolve(&path, Access::Read)?;
    let entries = std::fs::read_dir(&dir).map_err(|e| io_error(&e, &path))?;
    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    Ok(Value::list(names.into_iter().map(Value::str).collect()))
}

fn os_getcwd(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("getcwd", 0, 0)?;
    let dir = interp
        .fs()
        .working_dir()
        .map_or_else(|| PathBuf::from("."), |p| p.to_path_buf());
    Ok(Value::str(dir.display().to_string()))
}

fn os_makedirs(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("makedirs", 1, 2)?;
    let path = path_text(&args, 0, "name", "makedirs")?;
    let exist_ok = args.arg(1, "exist_ok").is_some_and(|v| v.truthy());
    let dir = interp.fs().resolve(&path, Access::Write)?;
    if dir.is_dir() && !exist_ok {
        return Err(Exception::new(
            ExcType::OSError,
            format!("[Errno 17] File exists: '{path}'"),
        ));
    }
    std::fs::create_dir_all(&dir).map_err(|e| io_error(&e, &path))?;
    Ok(Value::None)
}

fn os_remove(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("remove", 1, 1)?;
    let path = path_text(&args, 0, "path", "remove")?;
    let target = interp.fs().resolve(&path, Access::Write)?;
    std::fs::remove_file(target).map_err(|e| io_error(&e, &path))?;
    Ok(Value::None)
}

fn probe(interp: &Interpreter, args: &Args, func: &str, test: fn(&std::path::Path) -> bool) -> ExecResult<Value> {
    args.check(func, 1, 1)?;
    let path = path_text(args, 0, "path", func)?;
    Ok(Value::Bool(
        interp
            .fs()
            .resolve(&path, Access::Read)
            .is_ok_and(|p| test(&p)),
    ))
}

fn path_exists(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    probe(interp, &args, "exists", |p| p.exists())
}

fn path_isfile(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    probe(interp, &args, "isfile", |p| p.is_file())
}

fn path_isdir(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    probe(interp, &args, "isdir", |p| p.is_dir())
}

fn path_getsize(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("getsize", 1, 1)?;
    let path = path_text(&args, 0, "path", "getsize")?;
    let resolved = interp.fs().resolve(&path, Access::Read)?;
    let meta = std::fs::metadata(resolved).map_err(|e| io_error(&e, &path))?;
    Ok(Value::Int(meta.len() as i64))
}

fn path_abspath(interp: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("abspath", 1, 1)?;
    let path = path_text(&args, 0, "path", "abspath")?;
    let resolved = interp.fs().resolve(&path, Access::Read)?;
    Ok(Value::str(resolved.display().to_string()))
}

/// `os.path.join`: an absolute component discards everything before it.
pub fn join(parts: &[String]) -> String {
    let mut out = String::new();
    for part in parts {
        if part.starts_with('/') {
            out = part.clone();
        } else if out.is_empty() || out.ends_with('/') {
            out.push_str(part);
        } else {
            out.push('/');
            out.push_str(part);
        }
    }
    out
}

/// Splits at the last `/`; the head keeps a lone root slash.
pub fn split(path: &str) -> (String, String) {
    match path.rfind('/') {
        Some(i) => {
            let head = &path[..=i];
            let trimmed = head.trim_end_matches('/');
            let head = if trimmed.is_empty() { head } else { trimmed };
            (head.to_string(), path[i + 1..].to_string())
        }
        None => (String::new(), path.to_string()),
    }
}

pub fn splitext(path: &str) -> (String, String) {
    let (_, base) = split(path);
    let stem_start = path.len() - base.len();
    let leading = base.len() - base.trim_start_matches('.').len();
    match base.rfind('.') {
        Some(i) if i >= leading => {
            let at = stem_start + i;
            (path[..at].to_string(), path[at..].to_string())
        }
        _ => (path.to_string(), String::new()),
    }
}

fn path_join(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    if args.positional.is_empty() {
        return Err(Exception::type_error("join() missing required argument: 'a'"));
    }
    let parts = args
        .positional
        .iter()
        .map(|v| segment(v).map(|p| p.display().to_string()))
        .collect::<ExecResult<Vec<_>>>()?;
    Ok(Value::str(join(&parts)))
}

fn path_basename(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("basename", 1, 1)?;
    let path = path_text(&args, 0, "p", "basename")?;
    Ok(Value::str(split(&path).1))
}

fn path_dirname(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("dirname", 1, 1)?;
    let path = path_text(&args, 0, "p", "dirname")?;
    Ok(Value::str(split(&path).0))
}

fn path_split(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("split", 1, 1)?;
    let path = path_text(&args, 0, "p", "split")?;
    let (head, tail) = split(&path);
    Ok(Value::tuple(vec![Value::str(head), Value::str(tail)]))
}

fn path_splitext(_: &mut Interpreter, args: Args) -> ExecResult<Value> {
    args.check("splitext", 1, 1)?;
    let path = path_text(&args, 0, "p", "splitext")?;
    let (root, ext) = splitext(&path);
    Ok(Value::tuple(vec![Value::str(root), Value::str(ext)]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::fs::SandboxFs;
    use crate::sandbox::interpreter::{ExecContext, ExecutionLimits};
    use crate::sandbox::namespace::Namespace;
    use indexmap::IndexMap;
    use std::sync::Arc;

    fn strings(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_join_resets_on_absolute() {
        assert_eq!(join(&strings(&["a", "b", "c.txt"])), "a/b/c.txt");
        assert_eq!(join(&strings(&["a/", "b"])), "a/b");
        assert_eq!(join(&strings(&["a", "/etc", "x"])), "/etc/x");
    }

    #[test]
    fn test_split_and_splitext() {
        assert_eq!(split("a/b/c.txt"), ("a/b".into(), "c.txt".into()));
        assert_eq!(split("/c"), ("/".into(), "c".into()));
        assert_eq!(split("c"), ("".into(), "c".into()));
        assert_eq!(splitext("a/b.tar.gz"), ("a/b.tar".into(), ".gz".into()));
        assert_eq!(splitext(".bashrc"), (".bashrc".into(), "".into()));
    }

    #[test]
    fn test_listdir_is_confined() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "x").unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        let ns = Namespace::new(Arc::new(IndexMap::new()), IndexMap::new());
        let ctx = ExecContext {
            fs: Arc::new(SandboxFs::new(Some(dir.path().to_path_buf()), None)),
            host: None,
        };
        let mut interp = Interpreter::new(ns, ctx, ExecutionLimits::default());
        let listed = os_listdir(&mut interp, Args::default()).unwrap();
        assert_eq!(listed.repr(), "['a.txt', 'b.txt']");
        let err = os_listdir(&mut interp, Args::new(vec![Value::str("/")])).unwrap_err();
        assert_eq!(err.kind(), ExcType::PermissionError);
    }
}
