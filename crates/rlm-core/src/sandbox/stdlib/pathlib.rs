//! `pathlib.Path` confined to the sandbox directories.

use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use walkdir::WalkDir;

use super::io::{io_error, open_path};
use super::{module, text_arg};
use crate::sandbox::error::{ExcType, ExecResult, Exception};
use crate::sandbox::fs::Access;
use crate::sandbox::interpreter::Interpreter;
use crate::sandbox::value::{Args, Native, TypeObj, Value};

pub const METHODS: &[&str] = &[
    "exists", "is_file", "is_dir", "read_text", "write_text", "mkdir", "iterdir", "glob",
    "rglob", "joinpath", "with_suffix", "with_name", "resolve", "absolute", "open", "unlink",
    "as_posix", "is_absolute",
];
pub const PROPERTIES: &[&str] = &["name", "stem", "suffix", "suffixes", "parent", "parts"];
pub const CLASS_METHODS: &[&str] = &["cwd"];

pub fn module_value() -> Value {
    module(
        "pathlib",
        vec![
            ("Path", Value::Type(TypeObj::Path)),
            ("PurePath", Value::Type(TypeObj::Path)),
            ("PosixPath", Value::Type(TypeObj::Path)),
        ],
    )
}

fn path_value(path: PathBuf) -> Value {
    Value::native(Native::Path(path))
}

/// A path segment given as `str` or `Path`.
pub(crate) fn segment(value: &Value) -> ExecResult<PathBuf> {
    match value {
        Value::Str(s) => Ok(PathBuf::from(&**s)),
        Value::Native(n) => match &**n {
            Native::Path(p) => Ok(p.clone()),
            _ => Err(segment_error(value)),
        },
        _ => Err(segment_error(value)),
    }
}

fn segment_error(value: &Value) -> Exception {
    Exception::type_error(format!(
        "expected str, bytes or os.PathLike object, not {}",
        value.type_name()
    ))
}

pub fn construct(args: Args) -> ExecResult<Value> {
    args.no_kwargs("Path")?;
    let mut path = PathBuf::new();
    for part in &args.positional {
        path.push(segment(part)?);
    }
    if path.as_os_str().is_empty() {
        path.push(".");
    }
    Ok(path_value(path))
}

fn file_name(p: &Path) -> String {
    p.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn suffix(p: &Path) -> String {
    let name = file_name(p);
    match name.rfind('.') {
        Some(i) if i > 0 && i + 1 < name.len() => name[i..].to_string(),
        _ => String::new(),
    }
}

pub fn property(p: &Path, name: &str) -> Option<Value> {
    let value = match name {
        "name" => Value::str(file_name(p)),
        "suffix" => Value::str(suffix(p)),
        "stem" => {
            let full = file_name(p);
            let ext = suffix(p);
            Value::str(&full[..full.len() - ext.len()])
        }
        "suffixes" => {
            let full = file_name(p);
            let trimmed = full.trim_start_matches('.');
            let parts: Vec<Value> = trimmed
                .split('.')
                .skip(1)
                .filter(|s| !s.is_empty())
                .map(|s| Value::str(format!(".{s}")))
                .collect();
            Value::list(parts)
        }
        "parent" => {
            let parent = p
                .parent()
                .filter(|q| !q.as_os_str().is_empty())
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
            path_value(parent)
        }
        "parts" => Value::tuple(
            p.components()
                .map(|c| Value::str(c.as_os_str().to_string_lossy().into_owned()))
                .collect(),
        ),
        _ => return None,
    };
    Some(value)
}

fn display(p: &Path) -> String {
    p.display().to_string()
}

fn resolve(interp: &Interpreter, p: &Path, access: Access) -> ExecResult<PathBuf> {
    interp.fs().resolve(&display(p), access)
}

fn flag(args: &Args, name: &str) -> bool {
    args.kwarg(name).is_some_and(Value::truthy)
}

fn children(interp: &Interpreter, p: &Path) -> ExecResult<Vec<PathBuf>> {
    let dir = resolve(interp, p, Access::Read)?;
    let entries = std::fs::read_dir(&dir).map_err(|e| io_error(&e, &display(p)))?;
    let mut names: Vec<_> = entries
        .filter_map(Result::ok)
        .map(|e| e.file_name())
        .collect();
    names.sort();
    Ok(names.into_iter().map(|n| p.join(n)).collect())
}

/// Matches `pattern` below `p`; `**` descends into subdirectories.
fn glob_paths(interp: &Interpreter, p: &Path, pattern: &str) -> ExecResult<Vec<PathBuf>> {
    let root = resolve(interp, p, Access::Read)?;
    let matcher = Pattern::new(pattern)
        .map_err(|e| Exception::value_error(format!("invalid glob pattern: {e}")))?;
    let options = MatchOptions {
        require_literal_separator: true,
        ..MatchOptions::default()
    };
    let mut walker = WalkDir::new(&root).min_depth(1).sort_by_file_name();
    if !pattern.contains("**") {
        walker = walker.max_depth(pattern.split('/').count());
    }
    let mut out = Vec::new();
    for entry in walker.into_iter().filter_map(Result::ok) {
        let Ok(rel) = entry.path().strip_prefix(&root) else {
            continue;
        };
        if matcher.matches_path_with(rel, options) {
            out.push(p.join(rel));
        }
    }
    Ok(out)
}

fn paths_value(paths: Vec<PathBuf>) -> Value {
    Value::list(paths.into_iter().map(path_value).collect())
}

pub fn method(interp: &mut Interpreter, p: &Path, name: &str, args: Args) -> ExecResult<Value> {
    interp.tick()?;
    match name {
        "exists" => Ok(Value::Bool(
            resolve(interp, p, Access::Read).is_ok_and(|r| r.exists()),
        )),
        "is_file" => Ok(Value::Bool(
            resolve(interp, p, Access::Read).is_ok_and(|r| r.is_file()),
        )),
        "is_dir" => Ok(Value::Bool(
            resolve(interp, p, Access::Read).is_ok_and(|r| r.is_dir()),
        )),
        "read_text" => {
            let resolved = resolve(interp, p, Access::Read)?;
            std::fs::read_to_string(resolved)
                .map(Value::str)
                .map_err(|e| io_error(&e, &display(p)))
        }
        "write_text" => {
            let data = text_arg(&args, 0, "data", "write_text")?;
            let resolved = resolve(interp, p, Access::Write)?;
            std::fs::write(resolved, data.as_bytes()).map_err(|e| io_error(&e, &display(p)))?;
            Ok(Value::Int(data.chars().count() as i64))
        }
        "mkdir" => {
            let resolved = resolve(interp, p, Access::Write)?;
            let parents = flag(&args, "parents");
            let exist_ok = flag(&args, "exist_ok");
            if resolved.is_dir() {
                if exist_ok {
                    return Ok(Value::None);
                }
                return Err(Exception::new(
                    ExcType::OSError,
                    format!("[Errno 17] File exists: '{}'", display(p)),
                ));
            }
            let result = if parents {
                std::fs::create_dir_all(&resolved)
            } else {
                std::fs::create_dir(&resolved)
            };
            result.map_err(|e| io_error(&e, &display(p)))?;
            Ok(Value::None)
        }
        "iterdir" => Ok(paths_value(children(interp, p)?)),
        "glob" => {
            let pattern = text_arg(&args, 0, "pattern", "glob")?;
            Ok(paths_value(glob_paths(interp, p, &pattern)?))
        }
        "rglob" => {
            let pattern = text_arg(&args, 0, "pattern", "rglob")?;
            Ok(paths_value(glob_paths(interp, p, &format!("**/{pattern}"))?))
        }
        "joinpath" => {
            let mut joined = p.to_path_buf();
            for part in &args.positional {
                joined.push(segment(part)?);
            }
            Ok(path_value(joined))
        }
        "with_suffix" => {
            let new_suffix = text_arg(&args, 0, "suffix", "with_suffix")?;
            if !new_suffix.is_empty() && !new_suffix.starts_with('.') {
                return Err(Exception::value_error(format!(
                    "Invalid suffix '{new_suffix}'"
                )));
            }
            let stem = property(p, "stem").map(|v| v.to_str()).unwrap_or_default();
            Ok(path_value(p.with_file_name(format!("{stem}{new_suffix}"))))
        }
        "with_name" => {
            let new_name = text_arg(&args, 0, "name", "with_name")?;
            Ok(path_value(p.with_file_name(&*new_name)))
        }
        "resolve" | "absolute" => Ok(path_value(resolve(interp, p, Access::Read)?)),
        "open" => {
            let mode = match args.arg(0, "mode") {
                Some(Value::Str(m)) => m.to_string(),
                _ => "r".to_string(),
            };
            open_path(interp, &display(p), &mode)
        }
        "unlink" => {
            let resolved = resolve(interp, p, Access::Write)?;
            match std::fs::remove_file(resolved) {
                Ok(()) => Ok(Value::None),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && flag(&args, "missing_ok") => {
                    Ok(Value::None)
                }
                Err(e) => Err(io_error(&e, &display(p))),
            }
        }
        "as_posix" => Ok(Value::str(display(p))),
        "is_absolute" => Ok(Value::Bool(p.is_absolute())),
        _ => Err(Exception::attribute_error("PosixPath", name)),
    }
}

pub fn class_method(interp: &mut Interpreter, name: &str, args: Args) -> ExecResult<Value> {
    match name {
        "cwd" => {
            args.check("cwd", 0, 0)?;
            let dir = interp
                .fs()
                .working_dir()
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
            Ok(path_value(dir))
        }
        _ => Err(Exception::new(
            ExcType::AttributeError,
            format!("type object 'Path' has no attribute '{name}'"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prop(path: &str, name: &str) -> String {
        property(Path::new(path), name).unwrap().to_str()
    }

    #[test]
    fn test_name_parts() {
        assert_eq!(prop("out/report.final.md", "name"), "report.final.md");
        assert_eq!(prop("out/report.final.md", "suffix"), ".md");
        assert_eq!(prop("out/report.final.md", "stem"), "report.final");
        assert_eq!(prop("out/.hidden", "suffix"), "");
        assert_eq!(prop("file.txt", "parent"), ".");
    }

    #[test]
    fn test_construct_joins_segments() {
        let value = construct(Args::new(vec![Value::str("data"), Value::str("a.csv")])).unwrap();
        assert_eq!(value.to_str(), "data/a.csv");
        assert_eq!(construct(Args::default()).unwrap().to_str(), ".");
    }

    #[test]
    fn test_segment_rejects_numbers() {
        assert!(segment(&Value::Int(3)).is_err());
    }
}
