//! Path confinement for sandboxed file access.
//!
//! Relative paths resolve against the working directory instead of the
//! process working directory, so concurrent agents never race on a shared
//! cwd. Writes must land under the working directory; reads may also target
//! the context directory.

use std::path::{Component, Path, PathBuf};

use super::error::{ExcType, ExecResult, Exception};

#[derive(Debug, Clone, Default)]
pub struct SandboxFs {
    working_dir: Option<PathBuf>,
    context_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl SandboxFs {
    pub fn new(working_dir: Option<PathBuf>, context_dir: Option<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.map(|p| canonical_or_lexical(&p)),
            context_dir: context_dir.map(|p| canonical_or_lexical(&p)),
        }
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    pub fn context_dir(&self) -> Option<&Path> {
        self.context_dir.as_deref()
    }

    /// Resolves `path` for `access`, rejecting anything outside the allowed roots.
    pub fn resolve(&self, path: &str, access: Access) -> ExecResult<PathBuf> {
        let Some(base) = self.working_dir.as_ref() else {
            return Err(Exception::new(
                ExcType::PermissionError,
                format!("file access is disabled in this sandbox: '{path}'"),
            ));
        };
        let raw = Path::new(path);
        let joined = if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            base.join(raw)
        };
        let resolved = canonical_or_lexical(&joined);
        let allowed = resolved.starts_with(base)
            || (access == Access::Read
                && self
                    .context_dir
                    .as_ref()
                    .is_some_and(|ctx| resolved.starts_with(ctx)));
        if allowed {
            Ok(resolved)
        } else {
            Err(Exception::new(
                ExcType::PermissionError,
                format!("access outside the sandbox directory is not allowed: '{path}'"),
            ))
        }
    }

    /// Relative display form used when handing paths back to code.
    pub fn display(&self, path: &Path) -> String {
        match self.working_dir.as_ref().and_then(|b| path.strip_prefix(b).ok()) {
            Some(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Some(rel) => rel.display().to_string(),
            None => path.display().to_string(),
        }
    }
}

/// Canonicalizes the longest existing prefix and normalizes the rest
/// lexically, so symlinks inside the tree cannot escape the root.
fn canonical_or_lexical(path: &Path) -> PathBuf {
    let normalized = normalize(path);
    let mut existing = normalized.clone();
    let mut rest = Vec::new();
    loop {
        if let Ok(real) = existing.canonicalize() {
            let mut out = real;
            for part in rest.iter().rev() {
                out.push(part);
            }
            return out;
        }
        match (existing.file_name().map(|n| n.to_os_string()), existing.parent()) {
            (Some(name), Some(parent)) => {
                rest.push(name);
                existing = parent.to_path_buf();
            }
            _ => return normalized,
        }
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_paths_resolve_under_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let fs = SandboxFs::new(Some(dir.path().to_path_buf()), None);
        let path = fs.resolve("out/chart.png", Access::Write).unwrap();
        assert!(path.starts_with(dir.path().canonicalize().unwrap()));
        assert!(path.ends_with("out/chart.png"));
    }

    #[test]
    fn test_parent_escape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let fs = SandboxFs::new(Some(dir.path().to_path_buf()), None);
        let err = fs.resolve("../../etc/passwd", Access::Read).unwrap_err();
        assert_eq!(err.kind(), ExcType::PermissionError);
    }

    #[test]
    fn test_context_dir_is_read_only() {
        let work = tempfile::tempdir().unwrap();
        let ctx = tempfile::tempdir().unwrap();
        let fs = SandboxFs::new(
            Some(work.path().to_path_buf()),
            Some(ctx.path().to_path_buf()),
        );
        let target = ctx.path().join("data.csv");
        let target = target.to_str().unwrap();
        assert!(fs.resolve(target, Access::Read).is_ok());
        assert!(fs.resolve(target, Access::Write).is_err());
    }

    #[test]
    fn test_no_working_dir_denies_everything() {
        let fs = SandboxFs::default();
        assert!(fs.resolve("a.txt", Access::Read).is_err());
    }
}
