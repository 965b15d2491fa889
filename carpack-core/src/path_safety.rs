use std::path::{Component, Path, PathBuf};

use crate::error::{Error, IoContext, Result};

/// A span path resolved against the base directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Where to open the file.
    pub full: PathBuf,
    /// Name segments below the base directory; never empty.
    pub segments: Vec<String>,
}

impl ResolvedPath {
    pub fn rel(&self) -> String {
        self.segments.join("/")
    }
}

/// Absolute, lexically normalised form of `base`.
pub fn absolute_base(base: &Path) -> Result<PathBuf> {
    let cwd = std::env::current_dir().io_context(|| "resolve current directory")?;
    Ok(normalize(&cwd.join(base)))
}

/// Resolve `path` (absolute, or relative to the working directory the way it
/// would be opened) and ensure it lies strictly below `abs_base`.
///
/// `abs_base` must come from [`absolute_base`]. No symlinks are resolved: the
/// check is on the path as written.
pub fn resolve_under(abs_base: &Path, path: &str) -> Result<ResolvedPath> {
    let cwd = std::env::current_dir().io_context(|| "resolve current directory")?;
    let full = normalize(&cwd.join(path));
    let rel = pathdiff::diff_paths(&full, abs_base).ok_or_else(|| outside(path, abs_base))?;
    let mut segments = Vec::new();
    for comp in rel.components() {
        match comp {
            Component::Normal(s) => segments.push(s.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return Err(outside(path, abs_base)),
        }
    }
    if segments.is_empty() {
        return Err(Error::Manifest(format!(
            "span path {path:?} names the base directory itself, not a file below it"
        )));
    }
    Ok(ResolvedPath { full, segments })
}

fn outside(path: &str, base: &Path) -> Error {
    Error::Manifest(format!("span path {path:?} is outside base directory {}", base.display()))
}

/// Collapse `.` and `..` without touching the filesystem.
fn normalize(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in p.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(comp);
                }
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn accepts_nested_relative_and_absolute() {
        let base = absolute_base(Path::new("/data/set")).unwrap();
        let r = resolve_under(&base, "/data/set/a/b.bin").unwrap();
        assert_eq!(r.segments, vec!["a", "b.bin"]);
        assert_eq!(r.rel(), "a/b.bin");
        let r = resolve_under(&base, "/data/set/./a/../c.bin").unwrap();
        assert_eq!(r.segments, vec!["c.bin"]);
    }

    #[test]
    fn rejects_escape_and_base_itself() {
        let base = absolute_base(Path::new("/data/set")).unwrap();
        let err = resolve_under(&base, "/data/other/x").unwrap_err();
        assert!(err.to_string().contains("outside base"));
        assert!(resolve_under(&base, "/data/set/../set2/x").is_err());
        assert!(resolve_under(&base, "/data/set").is_err());
    }
}
