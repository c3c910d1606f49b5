//! File-copy collaborator.
//!
//! Copies go through `cp` so that globs in `%files` sources, symlink
//! dereferencing and special files behave the way users expect from a
//! shell.

use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Joins `path` onto `base`, treating `path` as rooted at `base` even when
/// absolute. `..` components cannot climb above `base`.
pub fn add_prefix(base: &Path, path: &Path) -> PathBuf {
    let mut out = base.to_path_buf();
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
            Component::ParentDir if depth > 0 => {
                out.pop();
                depth -= 1;
            }
            _ => {}
        }
    }
    out
}

/// Copies `src` to `dst` with `cp -fLr`, creating `dst`'s parent first.
///
/// `src` is expanded by the shell so that glob patterns work; `dst` is
/// passed as a positional argument and is never interpreted.
pub fn copy(src: &Path, dst: &Path) -> Result<()> {
    let script = format!("cp -fLr {} \"$0\"", src.display());
    run_cp(&script, src, dst, None)
}

/// Copies `src`, rooted at `base`, to `dst`.
///
/// Only `src` is subject to glob expansion. `base` reaches the shell as a
/// quoted positional argument, so whitespace or metacharacters in it are
/// taken literally. `..` in `src` cannot climb above `base`.
pub fn copy_from(base: &Path, src: &str, dst: &Path) -> Result<()> {
    let rooted = add_prefix(Path::new("/"), Path::new(src));
    let script = format!("cp -fLr \"$1\"{} \"$0\"", rooted.display());
    run_cp(&script, &add_prefix(base, Path::new(src)), dst, Some(base))
}

fn run_cp(script: &str, src: &Path, dst: &Path, base: Option<&Path>) -> Result<()> {
    let fail = |reason: String| Error::CopyFailed {
        src: src.to_path_buf(),
        dst: dst.to_path_buf(),
        reason,
    };

    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent).map_err(|e| fail(e.to_string()))?;
    }

    debug!(src = %src.display(), dst = %dst.display(), "copying");

    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(script).arg(dst);
    if let Some(base) = base {
        cmd.arg(base);
    }
    let output = cmd.output().map_err(|e| fail(e.to_string()))?;

    if !output.status.success() {
        return Err(fail(String::from_utf8_lossy(&output.stderr).trim().to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_add_prefix_absolute() {
        let p = add_prefix(Path::new("/bundle/rootfs"), Path::new("/usr/bin"));
        assert_eq!(p, PathBuf::from("/bundle/rootfs/usr/bin"));
    }

    #[test]
    fn test_add_prefix_cannot_escape() {
        let p = add_prefix(Path::new("/bundle/rootfs"), Path::new("/../../etc/passwd"));
        assert_eq!(p, PathBuf::from("/bundle/rootfs/etc/passwd"));

        let p = add_prefix(Path::new("/bundle/rootfs"), Path::new("a/../b"));
        assert_eq!(p, PathBuf::from("/bundle/rootfs/b"));
    }

    #[test]
    fn test_copy_file_creates_parent() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src.txt");
        std::fs::write(&src, "data").unwrap();
        let dst = temp.path().join("a/b/dst.txt");

        copy(&src, &dst).unwrap();
        assert_eq!(std::fs::read_to_string(&dst).unwrap(), "data");
    }

    #[test]
    fn test_copy_missing_source_fails() {
        let temp = TempDir::new().unwrap();
        let err = copy(&temp.path().join("nope"), &temp.path().join("dst")).unwrap_err();
        assert!(matches!(err, Error::CopyFailed { .. }));
    }

    #[test]
    fn test_copy_from_base_with_spaces_and_metacharacters() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("my tmp; touch owned");
        std::fs::create_dir_all(base.join("etc")).unwrap();
        std::fs::write(base.join("etc/a.conf"), "a").unwrap();
        std::fs::write(base.join("etc/b.conf"), "b").unwrap();
        let dst = temp.path().join("out dir/etc");

        std::fs::create_dir_all(&dst).unwrap();
        copy_from(&base, "/etc/*.conf", &dst).unwrap();

        assert_eq!(std::fs::read_to_string(dst.join("a.conf")).unwrap(), "a");
        assert_eq!(std::fs::read_to_string(dst.join("b.conf")).unwrap(), "b");
        assert!(!temp.path().join("owned").exists());
        assert!(!Path::new("owned").exists());
    }

    #[test]
    fn test_copy_from_cannot_escape_base() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("rootfs");
        std::fs::create_dir_all(&base).unwrap();
        std::fs::write(temp.path().join("secret"), "x").unwrap();

        let err = copy_from(&base, "../secret", &temp.path().join("dst")).unwrap_err();
        match err {
            Error::CopyFailed { src, .. } => assert_eq!(src, base.join("secret")),
            other => panic!("unexpected error: {}", other),
        }
    }
}
