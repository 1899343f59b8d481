//! Blocking directory helpers, run on the blocking pool.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{ControlError, ControlResult};

/// Recursively copies `src` into `dst`, skipping top-level entries named in `skip`.
pub fn copy_dir_blocking(src: &Path, dst: &Path, skip: &[&str]) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if skip.iter().any(|s| name == *s) {
            continue;
        }
        let target = dst.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_dir_blocking(&entry.path(), &target, &[])?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Removes `path` if present.
pub fn remove_dir_blocking(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Copies a directory tree on the blocking pool.
pub async fn copy_dir(src: PathBuf, dst: PathBuf, skip: &'static [&'static str]) -> io::Result<()> {
    tokio::task::spawn_blocking(move || copy_dir_blocking(&src, &dst, skip))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

/// Removes a directory tree on the blocking pool.
pub async fn remove_dir(path: PathBuf) -> io::Result<()> {
    tokio::task::spawn_blocking(move || remove_dir_blocking(&path))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

/// Reads a one-line marker file, `None` when it does not exist.
pub async fn read_marker(path: &Path) -> ControlResult<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => {
            let value = content.trim();
            Ok((!value.is_empty()).then(|| value.to_string()))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ControlError::io_untouched(
            format!("reading {}", path.display()),
            e,
        )),
    }
}

pub async fn write_marker(path: &Path, value: &str) -> ControlResult<()> {
    tokio::fs::write(path, format!("{}\n", value))
        .await
        .map_err(|e| ControlError::io_untouched(format!("writing {}", path.display()), e))
}

/// Deletes a marker file; a missing marker is fine.
pub async fn remove_marker(path: &Path) -> ControlResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ControlError::io_untouched(
            format!("removing {}", path.display()),
            e,
        )),
    }
}
