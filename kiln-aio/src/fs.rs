// kiln-aio/src/fs.rs
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

use kiln_common::error::{KilnError, Result};
use tempfile::NamedTempFile;
use tracing::{debug, error};
use walkdir::WalkDir;

/// Atomically writes data to a file using a temporary file in the same directory.
pub fn atomic_write_file(original_path: &Path, content: &[u8]) -> Result<()> {
    let dir = original_path.parent().ok_or_else(|| {
        KilnError::Generic(format!(
            "Cannot get parent directory for {}",
            original_path.display()
        ))
    })?;
    fs::create_dir_all(dir)?;

    let mut temp_file = NamedTempFile::new_in(dir)?;
    debug!(
        "Atomically writing {} bytes to {} via temp file {}",
        content.len(),
        original_path.display(),
        temp_file.path().display()
    );
    temp_file.write_all(content)?;
    temp_file.flush()?;
    temp_file.as_file().sync_all()?;

    temp_file.persist(original_path).map_err(|e| {
        error!(
            "Failed to persist temporary file over {}: {}",
            original_path.display(),
            e.error
        );
        KilnError::from(e.error)
    })?;
    Ok(())
}

/// Removes a file or symlink; a missing path is not an error.
pub fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Removes a directory tree; a missing path is not an error.
pub fn remove_dir_all_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Whether anything (including a dangling symlink) exists at `path`.
pub fn path_exists_or_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

#[cfg(unix)]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link).map_err(|e| {
        error!(
            "Failed to create symlink {} -> {}: {}",
            link.display(),
            target.display(),
            e
        );
        KilnError::from(e)
    })
}

#[cfg(not(unix))]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    Err(KilnError::Generic(format!(
        "Symlinks are not supported on this platform ({} -> {})",
        link.display(),
        target.display()
    )))
}

/// Recursively copies `src` into `dst`, recreating symlinks as symlinks and
/// keeping file permissions.
pub fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| {
            KilnError::Generic(format!("Failed to walk {}: {e}", src.display()))
        })?;
        let rel = entry.path().strip_prefix(src).map_err(|e| {
            KilnError::Generic(format!("Path {} outside {}: {e}", entry.path().display(), src.display()))
        })?;
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link_target = fs::read_link(entry.path())?;
            remove_file_if_exists(&target)?;
            create_symlink(&link_target, &target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            // fs::copy carries the permission bits over.
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Moves `src` to `dst`, falling back to copy + delete across filesystems.
pub fn move_dir(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!(
                "rename {} -> {} failed ({}); copying instead",
                src.display(),
                dst.display(),
                e
            );
            copy_dir_all(src, dst)?;
            fs::remove_dir_all(src)?;
            Ok(())
        }
    }
}
