//! Filesystem operations
//!
//! Handles file and directory operations.

use std::io::Write;
use std::path::Path;

use walkdir::WalkDir;

use crate::error::FilesystemError;

/// Create a directory and all parent directories
pub fn create_dir_all(path: &Path) -> Result<(), FilesystemError> {
    std::fs::create_dir_all(path).map_err(|e| FilesystemError::CreateDir {
        path: path.to_path_buf(),
        error: e.to_string(),
    })
}

/// Remove a directory and all its contents
pub fn remove_dir_all(path: &Path) -> Result<(), FilesystemError> {
    if path.exists() {
        std::fs::remove_dir_all(path).map_err(|e| FilesystemError::RemoveDir {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
    }
    Ok(())
}

/// Write content to a file
pub fn write_file(path: &Path, content: &str) -> Result<(), FilesystemError> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    std::fs::write(path, content).map_err(|e| FilesystemError::WriteFile {
        path: path.to_path_buf(),
        error: e.to_string(),
    })
}

/// Read content from a file
pub fn read_file(path: &Path) -> Result<String, FilesystemError> {
    std::fs::read_to_string(path).map_err(|e| FilesystemError::ReadFile {
        path: path.to_path_buf(),
        error: e.to_string(),
    })
}

/// Write bytes so that readers never observe a partial file
///
/// The content goes to a temporary file in the same directory, which is
/// then renamed over `path`.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<(), FilesystemError> {
    let parent = path.parent().unwrap_or(Path::new("."));
    create_dir_all(parent)?;
    let write_err = |e: std::io::Error| FilesystemError::WriteFile {
        path: path.to_path_buf(),
        error: e.to_string(),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(write_err)?;
    tmp.write_all(content).map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

/// Whether `path` is a directory with at least one entry
pub fn is_non_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Copy a file, or the contents of a directory, into `dest`
///
/// A file lands at `dest/<file name>`; a directory's children land
/// directly in `dest`. Symlinks are recreated, not followed.
pub fn copy_into(from: &Path, dest: &Path) -> Result<(), FilesystemError> {
    create_dir_all(dest)?;
    if from.is_file() {
        let name = from.file_name().unwrap_or(from.as_os_str());
        return copy_file(from, &dest.join(name));
    }

    for entry in WalkDir::new(from).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|e| FilesystemError::Copy {
            from: from.to_path_buf(),
            to: dest.to_path_buf(),
            error: e.to_string(),
        })?;
        let relative = entry.path().strip_prefix(from).unwrap_or(entry.path());
        let target = dest.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            copy_file(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn copy_file(from: &Path, to: &Path) -> Result<(), FilesystemError> {
    if let Some(parent) = to.parent() {
        create_dir_all(parent)?;
    }
    let copy_err = |e: std::io::Error| FilesystemError::Copy {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        error: e.to_string(),
    };
    std::fs::copy(from, to).map_err(copy_err)?;
    // Layer cache keys read the mtime of staged copies.
    let modified = std::fs::metadata(from).and_then(|m| m.modified()).map_err(copy_err)?;
    std::fs::OpenOptions::new()
        .write(true)
        .open(to)
        .and_then(|file| file.set_modified(modified))
        .map_err(copy_err)
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> Result<(), FilesystemError> {
    let copy_err = |e: std::io::Error| FilesystemError::Copy {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        error: e.to_string(),
    };
    let target = std::fs::read_link(from).map_err(copy_err)?;
    if to.symlink_metadata().is_ok() {
        std::fs::remove_file(to).map_err(copy_err)?;
    }
    std::os::unix::fs::symlink(target, to).map_err(copy_err)
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> Result<(), FilesystemError> {
    copy_file(from, to)
}
