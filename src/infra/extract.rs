//! Safe extraction of possibly zstd-compressed tar archives
//!
//! The first four bytes of the file decide the codec: the little-endian
//! zstd frame magic `0xFD2FB528` (bytes `28 B5 2F FD`) selects a zstd
//! decoder, anything else is read as a plain tar. Entries whose path would
//! resolve outside the destination are rejected before anything is
//! written for them. Only directories and regular file contents are
//! materialized; permissions, owners and links are left to the caller.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, trace};

use crate::error::ArchiveError;

/// zstd frame magic number
pub const ZSTD_MAGIC: u32 = 0xFD2F_B528;

fn io_error(path: &Path, e: impl std::fmt::Display) -> ArchiveError {
    ArchiveError::Io {
        path: path.to_path_buf(),
        error: e.to_string(),
    }
}

/// Read the little-endian magic number at the start of `path`
pub fn read_magic(path: &Path) -> Result<u32, ArchiveError> {
    let mut file = File::open(path).map_err(|e| io_error(path, e))?;
    let mut bytes = [0u8; 4];
    file.read_exact(&mut bytes)
        .map_err(|_| ArchiveError::MagicBytes {
            path: path.to_path_buf(),
        })?;
    Ok(u32::from_le_bytes(bytes))
}

/// Whether `path` starts with a zstd frame
pub fn is_zstd(path: &Path) -> Result<bool, ArchiveError> {
    Ok(read_magic(path)? == ZSTD_MAGIC)
}

/// Open `path` as a decoded tar byte stream
pub fn open_tar(path: &Path) -> Result<Box<dyn Read>, ArchiveError> {
    let compressed = is_zstd(path)?;
    let file = BufReader::new(File::open(path).map_err(|e| io_error(path, e))?);
    if compressed {
        debug!("Reading {} as zstd compressed tar", path.display());
        let decoder = zstd::stream::read::Decoder::with_buffer(file).map_err(|e| io_error(path, e))?;
        Ok(Box::new(decoder))
    } else {
        Ok(Box::new(file))
    }
}

/// Normalize an entry path to a relative path inside the destination
///
/// Returns `None` if the path is absolute or climbs above its root.
pub fn contained_path(entry: &Path) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in entry.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(normalized)
}

/// Extract the archive at `archive` into `destination`
pub fn extract(archive: &Path, destination: &Path) -> Result<(), ArchiveError> {
    std::fs::create_dir_all(destination).map_err(|e| io_error(destination, e))?;
    let root = destination
        .canonicalize()
        .map_err(|e| io_error(destination, e))?;

    let mut tar = tar::Archive::new(open_tar(archive)?);
    for entry in tar.entries().map_err(|e| io_error(archive, e))? {
        let mut entry = entry.map_err(|e| io_error(archive, e))?;
        let entry_path = entry.path().map_err(|e| io_error(archive, e))?.into_owned();
        let traversal = || ArchiveError::PathTraversal {
            entry: entry_path.display().to_string(),
            destination: destination.to_path_buf(),
        };

        let relative = contained_path(&entry_path).ok_or_else(traversal)?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = root.join(&relative);
        let entry_type = entry.header().entry_type();

        if entry_type.is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| io_error(&target, e))?;
            ensure_inside(&root, &target).map_err(|_| traversal())?;
        } else if entry_type.is_file() || entry_type == tar::EntryType::Continuous {
            let parent = target.parent().unwrap_or(&root);
            std::fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
            ensure_inside(&root, parent).map_err(|_| traversal())?;
            let mut out = File::create(&target).map_err(|e| io_error(&target, e))?;
            io::copy(&mut entry, &mut out).map_err(|e| io_error(&target, e))?;
        } else {
            trace!("Skipping {:?} entry {}", entry_type, entry_path.display());
        }
    }
    Ok(())
}

/// Fail unless the canonical form of `path` lies under `root`
fn ensure_inside(root: &Path, path: &Path) -> io::Result<()> {
    let canonical = path.canonicalize()?;
    if canonical.starts_with(root) {
        Ok(())
    } else {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "outside destination"))
    }
}
