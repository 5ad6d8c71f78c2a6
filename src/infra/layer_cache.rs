//! Application layer cache of the daemonless backend
//!
//! Layers are keyed by a fingerprint of their source tree (relative paths,
//! kinds, modes, file sizes and modification times, link targets) plus the
//! ownership override, so an unchanged directory is never re-archived or
//! re-compressed. File contents are only hashed when a layer is built,
//! for its diff id. Staging preserves source mtimes.
//! Each entry is a `<key>.json` descriptor next to a
//! `blobs/<hex>.tar.gz` blob.
//!
//! The cache assumes a single writer; concurrent builds against the same
//! directory must be serialized by the caller.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::error::FilesystemError;
use crate::infra::filesystem;

/// A compressed layer blob and its digests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedLayer {
    /// `sha256:` digest of the compressed blob
    pub digest: String,
    /// `sha256:` digest of the uncompressed tar
    pub diff_id: String,
    /// Compressed size in bytes
    pub size: u64,
}

impl CachedLayer {
    fn hex(&self) -> &str {
        self.digest.trim_start_matches("sha256:")
    }
}

/// On-disk layer cache
#[derive(Debug, Clone)]
pub struct LayerCache {
    dir: PathBuf,
}

impl LayerCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fingerprint of `source` as it would be added at `/<name>`
    pub fn key(source: &Path, name: &str, owner: Option<&str>) -> Result<String, FilesystemError> {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update([0]);
        hasher.update(owner.unwrap_or_default().as_bytes());
        hasher.update([0]);

        for entry in WalkDir::new(source).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| FilesystemError::ReadFile {
                path: source.to_path_buf(),
                error: e.to_string(),
            })?;
            let meta = entry.path().symlink_metadata().map_err(|e| FilesystemError::ReadFile {
                path: entry.path().to_path_buf(),
                error: e.to_string(),
            })?;
            let read_err = |e: std::io::Error| FilesystemError::ReadFile {
                path: entry.path().to_path_buf(),
                error: e.to_string(),
            };
            let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update([0]);
            hasher.update(format!("{}:{}", file_kind(&meta), mode(&meta)));
            hasher.update([0]);
            if meta.file_type().is_symlink() {
                let target = std::fs::read_link(entry.path()).map_err(read_err)?;
                hasher.update(target.to_string_lossy().as_bytes());
            } else if meta.is_file() {
                let modified = meta
                    .modified()
                    .map_err(read_err)?
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default();
                hasher.update(format!("{}:{}", meta.len(), modified.as_nanos()));
            }
            hasher.update([0]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Location of a cached blob
    pub fn blob_path(&self, layer: &CachedLayer) -> PathBuf {
        self.dir.join("blobs").join(format!("{}.tar.gz", layer.hex()))
    }

    /// Look up a layer, ignoring descriptors whose blob went missing
    pub fn get(&self, key: &str) -> Option<CachedLayer> {
        let descriptor = self.descriptor(key);
        let content = std::fs::read(&descriptor).ok()?;
        let layer: CachedLayer = serde_json::from_slice(&content).ok()?;
        if self.blob_path(&layer).is_file() {
            trace!("Layer cache hit for {}", key);
            Some(layer)
        } else {
            debug!("Layer cache entry {} has no blob, ignoring", key);
            None
        }
    }

    /// Store a compressed layer under `key`
    pub fn put(&self, key: &str, blob: &[u8], diff_id: &str) -> Result<CachedLayer, FilesystemError> {
        let layer = CachedLayer {
            digest: format!("sha256:{}", hex::encode(Sha256::digest(blob))),
            diff_id: diff_id.to_string(),
            size: blob.len() as u64,
        };
        filesystem::write_atomic(&self.blob_path(&layer), blob)?;
        let descriptor = serde_json::to_vec_pretty(&layer).map_err(|e| FilesystemError::WriteFile {
            path: self.descriptor(key),
            error: e.to_string(),
        })?;
        filesystem::write_atomic(&self.descriptor(key), &descriptor)?;
        debug!("Cached layer {} as {}", key, layer.digest);
        Ok(layer)
    }

    fn descriptor(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

fn file_kind(meta: &std::fs::Metadata) -> &'static str {
    if meta.is_dir() {
        "d"
    } else if meta.file_type().is_symlink() {
        "l"
    } else {
        "f"
    }
}

#[cfg(unix)]
fn mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn mode(meta: &std::fs::Metadata) -> u32 {
    u32::from(meta.permissions().readonly())
}
