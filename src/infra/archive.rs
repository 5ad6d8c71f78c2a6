//! Image archives in `docker save` layout
//!
//! An archive is a tar, possibly zstd compressed, holding `manifest.json`,
//! an image config and one blob per layer. [`ImageArchive`] unpacks it
//! through [`crate::infra::extract`] into a private temporary directory and
//! decodes the metadata. Layer blobs may be plain, gzip or zstd tars.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tracing::{debug, trace};

use crate::error::ArchiveError;
use crate::infra::extract::{self, contained_path, ZSTD_MAGIC};

const MANIFEST: &str = "manifest.json";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// One image entry of `manifest.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "Config")]
    pub config: String,
    #[serde(rename = "RepoTags", default)]
    pub repo_tags: Vec<String>,
    #[serde(rename = "Layers", default)]
    pub layers: Vec<String>,
}

/// Root filesystem section of an image config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub diff_ids: Vec<String>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            kind: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

/// Runtime defaults of an image
///
/// Fields stratum does not touch are kept in `extra` so they survive a
/// decode and re-encode unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Image config blob
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default)]
    pub config: ContainerConfig,
    #[serde(default)]
    pub rootfs: RootFs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Decoded image archive
#[derive(Debug)]
pub struct ImageArchive {
    path: PathBuf,
    dir: TempDir,
    entry: ManifestEntry,
    config: ImageConfig,
    config_bytes: Vec<u8>,
}

impl ImageArchive {
    /// Unpack and decode the archive at `path`
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        let dir = TempDir::new().map_err(|e| ArchiveError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        extract::extract(path, dir.path())?;

        let manifest_path = dir.path().join(MANIFEST);
        if !manifest_path.is_file() {
            return Err(ArchiveError::MissingManifest {
                path: path.to_path_buf(),
            });
        }
        let malformed = |error: String| ArchiveError::MalformedManifest {
            path: path.to_path_buf(),
            error,
        };
        let manifest_bytes = std::fs::read(&manifest_path).map_err(|e| malformed(e.to_string()))?;
        let entries: Vec<ManifestEntry> =
            serde_json::from_slice(&manifest_bytes).map_err(|e| malformed(e.to_string()))?;
        let entry = entries
            .into_iter()
            .next()
            .ok_or_else(|| malformed("manifest lists no images".to_string()))?;

        let missing_config = || ArchiveError::MissingConfig {
            path: path.to_path_buf(),
            config: entry.config.clone(),
        };
        let config_path = contained_path(Path::new(&entry.config))
            .map(|relative| dir.path().join(relative))
            .ok_or_else(missing_config)?;
        let config_bytes = std::fs::read(&config_path).map_err(|_| missing_config())?;
        let config: ImageConfig =
            serde_json::from_slice(&config_bytes).map_err(|_| missing_config())?;

        debug!(
            "Opened image archive {} ({} layers)",
            path.display(),
            entry.layers.len()
        );
        Ok(Self {
            path: path.to_path_buf(),
            dir,
            entry,
            config,
            config_bytes,
        })
    }

    /// Archive location
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest(&self) -> &ManifestEntry {
        &self.entry
    }

    /// Tags the image was saved with
    pub fn repo_tags(&self) -> &[String] {
        &self.entry.repo_tags
    }

    /// First tag, if any
    pub fn tag(&self) -> Option<&str> {
        self.entry.repo_tags.first().map(String::as_str)
    }

    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    /// Config blob exactly as stored in the archive
    pub fn config_bytes(&self) -> &[u8] {
        &self.config_bytes
    }

    /// Content-addressed image id, `sha256:<config digest>`
    pub fn image_id(&self) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(&self.config_bytes)))
    }

    pub fn entrypoint(&self) -> &[String] {
        self.config.config.entrypoint.as_deref().unwrap_or_default()
    }

    pub fn cmd(&self) -> &[String] {
        self.config.config.cmd.as_deref().unwrap_or_default()
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.config.config.labels.clone().unwrap_or_default()
    }

    /// Unpacked layer blobs in application order
    pub fn layer_paths(&self) -> Result<Vec<PathBuf>, ArchiveError> {
        self.entry
            .layers
            .iter()
            .map(|layer| {
                contained_path(Path::new(layer))
                    .map(|relative| self.dir.path().join(relative))
                    .ok_or_else(|| ArchiveError::PathTraversal {
                        entry: layer.clone(),
                        destination: self.dir.path().to_path_buf(),
                    })
            })
            .collect()
    }

    /// Apply every layer in order to build the image's root filesystem
    pub fn flatten(&self, rootfs: &Path) -> Result<(), ArchiveError> {
        std::fs::create_dir_all(rootfs).map_err(|e| ArchiveError::Io {
            path: rootfs.to_path_buf(),
            error: e.to_string(),
        })?;
        for layer in self.layer_paths()? {
            apply_layer(&layer, rootfs)?;
        }
        Ok(())
    }
}

/// Open a layer blob, decompressing gzip or zstd by magic number
pub fn layer_reader(path: &Path) -> Result<Box<dyn Read>, ArchiveError> {
    let io_err = |e: std::io::Error| ArchiveError::Io {
        path: path.to_path_buf(),
        error: e.to_string(),
    };
    let mut magic = [0u8; 4];
    let read = File::open(path)
        .and_then(|mut f| f.read(&mut magic))
        .map_err(io_err)?;
    let file = BufReader::new(File::open(path).map_err(io_err)?);

    if read >= 2 && magic[..2] == GZIP_MAGIC {
        Ok(Box::new(GzDecoder::new(file)))
    } else if read == 4 && u32::from_le_bytes(magic) == ZSTD_MAGIC {
        Ok(Box::new(
            zstd::stream::read::Decoder::with_buffer(file).map_err(io_err)?,
        ))
    } else {
        Ok(Box::new(file))
    }
}

/// Apply one layer on top of `rootfs`, honouring OCI whiteouts
pub fn apply_layer(layer: &Path, rootfs: &Path) -> Result<(), ArchiveError> {
    let io_err = |path: &Path, e: std::io::Error| ArchiveError::Io {
        path: path.to_path_buf(),
        error: e.to_string(),
    };
    let mut archive = tar::Archive::new(layer_reader(layer)?);
    archive.set_overwrite(true);

    for entry in archive.entries().map_err(|e| io_err(layer, e))? {
        let mut entry = entry.map_err(|e| io_err(layer, e))?;
        let entry_path = entry.path().map_err(|e| io_err(layer, e))?.into_owned();
        let relative = contained_path(&entry_path).ok_or_else(|| ArchiveError::PathTraversal {
            entry: entry_path.display().to_string(),
            destination: rootfs.to_path_buf(),
        })?;

        let file_name = relative
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if file_name == OPAQUE_WHITEOUT {
            let dir = rootfs.join(relative.parent().unwrap_or(Path::new("")));
            clear_dir(&dir).map_err(|e| io_err(&dir, e))?;
            continue;
        }
        if let Some(hidden) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            let target = rootfs
                .join(relative.parent().unwrap_or(Path::new("")))
                .join(hidden);
            remove_path(&target).map_err(|e| io_err(&target, e))?;
            continue;
        }

        let kind = entry.header().entry_type();
        if !(kind.is_dir() || kind.is_file() || kind.is_symlink() || kind.is_hard_link()) {
            trace!("Skipping {:?} entry {}", kind, entry_path.display());
            continue;
        }
        entry.unpack_in(rootfs).map_err(|e| io_err(&entry_path, e))?;
    }
    Ok(())
}

fn clear_dir(dir: &Path) -> std::io::Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for child in std::fs::read_dir(dir)? {
        remove_path(&child?.path())?;
    }
    Ok(())
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
