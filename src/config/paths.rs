//! Well-known paths of a build unit
//!
//! Every build unit keeps its generated artifacts under `<unit>/build/`.
//! Downstream units only ever read `image.tar` and `imageBuildInfo.json`.

use std::path::{Path, PathBuf};

use super::defaults;

/// Paths of a single build unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitLayout {
    root: PathBuf,
}

impl UnitLayout {
    /// Layout for the unit rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Unit directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `stratum.toml`
    pub fn manifest(&self) -> PathBuf {
        self.root.join(defaults::MANIFEST_FILE)
    }

    /// `stratum.lock`
    pub fn lockfile(&self) -> PathBuf {
        self.root.join(defaults::LOCKFILE_FILE)
    }

    /// Working directory handed to the engine
    pub fn build_dir(&self) -> PathBuf {
        self.root.join("build")
    }

    /// Directory holding one sub-directory per copy layer
    pub fn context_dir(&self) -> PathBuf {
        self.build_dir().join("context")
    }

    /// Directory of the copy layer with the given ordinal
    pub fn layer_dir(&self, ordinal: u32) -> PathBuf {
        self.context_dir().join(format!("layer{ordinal}"))
    }

    /// Rendered build-file
    pub fn dockerfile(&self) -> PathBuf {
        self.build_dir().join("Dockerfile")
    }

    /// Files mounted into install steps and removed after every build
    pub fn ephemeral_dir(&self) -> PathBuf {
        self.build_dir().join("ephemeral")
    }

    /// Produced image archive
    pub fn image_archive(&self) -> PathBuf {
        self.build_dir().join("image.tar")
    }

    /// Base image archive pulled for the daemonless backend
    pub fn base_image_archive(&self) -> PathBuf {
        self.build_dir().join("base-image.tar")
    }

    /// Build output sidecar
    pub fn build_info(&self) -> PathBuf {
        self.build_dir().join("imageBuildInfo.json")
    }
}
