//! Build output sidecar
//!
//! Every successful build writes `build/imageBuildInfo.json`, the only way
//! one build unit advertises its result to another.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{FilesystemError, StratumError};

/// Which backend produced an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BuilderKind {
    Daemon,
    ArchiveAssembler,
}

/// Tag and image id of a finished build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
    pub tag: String,
    pub builder: BuilderKind,
    pub image_id: String,
}

impl BuildInfo {
    pub fn new(tag: impl Into<String>, builder: BuilderKind, image_id: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            builder,
            image_id: image_id.into(),
        }
    }

    /// Read a sidecar file
    pub fn load(path: &Path) -> Result<Self, StratumError> {
        let content = std::fs::read_to_string(path).map_err(|e| FilesystemError::ReadFile {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|e| {
            FilesystemError::ReadFile {
                path: path.to_path_buf(),
                error: e.to_string(),
            }
            .into()
        })
    }

    /// Write a sidecar file
    pub fn write(&self, path: &Path) -> Result<(), StratumError> {
        let content = serde_json::to_string_pretty(self).map_err(|e| FilesystemError::WriteFile {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        std::fs::write(path, content).map_err(|e| FilesystemError::WriteFile {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        Ok(())
    }
}
