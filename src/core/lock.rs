//! Lock file handling
//!
//! The lock file (`stratum.lock`) records, for every CPU architecture, the
//! exact OS packages installed into the image and the immutable base image
//! coordinate they were resolved against. It is YAML and committed next to
//! the manifest, so its format must stay readable across releases.
//!
//! ```yaml
//! x86_64:
//!   packages:
//!   - name: jq
//!     version: '1.5'
//!     release: 12.el8
//!     architecture: x86_64
//!   baseImage:
//!     repository: docker.io/library/centos
//!     tag: '8'
//!     digest: sha256:...
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::core::package::Packages;
use crate::error::{ConfigError, FilesystemError, LockfileError, StratumError};

/// CPU architecture an image is built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Architecture {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "aarch64")]
    Aarch64,
}

impl Architecture {
    /// All supported architectures
    pub const ALL: [Architecture; 2] = [Architecture::X86_64, Architecture::Aarch64];

    /// Architecture of the running host
    pub fn current() -> Result<Self, ConfigError> {
        std::env::consts::ARCH.parse()
    }

    /// Name used by the kernel and package managers
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Aarch64 => "aarch64",
        }
    }

    /// Name used in container image platforms
    pub fn docker_name(&self) -> &'static str {
        match self {
            Self::X86_64 => "amd64",
            Self::Aarch64 => "arm64",
        }
    }
}

impl FromStr for Architecture {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x86_64" | "amd64" => Ok(Self::X86_64),
            "aarch64" | "arm64" => Ok(Self::Aarch64),
            other => Err(ConfigError::UnsupportedArchitecture {
                arch: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved, immutable base image coordinate
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnchangingContainerReference {
    /// Image repository, e.g. `docker.io/library/ubuntu`
    pub repository: String,
    /// Tag the digest was resolved from
    pub tag: String,
    /// Content digest, e.g. `sha256:...`
    pub digest: String,
}

impl UnchangingContainerReference {
    pub fn new(
        repository: impl Into<String>,
        tag: impl Into<String>,
        digest: impl Into<String>,
    ) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
            digest: digest.into(),
        }
    }

    /// Reference usable with an engine or registry client
    pub fn reference(&self) -> String {
        format!("{}:{}@{}", self.repository, self.tag, self.digest)
    }
}

impl fmt::Display for UnchangingContainerReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reference())
    }
}

/// Lock entry for one architecture
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchLock {
    /// Pinned OS packages
    #[serde(default)]
    pub packages: Packages,
    /// Base image the packages were resolved against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image: Option<UnchangingContainerReference>,
}

impl ArchLock {
    pub fn new(packages: Packages, base_image: Option<UnchangingContainerReference>) -> Self {
        Self {
            packages,
            base_image,
        }
    }
}

/// Architecture keyed lock file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockFile {
    entries: BTreeMap<Architecture, ArchLock>,
}

impl LockFile {
    /// Create an empty lock file
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from YAML
    pub fn from_yaml(content: &str) -> Result<Self, LockfileError> {
        serde_yaml::from_str(content).map_err(|e| LockfileError::Parse(e.to_string()))
    }

    /// Serialize to YAML
    pub fn to_yaml(&self) -> Result<String, LockfileError> {
        serde_yaml::to_string(self).map_err(|e| LockfileError::Serialize(e.to_string()))
    }

    /// Load from disk
    pub fn load(path: &Path) -> Result<Self, StratumError> {
        let content = std::fs::read_to_string(path).map_err(|e| FilesystemError::ReadFile {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        Ok(Self::from_yaml(&content)?)
    }

    /// Load from disk, or an empty lock file if there is none yet
    pub fn load_or_default(path: &Path) -> Result<Self, StratumError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write to disk
    pub fn save(&self, path: &Path) -> Result<(), StratumError> {
        let content = self.to_yaml()?;
        std::fs::write(path, content).map_err(|e| FilesystemError::WriteFile {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        Ok(())
    }

    /// Entry for an architecture
    pub fn get(&self, architecture: Architecture) -> Option<&ArchLock> {
        self.entries.get(&architecture)
    }

    /// Replace the entry for an architecture, keeping all others
    pub fn insert(&mut self, architecture: Architecture, lock: ArchLock) {
        self.entries.insert(architecture, lock);
    }

    /// Architectures with an entry
    pub fn architectures(&self) -> impl Iterator<Item = Architecture> + '_ {
        self.entries.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
