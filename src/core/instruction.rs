//! Build instruction model
//!
//! A closed vocabulary of immutable build steps. Instructions are declared
//! in `stratum.toml` as an ordered `[[instruction]]` array, internally
//! tagged by `type`:
//!
//! ```toml
//! [[instruction]]
//! type = "from"
//! image = "ubuntu"
//! version = "22.04"
//!
//! [[instruction]]
//! type = "copy"
//! from = "dist"
//! into = "/app"
//! layer = 1
//! ```
//!
//! Declaration order is significant and preserved by every consumer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::config::paths::UnitLayout;
use crate::core::build_info::BuildInfo;
use crate::error::{ConfigError, StratumError};

/// OS package manager family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Installer {
    /// RPM based distributions
    Yum,
    /// Debian based distributions
    Apt,
    /// Alpine/Wolfi based distributions
    Apk,
}

impl Installer {
    /// Command used to install packages
    pub fn command(&self) -> &'static str {
        match self {
            Self::Yum => "yum",
            Self::Apt => "apt-get",
            Self::Apk => "apk",
        }
    }
}

impl fmt::Display for Installer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Yum => "yum",
            Self::Apt => "apt",
            Self::Apk => "apk",
        };
        f.write_str(name)
    }
}

/// Transport protocol of an exposed port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// An abstract package request, not yet architecture specific
///
/// Written as `name` or `name=version` in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageRequest {
    /// Package name
    pub name: String,
    /// Optional version constraint (exact version)
    pub version: Option<String>,
}

impl PackageRequest {
    /// Request the currently available version of a package
    pub fn any(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    /// Request an exact version of a package
    pub fn exact(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: Some(version.into()),
        }
    }
}

impl FromStr for PackageRequest {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (name, version) = match s.split_once('=') {
            Some((name, version)) => (name.trim(), Some(version.trim())),
            None => (s, None),
        };
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidValue {
                field: "packages".to_string(),
                message: format!("'{s}' is not a valid package request"),
            });
        }
        if version.is_some_and(str::is_empty) {
            return Err(ConfigError::InvalidValue {
                field: "packages".to_string(),
                message: format!("'{s}' has an empty version"),
            });
        }
        Ok(Self {
            name: name.to_string(),
            version: version.map(str::to_string),
        })
    }
}

impl TryFrom<String> for PackageRequest {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PackageRequest> for String {
    fn from(value: PackageRequest) -> Self {
        value.to_string()
    }
}

impl fmt::Display for PackageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}={}", self.name, version),
            None => f.write_str(&self.name),
        }
    }
}

/// Container health check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Shell command run by the check
    pub cmd: String,
    /// Time between checks, e.g. `30s`
    #[serde(default)]
    pub interval: Option<String>,
    /// Time before a check is considered hung
    #[serde(default)]
    pub timeout: Option<String>,
    /// Grace period after container start
    #[serde(default)]
    pub start_period: Option<String>,
    /// Consecutive failures before unhealthy
    #[serde(default)]
    pub retries: Option<u32>,
}

/// Reference to another build unit's produced image
///
/// The tag and image id are resolved lazily from the other unit's
/// `imageBuildInfo.json`, so declaring the reference never requires the
/// other unit to be built yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalImageRef {
    /// Directory of the other build unit
    pub unit: PathBuf,
}

impl LocalImageRef {
    /// Reference the unit rooted at `unit`
    pub fn new(unit: impl Into<PathBuf>) -> Self {
        Self { unit: unit.into() }
    }

    /// Paths of the referenced unit
    pub fn layout(&self) -> UnitLayout {
        UnitLayout::new(&self.unit)
    }

    /// Archive produced by the referenced unit
    pub fn archive(&self) -> PathBuf {
        self.layout().image_archive()
    }

    /// Build output recorded by the referenced unit
    pub fn build_info(&self) -> Result<BuildInfo, StratumError> {
        let path = self.layout().build_info();
        if !path.exists() {
            return Err(ConfigError::MissingBuildInfo { path: self.unit.clone() }.into());
        }
        BuildInfo::load(&path)
    }

    /// Tag of the referenced unit's image
    pub fn tag(&self) -> Result<String, StratumError> {
        Ok(self.build_info()?.tag)
    }

    /// Image id of the referenced unit's image
    pub fn image_id(&self) -> Result<String, StratumError> {
        Ok(self.build_info()?.image_id)
    }
}

fn root_dir() -> String {
    "/".to_string()
}

/// A single build step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuildInstruction {
    /// Registry base image, optionally pinned by digest
    From {
        image: String,
        version: String,
        #[serde(default)]
        digest: Option<String>,
    },
    /// Base image read from a local archive
    FromLocalArchive { archive: PathBuf },
    /// Base image produced by another build unit
    FromLocalImageBuild(LocalImageRef),
    /// Add files to the numbered filesystem layer
    Copy {
        from: PathBuf,
        #[serde(default = "root_dir")]
        into: String,
        layer: u32,
        #[serde(default)]
        owner: Option<String>,
    },
    /// Shell commands run as one batch
    Run { commands: Vec<String> },
    /// Shell commands run with the unit's repository definitions mounted
    RepoConfigRun { commands: Vec<String> },
    /// Environment variable
    Env { key: String, value: String },
    /// Image label
    Label { key: String, value: String },
    /// Label whose value is expected to change between otherwise identical builds
    ChangingLabel { key: String, value: String },
    /// Maintainer label
    Maintainer { name: String, email: String },
    /// Working directory
    Workdir { path: String },
    /// Exec form entrypoint
    Entrypoint { args: Vec<String> },
    /// Exec form default arguments
    Cmd { args: Vec<String> },
    /// Exposed port
    Expose {
        port: u16,
        #[serde(default)]
        protocol: Protocol,
    },
    /// Create a user and group in the image
    CreateUser {
        username: String,
        group: String,
        uid: u32,
        gid: u32,
    },
    /// User the container runs as
    SetUser { username: String },
    /// Install OS packages
    Install {
        installer: Installer,
        #[serde(default)]
        repositories: Vec<String>,
        packages: Vec<PackageRequest>,
    },
    /// Health check
    HealthCheck(HealthCheck),
}

impl BuildInstruction {
    /// Instruction name as written in the manifest
    pub fn name(&self) -> &'static str {
        match self {
            Self::From { .. } => "from",
            Self::FromLocalArchive { .. } => "from_local_archive",
            Self::FromLocalImageBuild(_) => "from_local_image_build",
            Self::Copy { .. } => "copy",
            Self::Run { .. } => "run",
            Self::RepoConfigRun { .. } => "repo_config_run",
            Self::Env { .. } => "env",
            Self::Label { .. } => "label",
            Self::ChangingLabel { .. } => "changing_label",
            Self::Maintainer { .. } => "maintainer",
            Self::Workdir { .. } => "workdir",
            Self::Entrypoint { .. } => "entrypoint",
            Self::Cmd { .. } => "cmd",
            Self::Expose { .. } => "expose",
            Self::CreateUser { .. } => "create_user",
            Self::SetUser { .. } => "set_user",
            Self::Install { .. } => "install",
            Self::HealthCheck(_) => "health_check",
        }
    }

    /// Whether this instruction selects the base image
    pub fn is_base(&self) -> bool {
        matches!(
            self,
            Self::From { .. } | Self::FromLocalArchive { .. } | Self::FromLocalImageBuild(_)
        )
    }

    /// Resolve relative paths against the unit directory
    #[must_use]
    pub fn resolve_paths(self, unit_dir: &Path) -> Self {
        let resolve = |path: PathBuf| {
            if path.is_absolute() {
                path
            } else {
                unit_dir.join(path)
            }
        };
        match self {
            Self::FromLocalArchive { archive } => Self::FromLocalArchive {
                archive: resolve(archive),
            },
            Self::FromLocalImageBuild(reference) => {
                Self::FromLocalImageBuild(LocalImageRef::new(resolve(reference.unit)))
            }
            Self::Copy {
                from,
                into,
                layer,
                owner,
            } => Self::Copy {
                from: resolve(from),
                into,
                layer,
                owner,
            },
            other => other,
        }
    }
}

/// Full registry reference of a `From` instruction
pub fn image_reference(image: &str, version: &str, digest: Option<&str>) -> String {
    match digest {
        Some(digest) => format!("{image}:{version}@{digest}"),
        None => format!("{image}:{version}"),
    }
}
