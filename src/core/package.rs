//! Pinned OS packages
//!
//! A [`PinnedPackage`] is one exact `(name, version, release, architecture)`
//! tuple as reported by the distribution's package database. [`Packages`]
//! is the per-architecture collection stored in the lockfile; it never
//! holds two entries with the same name.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::core::instruction::Installer;
use crate::core::version::PackageVersion;
use crate::error::LockfileError;

/// A package pinned to an exact build
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PinnedPackage {
    /// Package name
    pub name: String,
    /// Upstream version
    pub version: String,
    /// Distribution release, may be empty
    #[serde(default)]
    pub release: String,
    /// Package architecture as reported by the package manager
    pub architecture: String,
}

impl PinnedPackage {
    /// Create a pinned package
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        release: impl Into<String>,
        architecture: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            release: release.into(),
            architecture: architecture.into(),
        }
    }

    /// Comparable version of this package
    pub fn package_version(&self) -> PackageVersion {
        PackageVersion::new(self.version.as_str())
    }

    /// Version with the release appended when there is one
    pub fn full_version(&self) -> String {
        if self.release.is_empty() {
            self.version.clone()
        } else {
            format!("{}-{}", self.version, self.release)
        }
    }

    /// Token passed to the package manager to install exactly this package
    ///
    /// `yum` and `apk` use `name-version-release.arch`, `apt` uses
    /// `name=version-release`. An empty release is omitted together with
    /// its separator.
    pub fn install_token(&self, installer: Installer) -> String {
        match installer {
            Installer::Yum | Installer::Apk => {
                format!("{}-{}.{}", self.name, self.full_version(), self.architecture)
            }
            Installer::Apt => format!("{}={}", self.name, self.full_version()),
        }
    }
}

impl fmt::Display for PinnedPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.name, self.full_version(), self.architecture)
    }
}

/// Collection of pinned packages with unique names
///
/// Entries are kept sorted by name so the serialized form is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<PinnedPackage>", into = "Vec<PinnedPackage>")]
pub struct Packages {
    packages: Vec<PinnedPackage>,
}

impl Packages {
    /// Build a collection, failing if any name appears twice
    pub fn new(packages: Vec<PinnedPackage>) -> Result<Self, LockfileError> {
        let mut by_name: BTreeMap<String, PinnedPackage> = BTreeMap::new();
        for package in packages {
            if let Some(existing) = by_name.get(&package.name) {
                return Err(LockfileError::DuplicatePackage {
                    name: package.name.clone(),
                    first: existing.full_version(),
                    second: package.full_version(),
                });
            }
            by_name.insert(package.name.clone(), package);
        }
        Ok(Self {
            packages: by_name.into_values().collect(),
        })
    }

    /// Build a collection keeping the maximum version of every name
    ///
    /// Two entries of the same name with equal versions cannot be ordered
    /// and are rejected.
    pub fn with_max_versions(packages: Vec<PinnedPackage>) -> Result<Self, LockfileError> {
        let mut by_name: BTreeMap<String, PinnedPackage> = BTreeMap::new();
        for package in packages {
            match by_name.get(&package.name) {
                None => {
                    by_name.insert(package.name.clone(), package);
                }
                Some(existing) => match package.package_version().cmp(&existing.package_version()) {
                    std::cmp::Ordering::Greater => {
                        by_name.insert(package.name.clone(), package);
                    }
                    std::cmp::Ordering::Less => {}
                    std::cmp::Ordering::Equal => {
                        return Err(LockfileError::DuplicatePackage {
                            name: package.name.clone(),
                            first: existing.full_version(),
                            second: package.full_version(),
                        });
                    }
                },
            }
        }
        Ok(Self {
            packages: by_name.into_values().collect(),
        })
    }

    /// Look a package up by name
    pub fn find_by_name(&self, name: &str) -> Option<&PinnedPackage> {
        self.packages
            .binary_search_by(|p| p.name.as_str().cmp(name))
            .ok()
            .map(|idx| &self.packages[idx])
    }

    /// All packages, sorted by name
    pub fn packages(&self) -> &[PinnedPackage] {
        &self.packages
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PinnedPackage> {
        self.packages.iter()
    }
}

impl TryFrom<Vec<PinnedPackage>> for Packages {
    type Error = LockfileError;

    fn try_from(value: Vec<PinnedPackage>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Packages> for Vec<PinnedPackage> {
    fn from(value: Packages) -> Self {
        value.packages
    }
}

impl<'a> IntoIterator for &'a Packages {
    type Item = &'a PinnedPackage;
    type IntoIter = std::slice::Iter<'a, PinnedPackage>;

    fn into_iter(self) -> Self::IntoIter {
        self.packages.iter()
    }
}
