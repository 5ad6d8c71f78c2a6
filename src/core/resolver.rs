//! Package resolution
//!
//! Turns abstract [`PackageRequest`]s from install instructions into
//! [`PinnedPackage`]s for one architecture. Pins come from the lock file
//! first; requests the lock file does not cover are looked up in a
//! [`PackageIndex`], typically the installed-package report of a freshly
//! built image.

use std::collections::HashSet;

use tracing::debug;

use crate::core::instruction::{Installer, PackageRequest};
use crate::core::lock::{ArchLock, Architecture};
use crate::core::package::{Packages, PinnedPackage};
use crate::core::version::PackageVersion;
use crate::error::{ConfigError, LockfileError, StratumError};

/// Source of currently available package versions
pub trait PackageIndex {
    /// Newest available build of `name` for `architecture`
    fn available(&self, name: &str, architecture: Architecture) -> Option<PinnedPackage>;
}

/// Packages installed in an image, as reported by its package database
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstalledPackageReport {
    packages: Vec<PinnedPackage>,
}

impl InstalledPackageReport {
    /// Shell command printing the installed packages of an image
    ///
    /// The output is parsed by [`InstalledPackageReport::parse`].
    pub fn query_command(installer: Installer) -> &'static str {
        match installer {
            Installer::Yum => r"rpm -qa --queryformat '%{NAME},%{VERSION},%{RELEASE},%{ARCH}\n'",
            Installer::Apt => r"dpkg-query -W -f='${Package},${Version},${Architecture}\n'",
            Installer::Apk => {
                r#"awk -F: '/^P:/{n=$2} /^V:/{v=$2} /^A:/{a=$2} /^$/{if(n!=""){print n","v","a}; n=""} END{if(n!=""){print n","v","a}}' /lib/apk/db/installed"#
            }
        }
    }

    /// Parse the output of [`InstalledPackageReport::query_command`]
    ///
    /// `rpm` reports `name,version,release,arch`. `dpkg-query` and `apk`
    /// report `name,version,arch`, where the release is the part of the
    /// version after its last `-`.
    pub fn parse(installer: Installer, output: &str) -> Result<Self, LockfileError> {
        let mut packages = Vec::new();
        for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let package = match (installer, fields.as_slice()) {
                (Installer::Yum, [name, version, release, arch]) => {
                    PinnedPackage::new(*name, *version, *release, *arch)
                }
                (Installer::Apt | Installer::Apk, [name, full_version, arch]) => {
                    let (version, release) = split_release(full_version);
                    PinnedPackage::new(*name, version, release, *arch)
                }
                _ => {
                    return Err(LockfileError::InvalidReportLine {
                        line: line.to_string(),
                    })
                }
            };
            if package.name.is_empty() || package.version.is_empty() {
                return Err(LockfileError::InvalidReportLine {
                    line: line.to_string(),
                });
            }
            packages.push(package);
        }
        if packages.is_empty() {
            return Err(LockfileError::InvalidReportLine {
                line: output.trim().to_string(),
            });
        }
        Ok(Self { packages })
    }

    /// Append the packages of another report
    pub fn merge(&mut self, other: Self) {
        self.packages.extend(other.packages);
    }

    /// Reported packages
    pub fn packages(&self) -> &[PinnedPackage] {
        &self.packages
    }

    /// Collapse the report into a lock file collection
    ///
    /// Some distributions keep several versions of one package installed
    /// (e.g. `kernel-core`); only the newest is kept.
    pub fn into_packages(self) -> Result<Packages, LockfileError> {
        Packages::with_max_versions(dedup(self.packages))
    }
}

impl PackageIndex for InstalledPackageReport {
    fn available(&self, name: &str, _architecture: Architecture) -> Option<PinnedPackage> {
        self.packages
            .iter()
            .filter(|p| p.name == name)
            .max_by(|a, b| a.package_version().cmp(&b.package_version()))
            .cloned()
    }
}

fn split_release(full_version: &str) -> (&str, &str) {
    match full_version.rsplit_once('-') {
        Some((version, release)) if !version.is_empty() => (version, release),
        _ => (full_version, ""),
    }
}

fn dedup(packages: Vec<PinnedPackage>) -> Vec<PinnedPackage> {
    let mut seen = HashSet::new();
    packages
        .into_iter()
        .filter(|p| seen.insert(p.clone()))
        .collect()
}

/// Resolves package requests for one architecture
pub struct PackageResolver<'a> {
    architecture: Architecture,
    lock: Option<&'a ArchLock>,
    index: Option<&'a dyn PackageIndex>,
}

impl<'a> PackageResolver<'a> {
    /// Create a resolver with no pins and no index
    pub fn new(architecture: Architecture) -> Self {
        Self {
            architecture,
            lock: None,
            index: None,
        }
    }

    /// Use pins from a lock file entry
    #[must_use]
    pub fn with_lock(mut self, lock: Option<&'a ArchLock>) -> Self {
        self.lock = lock;
        self
    }

    /// Fall back to a package index for requests without a pin
    #[must_use]
    pub fn with_index(mut self, index: &'a dyn PackageIndex) -> Self {
        self.index = Some(index);
        self
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    /// Lock file entry the pins come from
    pub fn lock(&self) -> Option<&'a ArchLock> {
        self.lock
    }

    /// Locked packages whose names are not in `requested`
    ///
    /// These are dependencies and base image packages; installing them
    /// at their locked versions keeps the whole package set reproducible.
    pub fn unrequested(&self, requested: &HashSet<&str>) -> Vec<PinnedPackage> {
        self.lock
            .map(|lock| {
                lock.packages
                    .packages()
                    .iter()
                    .filter(|p| !requested.contains(p.name.as_str()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Resolve requests into unique pinned packages
    ///
    /// When a name resolves more than once the highest version wins.
    pub fn resolve(&self, requests: &[PackageRequest]) -> Result<Vec<PinnedPackage>, StratumError> {
        let mut pinned = Vec::with_capacity(requests.len());
        for request in requests {
            let package = self.resolve_one(request)?;
            debug!("Resolved {} to {}", request, package);
            pinned.push(package);
        }
        let packages = Packages::with_max_versions(dedup(pinned))?;
        Ok(packages.packages().to_vec())
    }

    fn resolve_one(&self, request: &PackageRequest) -> Result<PinnedPackage, StratumError> {
        let candidate = self
            .lock
            .and_then(|lock| lock.packages.find_by_name(&request.name).cloned())
            .or_else(|| {
                self.index
                    .and_then(|index| index.available(&request.name, self.architecture))
            });

        let Some(package) = candidate else {
            return Err(ConfigError::UnresolvablePackage {
                package: request.name.clone(),
                architecture: self.architecture.to_string(),
            }
            .into());
        };

        if let Some(requested) = &request.version {
            if !version_matches(&package, requested) {
                return Err(LockfileError::VersionConflict {
                    package: request.name.clone(),
                    locked: package.full_version(),
                    requested: requested.clone(),
                }
                .into());
            }
        }
        Ok(package)
    }
}

fn version_matches(package: &PinnedPackage, requested: &str) -> bool {
    package.full_version() == requested
        || package.package_version() == PackageVersion::new(requested)
}
