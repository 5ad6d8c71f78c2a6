//! Backend selection and the build entry point
//!
//! Both backends implement [`ImageBuilder`]; they share no code beyond the
//! compiled build they consume and the [`BuildInfo`] they return.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::core::build_info::{BuildInfo, BuilderKind};
use crate::core::compiler::{self, CompiledBuild};
use crate::core::instruction::BuildInstruction;
use crate::core::lock::LockFile;
use crate::core::manifest::{Backend, BuildUnit};
use crate::core::resolver::PackageResolver;
use crate::core::retry::RetryPolicy;
use crate::core::secrets::SecretProvider;
use crate::error::{ConfigError, StratumError};
use crate::infra::daemon::{DaemonBackend, Engine};
use crate::infra::daemonless::DaemonlessBackend;
use crate::infra::dirs::StratumDirs;
use crate::infra::layer_cache::LayerCache;

/// Produces an image archive and its id from a compiled build
pub trait ImageBuilder {
    /// Kind recorded in the build output
    fn kind(&self) -> BuilderKind;

    /// Build `build` for `unit`, leaving `image.tar` in the unit's build
    /// directory
    fn build(&self, unit: &BuildUnit, build: &CompiledBuild) -> Result<BuildInfo, StratumError>;
}

/// Options shared by every backend
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Overrides the backend declared by the unit
    pub backend: Option<Backend>,
    /// Daemonless layer cache, defaults to the platform cache directory
    pub layer_cache: Option<PathBuf>,
    /// Retry policy for base image pulls
    pub retry: RetryPolicy,
}

impl BuildOptions {
    #[must_use]
    pub fn with_backend(mut self, backend: Option<Backend>) -> Self {
        self.backend = backend;
        self
    }

    #[must_use]
    pub fn with_layer_cache(mut self, dir: Option<PathBuf>) -> Self {
        self.layer_cache = dir;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Backend used for `unit`
    pub fn backend_for(&self, unit: &BuildUnit) -> Backend {
        self.backend.unwrap_or(unit.manifest.unit.backend)
    }

    /// Layer cache directory
    pub fn layer_cache_dir(&self) -> PathBuf {
        self.layer_cache
            .clone()
            .unwrap_or_else(|| StratumDirs::new().layer_cache_dir())
    }
}

/// Compile a unit's instructions, pinning packages from its lock file
///
/// Without a lock file, install requests are passed to the package manager
/// unpinned. Once a lock file exists it must hold an entry for the target
/// architecture.
pub fn compile_unit(unit: &BuildUnit) -> Result<CompiledBuild, StratumError> {
    let architecture = unit.manifest.architecture()?;
    let path = unit.layout.lockfile();
    if !path.is_file() {
        if unit
            .instructions()
            .iter()
            .any(|i| matches!(i, BuildInstruction::Install { .. }))
        {
            warn!(
                "No lock file at {}, installing unpinned packages",
                path.display()
            );
        }
        return compiler::compile(unit.name(), unit.instructions(), None);
    }

    let lock = LockFile::load(&path)?;
    let arch_lock = lock.get(architecture).ok_or_else(|| ConfigError::LockEntryMissing {
        architecture: architecture.to_string(),
        path: path.clone(),
    })?;
    let resolver = PackageResolver::new(architecture).with_lock(Some(arch_lock));
    compiler::compile(unit.name(), unit.instructions(), Some(&resolver))
}

/// Create the backend selected for `unit`
pub fn builder_for<'a>(
    unit: &BuildUnit,
    options: &BuildOptions,
    secrets: &'a dyn SecretProvider,
) -> Result<Box<dyn ImageBuilder + 'a>, StratumError> {
    Ok(match options.backend_for(unit) {
        Backend::Daemon => {
            let engine = Engine::detect(&unit.manifest.unit.engine)?;
            Box::new(DaemonBackend::new(engine, secrets).with_retry(options.retry))
        }
        Backend::Daemonless => Box::new(DaemonlessBackend::new(LayerCache::new(
            options.layer_cache_dir(),
        ))),
    })
}

/// Compile and build `unit` with `builder`, then record the build output
pub fn build_unit(unit: &BuildUnit, builder: &dyn ImageBuilder) -> Result<BuildInfo, StratumError> {
    let compiled = compile_unit(unit)?;
    let info = builder.build(unit, &compiled)?;
    info.write(&unit.layout.build_info())?;
    info!(
        "Recorded build of {} in {}",
        info.tag,
        unit.layout.build_info().display()
    );
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::paths::UnitLayout;
    use crate::core::instruction::{Installer, PackageRequest};
    use crate::core::lock::{ArchLock, Architecture, UnchangingContainerReference};
    use crate::core::manifest::{Manifest, UnitConfig};
    use crate::core::package::{Packages, PinnedPackage};
    use tempfile::TempDir;

    fn unit(dir: &std::path::Path) -> BuildUnit {
        let manifest = Manifest {
            unit: UnitConfig {
                name: "tools".into(),
                tag: None,
                backend: Backend::Daemon,
                engine: "docker".into(),
                architecture: Some(Architecture::X86_64),
            },
            repositories: vec![],
            instructions: vec![
                BuildInstruction::From {
                    image: "rockylinux".into(),
                    version: "8".into(),
                    digest: None,
                },
                BuildInstruction::Install {
                    installer: Installer::Yum,
                    repositories: vec![],
                    packages: vec![PackageRequest::any("jq")],
                },
            ],
        };
        BuildUnit::from_manifest(UnitLayout::new(dir), manifest).unwrap()
    }

    #[test]
    fn test_compile_unit_without_lock_is_unpinned() {
        let dir = TempDir::new().unwrap();
        let build = compile_unit(&unit(dir.path())).unwrap();
        assert_eq!(build.installs[0].tokens, vec!["jq"]);
        assert!(build.installs[0].pinned.is_empty());
    }

    #[test]
    fn test_compile_unit_pins_from_lock() {
        let dir = TempDir::new().unwrap();
        let unit = unit(dir.path());
        let mut lock = LockFile::new();
        lock.insert(
            Architecture::X86_64,
            ArchLock::new(
                Packages::new(vec![
                    PinnedPackage::new("jq", "1.6", "15.el9", "x86_64"),
                    PinnedPackage::new("oniguruma", "6.9.6", "1.el9.5", "x86_64"),
                ])
                .unwrap(),
                Some(UnchangingContainerReference::new("rockylinux", "8", "sha256:aa")),
            ),
        );
        lock.save(&unit.layout.lockfile()).unwrap();

        let build = compile_unit(&unit).unwrap();
        assert_eq!(build.installs[0].tokens, vec!["jq-1.6-15.el9.x86_64"]);
        assert_eq!(build.installs[1].tokens, vec!["oniguruma-6.9.6-1.el9.5.x86_64"]);
        assert_eq!(build.installs[1].installer, Installer::Yum);
        assert_eq!(
            build.base.reference().as_deref(),
            Some("rockylinux:8@sha256:aa")
        );
    }

    #[test]
    fn test_compile_unit_requires_entry_for_architecture() {
        let dir = TempDir::new().unwrap();
        let unit = unit(dir.path());
        let mut lock = LockFile::new();
        lock.insert(
            Architecture::Aarch64,
            ArchLock::new(
                Packages::new(vec![PinnedPackage::new("jq", "1.6", "15.el9", "aarch64")]).unwrap(),
                Some(UnchangingContainerReference::new("rockylinux", "8", "sha256:aa")),
            ),
        );
        lock.save(&unit.layout.lockfile()).unwrap();

        let err = compile_unit(&unit).unwrap_err();
        assert!(matches!(
            err,
            StratumError::Config(ConfigError::LockEntryMissing { ref architecture, .. })
                if architecture == "x86_64"
        ));
    }

    #[test]
    fn test_compile_unit_rejects_other_locked_base() {
        let dir = TempDir::new().unwrap();
        let unit = unit(dir.path());
        let mut lock = LockFile::new();
        lock.insert(
            Architecture::X86_64,
            ArchLock::new(
                Packages::new(vec![PinnedPackage::new("jq", "1.6", "15.el9", "x86_64")]).unwrap(),
                Some(UnchangingContainerReference::new("rockylinux", "9", "sha256:bb")),
            ),
        );
        lock.save(&unit.layout.lockfile()).unwrap();

        let err = compile_unit(&unit).unwrap_err();
        assert!(matches!(
            err,
            StratumError::Config(ConfigError::LockedBaseMismatch { ref declared, ref locked })
                if declared == "rockylinux:8" && locked == "rockylinux:9@sha256:bb"
        ));
    }

    #[test]
    fn test_backend_override() {
        let dir = TempDir::new().unwrap();
        let unit = unit(dir.path());
        let options = BuildOptions::default();
        assert_eq!(options.backend_for(&unit), Backend::Daemon);
        let options = options.with_backend(Some(Backend::Daemonless));
        assert_eq!(options.backend_for(&unit), Backend::Daemonless);
    }
}
