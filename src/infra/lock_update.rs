//! Lock file refresh
//!
//! Builds a throwaway image holding only the unit's base image and its
//! package installs, asks the package database inside it what ended up
//! installed, and records the result for the unit's architecture. Entries
//! of other architectures are left untouched.

use tracing::{info, warn};

use crate::config::defaults;
use crate::core::compiler::{self, BaseImage};
use crate::core::instruction::{BuildInstruction, Installer};
use crate::core::lock::{ArchLock, Architecture, LockFile, UnchangingContainerReference};
use crate::core::manifest::BuildUnit;
use crate::core::resolver::InstalledPackageReport;
use crate::core::retry::RetryPolicy;
use crate::error::StratumError;
use crate::infra::daemon::{DaemonBackend, Engine};

/// Instructions that influence which packages get installed
pub fn lock_instructions(instructions: &[BuildInstruction]) -> Vec<BuildInstruction> {
    instructions
        .iter()
        .filter(|i| {
            i.is_base()
                || matches!(
                    i,
                    BuildInstruction::Install { .. } | BuildInstruction::RepoConfigRun { .. }
                )
        })
        .cloned()
        .collect()
}

/// Package manager families used by `instructions`, in first-use order
pub fn installers(instructions: &[BuildInstruction]) -> Vec<Installer> {
    let mut found = Vec::new();
    for instruction in instructions {
        if let BuildInstruction::Install { installer, .. } = instruction {
            if !found.contains(installer) {
                found.push(*installer);
            }
        }
    }
    found
}

/// Base coordinate already pinned by the manifest
pub fn declared_base(base: &BaseImage) -> Option<UnchangingContainerReference> {
    match base {
        BaseImage::Registry {
            image,
            version,
            digest: Some(digest),
        } => Some(UnchangingContainerReference::new(image, version, digest)),
        _ => None,
    }
}

/// Immutable coordinate of a registry base, pulling it when unpinned
///
/// Local bases have no registry coordinate.
pub fn resolve_base(
    engine: &Engine,
    retry: &RetryPolicy,
    base: &BaseImage,
) -> Result<Option<UnchangingContainerReference>, StratumError> {
    if let Some(declared) = declared_base(base) {
        return Ok(Some(declared));
    }
    let BaseImage::Registry { image, version, .. } = base else {
        return Ok(None);
    };
    let reference = base.reference().unwrap_or_default();
    engine
        .pull(&reference, retry)
        .map_err(|e| StratumError::in_stage("pull base image", e))?;
    let digest = engine
        .repo_digest(&reference)
        .map_err(|e| StratumError::in_stage("resolve base digest", e))?;
    Ok(Some(UnchangingContainerReference::new(image, version, digest)))
}

/// Replace the entry of `architecture` in the unit's lock file
pub fn record(unit: &BuildUnit, architecture: Architecture, entry: ArchLock) -> Result<LockFile, StratumError> {
    let path = unit.layout.lockfile();
    let mut lock = LockFile::load_or_default(&path)?;
    lock.insert(architecture, entry);
    lock.save(&path)?;
    Ok(lock)
}

/// Tag of the throwaway image built for `unit`
pub fn lock_image_tag(unit: &BuildUnit) -> String {
    format!("{}{}", unit.name(), defaults::LOCK_IMAGE_SUFFIX)
}

/// Refresh the lock entry of the unit's architecture through `backend`
pub fn update_lock(unit: &BuildUnit, backend: &DaemonBackend<'_>) -> Result<ArchLock, StratumError> {
    let architecture = unit.manifest.architecture()?;
    let engine = backend.engine();
    engine.check_version()?;

    let instructions = lock_instructions(unit.instructions());
    let build = compiler::compile(unit.name(), &instructions, None)?;
    let base_image = resolve_base(engine, backend.retry(), &build.base)?;

    let families = installers(&instructions);
    let packages = if families.is_empty() {
        warn!("{} installs no packages, recording the base image only", unit.name());
        Default::default()
    } else {
        let tag = lock_image_tag(unit);
        backend.build_image(unit, &build, &tag)?;
        let report = query_installed(engine, &tag, &families);
        if let Err(e) = engine.remove_image(&tag) {
            warn!("Failed to remove {}: {}", tag, e);
        }
        report?.into_packages()?
    };

    let entry = ArchLock::new(packages, base_image);
    record(unit, architecture, entry.clone())?;
    info!(
        "Locked {} packages for {} in {}",
        entry.packages.len(),
        architecture,
        unit.layout.lockfile().display()
    );
    Ok(entry)
}

fn query_installed(
    engine: &Engine,
    tag: &str,
    families: &[Installer],
) -> Result<InstalledPackageReport, StratumError> {
    let mut report = InstalledPackageReport::default();
    for installer in families {
        let output = engine
            .run_script(tag, InstalledPackageReport::query_command(*installer))
            .map_err(|e| StratumError::in_stage("query installed packages", e))?;
        report.merge(InstalledPackageReport::parse(*installer, &output)?);
    }
    Ok(report)
}
