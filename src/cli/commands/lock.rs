//! CLI implementation for `stratum lock`

use anyhow::{Context as _, Result};

use super::Context;
use crate::cli::output::{create_spinner, status};
use crate::core::lock::LockFile;
use crate::core::secrets::EnvSecrets;
use crate::infra::daemon::{DaemonBackend, Engine};
use crate::infra::lock_update::update_lock;

/// Print the unit's lock file
pub async fn execute_show(ctx: &Context) -> Result<()> {
    let unit = ctx.load_unit()?;
    let path = unit.layout.lockfile();
    let lock = LockFile::load_or_default(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if lock.is_empty() {
        println!("No lock entries in {}", path.display());
        return Ok(());
    }
    print!("{}", lock.to_yaml()?);
    Ok(())
}

/// Refresh the lock entry of the unit's architecture
pub async fn execute_update(ctx: &Context) -> Result<()> {
    let unit = ctx.load_unit()?;
    let engine = Engine::detect(&unit.manifest.unit.engine)?;
    let secrets = EnvSecrets::default();
    let backend = DaemonBackend::new(engine, &secrets);

    let spinner = create_spinner(&format!("Resolving packages of {}", unit.name()), ctx.quiet);
    let result = update_lock(&unit, &backend);
    spinner.finish_and_clear();
    let entry = result.with_context(|| format!("Failed to update the lock file of {}", unit.name()))?;

    if !ctx.quiet {
        println!(
            "{} Locked {} package(s) in {}",
            status::SUCCESS,
            entry.packages.len(),
            unit.layout.lockfile().display()
        );
        if let Some(base) = &entry.base_image {
            println!("  base image {base}");
        }
    }
    Ok(())
}
