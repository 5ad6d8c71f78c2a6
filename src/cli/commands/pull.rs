//! CLI implementation for `stratum pull`
//!
//! The daemon backend pulls into the engine. The daemonless backend pulls
//! registry bases into `build/base-image.tar`, which is what it builds
//! from.

use anyhow::{Context as _, Result};

use super::Context;
use crate::cli::output::{create_spinner, status};
use crate::core::compiler::BaseImage;
use crate::core::manifest::Backend;
use crate::core::secrets::EnvSecrets;
use crate::infra::backend::{compile_unit, BuildOptions};
use crate::infra::daemon::{DaemonBackend, Engine};
use crate::infra::registry::RegistryClient;

/// Execute the pull command
pub async fn execute(ctx: &Context, backend: Option<Backend>) -> Result<()> {
    let unit = ctx.load_unit()?;
    let options = BuildOptions::default().with_backend(backend);
    let build = compile_unit(&unit).with_context(|| format!("Failed to compile {}", unit.name()))?;

    match options.backend_for(&unit) {
        Backend::Daemon => {
            let engine = Engine::detect(&unit.manifest.unit.engine)?;
            let secrets = EnvSecrets::default();
            let daemon = DaemonBackend::new(engine, &secrets).with_retry(options.retry);
            let spinner = create_spinner("Fetching base image", ctx.quiet);
            let result = daemon.provide_base(&build.base);
            spinner.finish_and_clear();
            result.context("Failed to fetch the base image")?;
            if !ctx.quiet {
                println!("{} Base image available to {}", status::SUCCESS, daemon.engine().name());
            }
        }
        Backend::Daemonless => {
            let BaseImage::Registry { .. } = &build.base else {
                if !ctx.quiet {
                    println!("{} Base image is local, nothing to pull", status::SUCCESS);
                }
                return Ok(());
            };
            let reference = build.base.reference().unwrap_or_default();
            let target = unit.layout.base_image_archive();
            let client = RegistryClient::new(unit.manifest.architecture()?).with_retry(options.retry);

            let spinner = create_spinner(&format!("Pulling {reference}"), ctx.quiet);
            let result = client.pull_to_archive(&reference, &target).await;
            spinner.finish_and_clear();
            let digest = result.with_context(|| format!("Failed to pull {reference}"))?;
            if !ctx.quiet {
                println!("{} Pulled {} ({})", status::SUCCESS, reference, digest);
                println!("  {}", target.display());
            }
        }
    }
    Ok(())
}
