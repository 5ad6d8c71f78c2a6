//! CLI implementation for `stratum build`

use std::path::PathBuf;

use anyhow::{Context as _, Result};

use super::Context;
use crate::cli::output::{create_spinner, status};
use crate::core::manifest::Backend;
use crate::core::secrets::EnvSecrets;
use crate::infra::backend::{build_unit, builder_for, BuildOptions};

/// Execute the build command
pub async fn execute(ctx: &Context, backend: Option<Backend>, layer_cache: Option<PathBuf>) -> Result<()> {
    let unit = ctx.load_unit()?;
    let secrets = EnvSecrets::default();
    let options = BuildOptions::default()
        .with_backend(backend)
        .with_layer_cache(layer_cache);

    let builder = builder_for(&unit, &options, &secrets)
        .with_context(|| format!("Failed to set up the {} backend", options.backend_for(&unit)))?;

    let spinner = create_spinner(&format!("Building {}", unit.tag()), ctx.quiet);
    let result = build_unit(&unit, builder.as_ref());
    spinner.finish_and_clear();
    let info = result.with_context(|| format!("Failed to build {}", unit.name()))?;

    if !ctx.quiet {
        println!("{} Built {} ({})", status::SUCCESS, info.tag, info.image_id);
        println!("  {}", unit.layout.image_archive().display());
    }
    Ok(())
}
