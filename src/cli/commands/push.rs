//! CLI implementation for `stratum push`

use anyhow::{Context as _, Result};

use super::Context;
use crate::cli::output::{create_spinner, status};
use crate::infra::registry::RegistryClient;

/// Execute the push command
pub async fn execute(ctx: &Context, tag: Option<String>) -> Result<()> {
    let unit = ctx.load_unit()?;
    let archive = unit.layout.image_archive();
    if !archive.is_file() {
        anyhow::bail!(
            "No image archive at {}. Run 'stratum build' first.",
            archive.display()
        );
    }
    let reference = tag.unwrap_or_else(|| unit.tag());
    let client = RegistryClient::new(unit.manifest.architecture()?);

    let spinner = create_spinner(&format!("Pushing {reference}"), ctx.quiet);
    let result = client.push_archive(&archive, &reference).await;
    spinner.finish_and_clear();
    let digest = result.with_context(|| format!("Failed to push {reference}"))?;

    if ctx.quiet {
        println!("{digest}");
    } else {
        println!("{} Pushed {}@{}", status::SUCCESS, reference, digest);
    }
    Ok(())
}
