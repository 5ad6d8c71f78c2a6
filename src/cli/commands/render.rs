//! CLI implementation for `stratum render`

use anyhow::{Context as _, Result};

use super::Context;
use crate::core::dockerfile;
use crate::infra::backend::compile_unit;
use crate::infra::daemon::render_context;

/// Execute the render command
pub async fn execute(ctx: &Context) -> Result<()> {
    let unit = ctx.load_unit()?;
    let build = compile_unit(&unit).with_context(|| format!("Failed to compile {}", unit.name()))?;
    let render_ctx = render_context(&build, build.uses_repositories())
        .context("Failed to resolve the base image")?;
    print!("{}", dockerfile::render(&build, &render_ctx));
    Ok(())
}
