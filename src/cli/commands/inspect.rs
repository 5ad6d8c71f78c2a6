//! CLI implementation for `stratum inspect`

use std::path::Path;

use anyhow::{Context as _, Result};

use crate::infra::archive::ImageArchive;

/// Execute the inspect command
pub async fn execute(archive: &Path) -> Result<()> {
    let image = ImageArchive::open(archive)
        .with_context(|| format!("Failed to open image archive {}", archive.display()))?;
    let config = image.config();

    println!("Tag:          {}", image.tag().unwrap_or("<none>"));
    println!("Image id:     {}", image.image_id());
    println!(
        "Platform:     {}/{}",
        config.os.as_deref().unwrap_or("unknown"),
        config.architecture.as_deref().unwrap_or("unknown")
    );
    println!("Layers:       {}", image.manifest().layers.len());
    println!("Entrypoint:   {:?}", image.entrypoint());
    println!("Cmd:          {:?}", image.cmd());
    if let Some(user) = &config.config.user {
        println!("User:         {user}");
    }
    let labels = image.labels();
    if !labels.is_empty() {
        println!("Labels:");
        for (key, value) in &labels {
            println!("  {key}={value}");
        }
    }
    Ok(())
}
