//! CLI command implementations
//!
//! Each command is implemented in its own submodule.

pub mod build;
pub mod inspect;
pub mod lock;
pub mod pull;
pub mod push;
pub mod render;

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Subcommand;

use crate::core::manifest::{Backend, BuildUnit};

/// Options shared by every command
#[derive(Debug, Clone)]
pub struct Context {
    /// Build unit directory
    pub unit_dir: PathBuf,
    /// Suppress progress output
    pub quiet: bool,
}

impl Context {
    /// Load the build unit the command operates on
    pub fn load_unit(&self) -> Result<BuildUnit> {
        BuildUnit::load(&self.unit_dir)
            .with_context(|| format!("Failed to load build unit from {}", self.unit_dir.display()))
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build the unit's image into build/image.tar
    Build {
        /// Backend to use instead of the one declared by the unit
        #[arg(short, long)]
        backend: Option<Backend>,

        /// Application layer cache directory (daemonless backend)
        #[arg(long, env = "STRATUM_LAYER_CACHE")]
        layer_cache: Option<PathBuf>,
    },

    /// Print the build file the daemon backend would use
    Render,

    /// Fetch the unit's base image
    Pull {
        /// Backend to fetch for instead of the one declared by the unit
        #[arg(short, long)]
        backend: Option<Backend>,
    },

    /// Publish build/image.tar to a registry
    Push {
        /// Destination reference, defaults to the unit's tag
        #[arg(short, long)]
        tag: Option<String>,
    },

    /// Show or refresh the package lock file
    Lock {
        #[command(subcommand)]
        command: LockCommands,
    },

    /// Show the metadata of an image archive
    Inspect {
        /// Path to the archive
        archive: PathBuf,
    },
}

/// Lock file subcommands
#[derive(Subcommand, Debug)]
pub enum LockCommands {
    /// Print the lock file
    Show,

    /// Resolve packages through the container engine and record them
    Update,
}

impl Commands {
    /// Run the command
    pub async fn run(self, ctx: &Context) -> Result<()> {
        match self {
            Self::Build {
                backend,
                layer_cache,
            } => build::execute(ctx, backend, layer_cache).await,
            Self::Render => render::execute(ctx).await,
            Self::Pull { backend } => pull::execute(ctx, backend).await,
            Self::Push { tag } => push::execute(ctx, tag).await,
            Self::Lock { command } => match command {
                LockCommands::Show => lock::execute_show(ctx).await,
                LockCommands::Update => lock::execute_update(ctx).await,
            },
            Self::Inspect { archive } => inspect::execute(&archive).await,
        }
    }
}
