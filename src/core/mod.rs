//! Core business logic module
//!
//! Pure build logic for stratum. Nothing here spawns processes or talks to
//! the network - those belong in [`crate::infra`]. Small well-known files
//! (lock file, build output sidecar, manifest) are read and written here.
//!
//! # Submodules
//!
//! - [`instruction`] - Build instruction model
//! - [`manifest`] - Build unit manifest (stratum.toml) parsing and validation
//! - [`version`] - OS package version ordering
//! - [`package`] - Pinned packages and unique package collections
//! - [`lock`] - Architecture keyed lock file
//! - [`resolver`] - Package request resolution
//! - [`compiler`] - Partitioning instructions into layers and batches
//! - [`dockerfile`] - Build-file rendering for the daemon backend
//! - [`build_info`] - Build output sidecar
//! - [`retry`] - Capped exponential backoff
//! - [`secrets`] - Secret placeholders in repository URLs

pub mod build_info;
pub mod compiler;
pub mod dockerfile;
pub mod instruction;
pub mod lock;
pub mod manifest;
pub mod package;
pub mod resolver;
pub mod retry;
pub mod secrets;
pub mod version;
