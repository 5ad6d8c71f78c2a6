//! Infrastructure layer
//!
//! Everything with side effects lives here: archives on disk, the layer
//! cache, the external container engine and the registry client.
//!
//! # Submodules
//!
//! - [`extract`] - Safe extraction of plain and zstd compressed tarballs
//! - [`archive`] - `docker save` style image archives
//! - [`layer_cache`] - Content addressed application layer cache
//! - [`context`] - Build directory staging
//! - [`backend`] - Backend selection and the build entry point
//! - [`daemon`] - Builds through a container engine
//! - [`daemonless`] - Builds by assembling the archive directly
//! - [`lock_update`] - Lock file refresh
//! - [`registry`] - Registry pull and push

pub mod archive;
pub mod backend;
pub mod context;
pub mod daemon;
pub mod daemonless;
pub mod dirs;
pub mod extract;
pub mod filesystem;
pub mod layer_cache;
pub mod lock_update;
pub mod registry;
