//! Stratum - reproducible container image builds
//!
//! Turns a build unit (an ordered list of build instructions plus a
//! per-architecture package lock file) into an image archive, either
//! through a container engine or by assembling the archive directly.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`cli`] - Command-line interface parsing and output formatting
//! - [`core`] - Build logic (no process or network I/O)
//! - [`infra`] - Infrastructure layer (archives, engine, registry)
//! - [`config`] - Configuration and constants
//! - [`error`] - Error types and handling

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod infra;

#[cfg(test)]
pub mod test_utils;
