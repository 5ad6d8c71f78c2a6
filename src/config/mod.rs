//! Configuration and constants
//!
//! - [`defaults`] - Default values for retries, engines and file names
//! - [`paths`] - Well-known per-unit paths

pub mod defaults;
pub mod paths;
