//! Platform-specific directory management
//!
//! Stratum only keeps one piece of shared state outside a build unit: the
//! daemonless backend's application layer cache. It lives under the
//! platform cache directory unless `STRATUM_CACHE_DIR` points elsewhere.
//!
//! - Linux: `$XDG_CACHE_HOME/stratum` or `~/.cache/stratum`
//! - macOS: `~/Library/Caches/stratum`

use std::env;
use std::path::PathBuf;

/// Environment variable overriding the cache directory
pub const ENV_CACHE_DIR: &str = "STRATUM_CACHE_DIR";

/// Application name used in directory paths
const APP_NAME: &str = "stratum";

const LAYER_CACHE_SUBDIR: &str = "layers";

/// Platform-specific directory provider for stratum
#[derive(Debug, Clone)]
pub struct StratumDirs {
    cache_dir: PathBuf,
}

impl StratumDirs {
    /// Resolve directories from the environment or platform defaults
    #[must_use]
    pub fn new() -> Self {
        Self {
            cache_dir: Self::resolve_cache_dir(),
        }
    }

    /// Use an explicit cache directory
    #[must_use]
    pub fn with_cache_dir(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    /// Cache directory
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone()
    }

    /// Default application layer cache of the daemonless backend
    #[must_use]
    pub fn layer_cache_dir(&self) -> PathBuf {
        self.cache_dir.join(LAYER_CACHE_SUBDIR)
    }

    fn resolve_cache_dir() -> PathBuf {
        if let Ok(path) = env::var(ENV_CACHE_DIR) {
            return PathBuf::from(path);
        }

        dirs::cache_dir()
            .map(|p| p.join(APP_NAME))
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .map(|h| h.join(".cache").join(APP_NAME))
                    .unwrap_or_else(|| PathBuf::from(".").join(".cache").join(APP_NAME))
            })
    }
}

impl Default for StratumDirs {
    fn default() -> Self {
        Self::new()
    }
}
