//! Default configuration values

/// Maximum number of attempts for pulling a named reference
pub const MAX_PULL_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff (in milliseconds)
pub const RETRY_BASE_DELAY_MS: u64 = 1_000;

/// Hard cap for a single backoff delay (in milliseconds)
pub const RETRY_MAX_DELAY_MS: u64 = 30_000;

/// Default container engine binary
pub const DEFAULT_ENGINE: &str = "docker";

/// Minimum supported engine server major version
pub const MIN_ENGINE_MAJOR_VERSION: u32 = 19;

/// Environment variables passed through to the container engine
pub const ENGINE_ENV_ALLOWLIST: &[&str] = &["LANG", "LC_ALL", "LC_CTYPE", "PATH"];

/// Manifest file name of a build unit
pub const MANIFEST_FILE: &str = "stratum.toml";

/// Lockfile name of a build unit
pub const LOCKFILE_FILE: &str = "stratum.lock";

/// Modification time stamped on every file added by the daemonless backend
/// (seconds since the epoch)
pub const LAYER_ENTRY_MTIME: u64 = 1;

/// Creation time recorded in image configs assembled without an engine
pub const DEFAULT_CREATED: &str = "1970-01-01T00:00:00Z";

/// Tag suffix of the throwaway image built to refresh a lock file
pub const LOCK_IMAGE_SUFFIX: &str = "-stratum-lock:latest";
