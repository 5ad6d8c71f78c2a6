//! Error types for stratum
//!
//! Domain-specific error types using thiserror. Every failure aborts the
//! current build unit; nothing here is recoverable except the transient
//! network errors, which are retried before they surface.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors, always raised before any external call
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Working directory is missing
    #[error("Can't build image, missing working directory {path}")]
    MissingWorkingDirectory { path: PathBuf },

    /// No instructions were declared
    #[error("Build unit '{unit}' declares no instructions")]
    EmptyInstructions { unit: String },

    /// No base image instruction
    #[error("Build unit '{unit}' does not declare a base image (from, from_local_archive or from_local_image_build)")]
    MissingBase { unit: String },

    /// More than one base image instruction
    #[error("Build unit '{unit}' declares more than one base image")]
    MultipleBases { unit: String },

    /// Instruction not supported by the selected backend
    #[error("Instruction '{instruction}' is not supported by the {backend} backend")]
    UnsupportedInstruction {
        instruction: String,
        backend: String,
    },

    /// Copy layer declared twice with different owners
    #[error("Layer {ordinal} is declared with conflicting owners '{first}' and '{second}'")]
    ConflictingLayerOwner {
        ordinal: u32,
        first: String,
        second: String,
    },

    /// Copy layer backing directory missing or empty
    #[error("Error in copy configuration: layer{ordinal} is not an existing, non-empty folder ({path})")]
    MissingLayer { ordinal: u32, path: PathBuf },

    /// Repository referenced by an install instruction is not declared
    #[error("Install instruction references unknown repository '{name}'")]
    UnknownRepository { name: String },

    /// Repository installer does not match the install instruction
    #[error("Repository '{name}' is a {expected} repository, but is used by a {actual} install")]
    RepositoryInstallerMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// Secret referenced by a repository URL is not available
    #[error("Secret '{key}' required by repository '{repository}' is not available")]
    MissingSecret { repository: String, key: String },

    /// Base image archive was not pulled yet
    #[error("Base image archive {path} does not exist. Run 'stratum pull' first.")]
    MissingBaseArchive { path: PathBuf },

    /// Pulled base image archive holds another image
    #[error("Base image archive {path} holds {found}, but the unit is based on {expected}. Run 'stratum pull' again.")]
    StaleBaseArchive {
        path: PathBuf,
        expected: String,
        found: String,
    },

    /// Sibling build unit has not been built yet
    #[error("Build unit at {path} has no recorded build output. Build it first.")]
    MissingBuildInfo { path: PathBuf },

    /// Lock file has no entry for the target architecture
    #[error("Lock file {path} has no entry for {architecture}. Run 'stratum lock update' for this architecture.")]
    LockEntryMissing {
        architecture: String,
        path: PathBuf,
    },

    /// Lock entry does not record a base image
    #[error("Missing base image in the lock file for {reference}. Does the lock file need to be regenerated?")]
    LockedBaseMissing { reference: String },

    /// Declared base image differs from the locked one
    #[error("Can't find {declared} in the lock file, it holds {locked}. Does the lock file need to be regenerated?")]
    LockedBaseMismatch { declared: String, locked: String },

    /// Package requested but not resolvable
    #[error("Package '{package}' is not pinned for {architecture} and no package index is available")]
    UnresolvablePackage {
        package: String,
        architecture: String,
    },

    /// Invalid value in the manifest
    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    /// Unsupported host architecture
    #[error("Unsupported architecture '{arch}'")]
    UnsupportedArchitecture { arch: String },
}

/// External container engine failures
#[derive(Error, Debug)]
pub enum ExternalToolError {
    /// Engine binary not found in PATH
    #[error("Container engine '{engine}' not found in PATH")]
    EngineNotFound { engine: String },

    /// Engine could not be spawned
    #[error("Failed to run '{command}': {error}")]
    SpawnFailed { command: String, error: String },

    /// Engine exited with a non-zero status
    #[error("'{command}' failed with exit code {code:?}\n{output}")]
    NonZeroExit {
        command: String,
        code: Option<i32>,
        output: String,
    },

    /// Engine version too old
    #[error("Container engine version must be {minimum} and above. Currently {actual}")]
    UnsupportedVersion { minimum: u32, actual: String },

    /// Unexpected output from the engine
    #[error("Unexpected output from '{command}': {message}")]
    UnexpectedOutput { command: String, message: String },
}

/// Archive handling errors
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// Entry would escape the destination directory
    #[error("Archive entry '{entry}' resolves outside of {destination}")]
    PathTraversal { entry: String, destination: PathBuf },

    /// Archive too short to carry a magic number
    #[error("Failed to read magic bytes from {path}")]
    MagicBytes { path: PathBuf },

    /// Missing manifest.json
    #[error("Archive {path} has no manifest.json")]
    MissingManifest { path: PathBuf },

    /// manifest.json could not be decoded
    #[error("Malformed manifest in {path}: {error}")]
    MalformedManifest { path: PathBuf, error: String },

    /// Config referenced by the manifest is missing or invalid
    #[error("Missing or invalid image config '{config}' in {path}")]
    MissingConfig { path: PathBuf, config: String },

    /// IO error
    #[error("IO error for '{path}': {error}")]
    Io { path: PathBuf, error: String },
}

/// Lockfile errors
#[derive(Error, Debug)]
pub enum LockfileError {
    /// Two entries share the same package name
    #[error("Multiple packages have the same name: '{name}' ({first} and {second})")]
    DuplicatePackage {
        name: String,
        first: String,
        second: String,
    },

    /// Lockfile could not be parsed
    #[error("Failed to parse lockfile: {0}")]
    Parse(String),

    /// Lockfile could not be written
    #[error("Failed to serialize lockfile: {0}")]
    Serialize(String),

    /// Package report line is not valid
    #[error("Package report line is not valid: '{line}'")]
    InvalidReportLine { line: String },

    /// Version pinned in the lockfile conflicts with the requested one
    #[error("Package '{package}' is locked at {locked} but {requested} was requested")]
    VersionConflict {
        package: String,
        locked: String,
        requested: String,
    },
}

/// Registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Invalid image reference
    #[error("'{reference}' is not a valid image reference: {error}")]
    InvalidReference { reference: String, error: String },

    /// Pull failed after all retries
    #[error("Error pulling '{reference}': {error}")]
    PullFailed { reference: String, error: String },

    /// Push failed after all retries
    #[error("Error pushing image archive to registry ({reference}): {error}")]
    PushFailed { reference: String, error: String },
}

/// Filesystem errors
#[derive(Error, Debug)]
pub enum FilesystemError {
    /// Failed to create directory
    #[error("Failed to create directory '{path}': {error}")]
    CreateDir { path: PathBuf, error: String },

    /// Failed to remove directory
    #[error("Failed to remove directory '{path}': {error}")]
    RemoveDir { path: PathBuf, error: String },

    /// Failed to write file
    #[error("Failed to write file '{path}': {error}")]
    WriteFile { path: PathBuf, error: String },

    /// Failed to read file
    #[error("Failed to read file '{path}': {error}")]
    ReadFile { path: PathBuf, error: String },

    /// Failed to copy file
    #[error("Failed to copy '{from}' to '{to}': {error}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        error: String,
    },
}

/// Top-level stratum error type
#[derive(Error, Debug)]
pub enum StratumError {
    /// Manifest not found
    #[error("Manifest not found at '{path}'. A build unit needs a stratum.toml.")]
    ManifestNotFound { path: String },

    /// Manifest parse error
    #[error("Failed to parse manifest: {source}")]
    ManifestParse { source: toml::de::Error },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// External tool error
    #[error("External tool error: {0}")]
    ExternalTool(#[from] ExternalToolError),

    /// Archive error
    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    /// Lockfile error
    #[error("Lockfile error: {0}")]
    Lockfile(#[from] LockfileError),

    /// Registry error
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Filesystem error
    #[error("Filesystem error: {0}")]
    Filesystem(#[from] FilesystemError),

    /// Failure in a named build stage
    #[error("{stage} failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: Box<StratumError>,
    },
}

impl StratumError {
    /// Wrap an error with the build stage it happened in
    pub fn in_stage(stage: impl Into<String>, source: impl Into<StratumError>) -> Self {
        Self::Stage {
            stage: stage.into(),
            source: Box::new(source.into()),
        }
    }
}
