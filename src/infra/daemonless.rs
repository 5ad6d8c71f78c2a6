//! Daemonless backend
//!
//! Assembles a `docker load` compatible archive without any engine: the
//! parent image's layers are copied as they are, every top-level entry of
//! each staged copy layer becomes one new gzip layer, and the parent's
//! config is updated with the unit's metadata. Entry timestamps are fixed
//! so unchanged inputs produce identical layers, which are reused from the
//! on-disk layer cache.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::defaults;
use crate::config::paths::UnitLayout;
use crate::core::build_info::{BuildInfo, BuilderKind};
use crate::core::compiler::{BaseImage, CompiledBuild, CopyLayer};
use crate::core::instruction::HealthCheck;
use crate::core::manifest::BuildUnit;
use crate::error::{ArchiveError, ConfigError, FilesystemError, StratumError};
use crate::infra::archive::{ImageArchive, ImageConfig, ManifestEntry};
use crate::infra::backend::ImageBuilder;
use crate::infra::context;
use crate::infra::layer_cache::{CachedLayer, LayerCache};

const BACKEND: &str = "daemonless";

/// Ownership stamped on every entry of a layer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Owner {
    pub uid: u64,
    pub gid: u64,
    pub user: Option<String>,
    pub group: Option<String>,
}

impl Owner {
    /// Parse `user[:group]`, where either part is a name or a numeric id
    ///
    /// Without a group, the group mirrors the user.
    pub fn parse(spec: &str) -> Self {
        let (user, group) = match spec.split_once(':') {
            Some((user, group)) => (user, group),
            None => (spec, spec),
        };
        let mut owner = Self::default();
        match user.parse() {
            Ok(uid) => owner.uid = uid,
            Err(_) => owner.user = Some(user.to_string()),
        }
        match group.parse() {
            Ok(gid) => owner.gid = gid,
            Err(_) => owner.group = Some(group.to_string()),
        }
        owner
    }

    fn apply(&self, header: &mut tar::Header) -> io::Result<()> {
        header.set_uid(self.uid);
        header.set_gid(self.gid);
        if let Some(user) = &self.user {
            header.set_username(user)?;
        }
        if let Some(group) = &self.group {
            header.set_groupname(group)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn entry_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn entry_mode(meta: &std::fs::Metadata) -> u32 {
    if meta.is_dir() {
        0o755
    } else if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Uncompressed tar of `source`, rooted at `/<name>`
pub fn layer_tar(source: &Path, name: &str, owner: Option<&Owner>) -> io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    for entry in WalkDir::new(source).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry.path().strip_prefix(source).unwrap_or(Path::new(""));
        let path = if relative.as_os_str().is_empty() {
            PathBuf::from(name)
        } else {
            Path::new(name).join(relative)
        };
        let meta = entry.path().symlink_metadata()?;

        let mut header = tar::Header::new_gnu();
        header.set_mtime(defaults::LAYER_ENTRY_MTIME);
        header.set_mode(entry_mode(&meta));
        header.set_uid(0);
        header.set_gid(0);
        if let Some(owner) = owner {
            owner.apply(&mut header)?;
        }

        if meta.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            builder.append_data(&mut header, &path, io::empty())?;
        } else if meta.file_type().is_symlink() {
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            let target = std::fs::read_link(entry.path())?;
            builder.append_link(&mut header, &path, &target)?;
        } else {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(meta.len());
            builder.append_data(&mut header, &path, File::open(entry.path())?)?;
        }
    }
    builder.into_inner()
}

fn gzip(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn file_sha256_hex(path: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    io::copy(&mut File::open(path)?, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Parse a duration such as `30s`, `1m30s` or `500ms` into nanoseconds
pub fn parse_duration(value: &str) -> Option<u64> {
    let mut total: u64 = 0;
    let mut rest = value.trim();
    if rest.is_empty() {
        return None;
    }
    while !rest.is_empty() {
        let digits = rest.chars().take_while(char::is_ascii_digit).count();
        let amount: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        let unit_len = rest.chars().take_while(char::is_ascii_alphabetic).count();
        let factor: u64 = match &rest[..unit_len] {
            "ns" => 1,
            "us" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            _ => return None,
        };
        rest = &rest[unit_len..];
        total = total.checked_add(amount.checked_mul(factor)?)?;
    }
    Some(total)
}

fn healthcheck_json(check: &HealthCheck) -> Result<Value, ConfigError> {
    let mut value = Map::new();
    value.insert("Test".to_string(), json!(["CMD-SHELL", check.cmd]));
    let durations = [
        ("Interval", "health_check.interval", &check.interval),
        ("Timeout", "health_check.timeout", &check.timeout),
        ("StartPeriod", "health_check.start_period", &check.start_period),
    ];
    for (key, field, duration) in durations {
        if let Some(duration) = duration {
            let nanos = parse_duration(duration).ok_or_else(|| ConfigError::InvalidValue {
                field: field.to_string(),
                message: format!("'{duration}' is not a duration"),
            })?;
            value.insert(key.to_string(), json!(nanos));
        }
    }
    if let Some(retries) = check.retries {
        value.insert("Retries".to_string(), json!(retries));
    }
    Ok(Value::Object(value))
}

/// Apply the unit's image metadata on top of the parent config
///
/// Entrypoint and cmd are inherited unless the unit declares non-empty
/// values of its own.
pub fn apply_metadata(config: &mut ImageConfig, build: &CompiledBuild) -> Result<(), ConfigError> {
    let runtime = &mut config.config;

    if !build.env.is_empty() {
        let env = runtime.env.get_or_insert_with(Vec::new);
        for (key, value) in &build.env {
            let prefix = format!("{key}=");
            let entry = format!("{key}={value}");
            match env.iter_mut().find(|e| e.starts_with(&prefix)) {
                Some(existing) => *existing = entry,
                None => env.push(entry),
            }
        }
    }

    if build.maintainer.is_some() || !build.labels.is_empty() {
        let labels = runtime.labels.get_or_insert_with(BTreeMap::new);
        if let Some(maintainer) = &build.maintainer {
            labels.insert("maintainer".to_string(), maintainer.clone());
        }
        for (key, value) in &build.labels {
            labels.insert(key.clone(), value.clone());
        }
    }

    if !build.exposed.is_empty() {
        let ports = runtime.exposed_ports.get_or_insert_with(BTreeMap::new);
        for (port, protocol) in &build.exposed {
            ports.insert(format!("{port}/{protocol}"), json!({}));
        }
    }

    if let Some(workdir) = &build.workdir {
        runtime.working_dir = Some(workdir.clone());
    }
    if let Some(user) = &build.user {
        runtime.user = Some(user.clone());
    }
    if !build.entrypoint.is_empty() {
        runtime.entrypoint = Some(build.entrypoint.clone());
    }
    if !build.cmd.is_empty() {
        runtime.cmd = Some(build.cmd.clone());
    }
    if let Some(check) = &build.healthcheck {
        runtime.healthcheck = Some(healthcheck_json(check)?);
    }

    if let Some(maintainer) = &build.maintainer {
        config.author = Some(maintainer.clone());
    }
    config.created = Some(defaults::DEFAULT_CREATED.to_string());
    Ok(())
}

/// Blob written into the output archive
#[derive(Debug, Clone)]
struct Blob {
    path: PathBuf,
    hex: String,
}

impl Blob {
    fn name(&self) -> String {
        format!("blobs/sha256/{}", self.hex)
    }
}

fn blob_header(size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(defaults::LAYER_ENTRY_MTIME);
    header
}

/// Write a `docker save` style archive atomically
fn write_archive(path: &Path, tag: &str, config: &[u8], layers: &[Blob]) -> Result<(), StratumError> {
    let io_err = |e: io::Error| ArchiveError::Io {
        path: path.to_path_buf(),
        error: e.to_string(),
    };
    let parent = path.parent().unwrap_or(Path::new("."));
    let partial = tempfile::NamedTempFile::new_in(parent).map_err(io_err)?;

    let config_name = format!("blobs/sha256/{}", sha256_hex(config));
    let manifest = vec![ManifestEntry {
        config: config_name.clone(),
        repo_tags: vec![tag.to_string()],
        layers: layers.iter().map(Blob::name).collect(),
    }];
    let manifest = serde_json::to_vec(&manifest).map_err(|e| ArchiveError::MalformedManifest {
        path: path.to_path_buf(),
        error: e.to_string(),
    })?;

    {
        let mut builder = tar::Builder::new(BufWriter::new(partial.as_file()));
        let mut written = HashSet::new();
        builder
            .append_data(&mut blob_header(config.len() as u64), &config_name, config)
            .map_err(io_err)?;
        for layer in layers {
            if !written.insert(layer.hex.clone()) {
                continue;
            }
            let file = File::open(&layer.path).map_err(io_err)?;
            let size = file.metadata().map_err(io_err)?.len();
            builder
                .append_data(&mut blob_header(size), layer.name(), file)
                .map_err(io_err)?;
        }
        builder
            .append_data(
                &mut blob_header(manifest.len() as u64),
                "manifest.json",
                manifest.as_slice(),
            )
            .map_err(io_err)?;
        builder
            .into_inner()
            .and_then(|mut w| w.flush())
            .map_err(io_err)?;
    }

    partial.persist(path).map_err(|e| FilesystemError::WriteFile {
        path: path.to_path_buf(),
        error: e.error.to_string(),
    })?;
    Ok(())
}

/// Assembles image archives without a container engine
#[derive(Debug, Clone)]
pub struct DaemonlessBackend {
    cache: LayerCache,
}

impl DaemonlessBackend {
    /// Backend reusing layers from `cache`
    pub fn new(cache: LayerCache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &LayerCache {
        &self.cache
    }

    /// Archive the parent image is read from
    pub fn parent_archive(base: &BaseImage, layout: &UnitLayout) -> Result<PathBuf, StratumError> {
        match base {
            BaseImage::Registry { .. } => {
                let path = layout.base_image_archive();
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(ConfigError::MissingBaseArchive { path }.into())
                }
            }
            BaseImage::Archive(path) => Ok(path.clone()),
            BaseImage::LocalBuild(reference) => {
                reference.build_info()?;
                Ok(reference.archive())
            }
        }
    }

    /// Fail unless a pulled base archive holds the image the unit is based on
    ///
    /// Only registry bases are checked; local archives and sibling builds
    /// are taken as they are.
    pub fn check_parent(base: &BaseImage, path: &Path, parent: &ImageArchive) -> Result<(), ConfigError> {
        let Some(expected) = base.reference() else {
            return Ok(());
        };
        if parent.repo_tags().iter().any(|tag| *tag == expected) {
            return Ok(());
        }
        Err(ConfigError::StaleBaseArchive {
            path: path.to_path_buf(),
            expected,
            found: if parent.repo_tags().is_empty() {
                "an untagged image".to_string()
            } else {
                parent.repo_tags().join(", ")
            },
        })
    }

    /// One cached layer per top-level entry of a staged copy layer
    fn containerize(&self, layer: &CopyLayer, layout: &UnitLayout) -> Result<Vec<CachedLayer>, StratumError> {
        let dir = layout.layer_dir(layer.ordinal);
        let read_err = |e: io::Error| FilesystemError::ReadFile {
            path: dir.clone(),
            error: e.to_string(),
        };
        let mut names: Vec<String> = std::fs::read_dir(&dir)
            .map_err(read_err)?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<Result<_, _>>()
            .map_err(read_err)?;
        names.sort();

        let owner = layer.owner.as_deref().map(Owner::parse);
        let mut cached = Vec::with_capacity(names.len());
        for name in names {
            let source = dir.join(&name);
            let key = LayerCache::key(&source, &name, layer.owner.as_deref())?;
            if let Some(hit) = self.cache.get(&key) {
                debug!("Reusing cached layer for /{}", name);
                cached.push(hit);
                continue;
            }
            let tar = layer_tar(&source, &name, owner.as_ref()).map_err(read_err)?;
            let diff_id = format!("sha256:{}", sha256_hex(&tar));
            let blob = gzip(&tar).map_err(read_err)?;
            debug!("Created layer for /{} ({} bytes)", name, blob.len());
            cached.push(self.cache.put(&key, &blob, &diff_id)?);
        }
        Ok(cached)
    }
}

impl ImageBuilder for DaemonlessBackend {
    fn kind(&self) -> BuilderKind {
        BuilderKind::ArchiveAssembler
    }

    fn build(&self, unit: &BuildUnit, build: &CompiledBuild) -> Result<BuildInfo, StratumError> {
        if let Some(step) = build.shell_steps().first() {
            return Err(ConfigError::UnsupportedInstruction {
                instruction: (*step).to_string(),
                backend: BACKEND.to_string(),
            }
            .into());
        }
        let layout = &unit.layout;
        let tag = unit.tag();
        context::stage_copy_layers(build, layout)?;

        let parent_path = Self::parent_archive(&build.base, layout)?;
        let parent = ImageArchive::open(&parent_path)
            .map_err(|e| StratumError::in_stage("open parent image", e))?;
        Self::check_parent(&build.base, &parent_path, &parent)?;
        info!(
            "Assembling {} on top of {}",
            tag,
            parent.tag().unwrap_or("untagged parent")
        );

        let mut config = parent.config().clone();
        apply_metadata(&mut config, build)?;

        let mut blobs = Vec::new();
        for path in parent
            .layer_paths()
            .map_err(|e| StratumError::in_stage("read parent layers", e))?
        {
            let hex = file_sha256_hex(&path).map_err(|e| {
                StratumError::in_stage(
                    "read parent layers",
                    ArchiveError::Io {
                        path: path.clone(),
                        error: e.to_string(),
                    },
                )
            })?;
            blobs.push(Blob { path, hex });
        }

        for layer in build.copy_layers() {
            let stage = format!("containerize layer{}", layer.ordinal);
            let cached = self
                .containerize(layer, layout)
                .map_err(|e| StratumError::in_stage(stage.as_str(), e))?;
            for entry in cached {
                config.rootfs.diff_ids.push(entry.diff_id.clone());
                config.history.push(json!({
                    "created": defaults::DEFAULT_CREATED,
                    "created_by": format!("stratum layer{}", layer.ordinal),
                }));
                blobs.push(Blob {
                    path: self.cache.blob_path(&entry),
                    hex: entry.digest.trim_start_matches("sha256:").to_string(),
                });
            }
        }

        let config_bytes = serde_json::to_vec(&config).map_err(|e| {
            StratumError::in_stage(
                "write image config",
                ArchiveError::MalformedManifest {
                    path: layout.image_archive(),
                    error: e.to_string(),
                },
            )
        })?;
        write_archive(&layout.image_archive(), &tag, &config_bytes, &blobs)
            .map_err(|e| StratumError::in_stage("write image archive", e))?;

        let image_id = format!("sha256:{}", sha256_hex(&config_bytes));
        info!("Assembled {} ({})", tag, image_id);
        Ok(BuildInfo::new(tag, BuilderKind::ArchiveAssembler, image_id))
    }
}
