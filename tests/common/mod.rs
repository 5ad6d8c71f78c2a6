//! Common test utilities and helpers
//!
//! This module provides shared utilities for integration tests.

#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

/// Test build unit
///
/// Creates a temporary directory holding a build unit and provides
/// utilities for setting up test scenarios.
pub struct TestUnit {
    /// Temporary directory for the build unit
    pub dir: TempDir,
}

impl TestUnit {
    /// Create a new, empty build unit directory
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Get the path to the unit directory
    pub fn path(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Create a file in the unit
    pub fn create_file(&self, name: &str, content: &str) {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent directories");
        }
        std::fs::write(path, content).expect("Failed to write file");
    }

    /// Create a directory in the unit
    pub fn create_dir(&self, name: &str) {
        std::fs::create_dir_all(self.dir.path().join(name)).expect("Failed to create directory");
    }

    /// Write `stratum.toml`
    pub fn write_manifest(&self, content: &str) {
        self.create_file("stratum.toml", content);
    }

    /// Check if a file exists in the unit
    pub fn file_exists(&self, name: &str) -> bool {
        self.dir.path().join(name).exists()
    }

    /// Read a file from the unit
    pub fn read_file(&self, name: &str) -> String {
        std::fs::read_to_string(self.dir.path().join(name)).expect("Failed to read file")
    }

    /// Run the stratum binary against this unit
    pub fn run(&self, args: &[&str]) -> Output {
        run_stratum(&self.path(), args)
    }
}

impl Default for TestUnit {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the stratum binary with `-C dir`
pub fn run_stratum(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_stratum"))
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .expect("Failed to execute stratum")
}

/// Check if a docker engine is available
pub fn docker_available() -> bool {
    stratum::infra::daemon::Engine::is_available("docker")
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn append(builder: &mut tar::Builder<Vec<u8>>, name: &str, data: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(1);
    header.set_cksum();
    builder
        .append_data(&mut header, name, data)
        .expect("Failed to append tar entry");
}

fn layer(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, content) in files {
        append(&mut builder, name, content.as_bytes());
    }
    builder.into_inner().expect("Failed to finish layer")
}

/// Write a `docker save` style parent image archive
///
/// The image has one plain tar layer holding `files`, the given `Cmd` and
/// a `PATH` environment variable.
pub fn write_parent_archive(path: &Path, tag: &str, cmd: &[&str], files: &[(&str, &str)]) {
    let layer = layer(files);
    let layer_hex = sha256_hex(&layer);
    let config = serde_json::to_vec(&json!({
        "architecture": "amd64",
        "os": "linux",
        "config": {
            "Env": ["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"],
            "Cmd": cmd,
        },
        "rootfs": {"type": "layers", "diff_ids": [format!("sha256:{layer_hex}")]},
        "history": [{"created_by": "parent"}],
    }))
    .expect("Failed to encode config");
    let config_name = format!("{}.json", sha256_hex(&config));
    let layer_name = format!("{layer_hex}/layer.tar");
    let manifest = serde_json::to_vec(&json!([{
        "Config": config_name,
        "RepoTags": [tag],
        "Layers": [layer_name],
    }]))
    .expect("Failed to encode manifest");

    let mut builder = tar::Builder::new(Vec::new());
    append(&mut builder, &config_name, &config);
    append(&mut builder, &layer_name, &layer);
    append(&mut builder, "manifest.json", &manifest);
    let bytes = builder.into_inner().expect("Failed to finish archive");
    std::fs::write(path, bytes).expect("Failed to write archive");
}

/// Compress a file in place with zstd
pub fn zstd_compress(path: &Path) {
    let data = std::fs::read(path).expect("Failed to read file");
    let compressed = zstd::encode_all(data.as_slice(), 3).expect("Failed to compress");
    std::fs::write(path, compressed).expect("Failed to write file");
}

/// Gzip bytes
pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("Failed to compress");
    encoder.finish().expect("Failed to finish gzip")
}

/// Manifest of a daemonless unit built on `base.tar` with one copy layer
pub const DAEMONLESS_MANIFEST: &str = r#"
[unit]
name = "web"
tag = "web:1.0"
backend = "daemonless"
architecture = "x86_64"

[[instruction]]
type = "from_local_archive"
archive = "base.tar"

[[instruction]]
type = "copy"
from = "app"
into = "/opt/app"
layer = 1

[[instruction]]
type = "env"
key = "APP_HOME"
value = "/opt/app"

[[instruction]]
type = "label"
key = "org.example.team"
value = "platform"
"#;

/// Manifest of a daemon unit with a package install
pub const DAEMON_MANIFEST: &str = r#"
[unit]
name = "tools"
tag = "tools:2.0"
architecture = "x86_64"

[[repository]]
name = "internal"
installer = "yum"
url = "https://{{REPO_TOKEN}}@repo.example.com/el8"

[[instruction]]
type = "from"
image = "rockylinux"
version = "8"

[[instruction]]
type = "install"
installer = "yum"
repositories = ["internal"]
packages = ["jq", "curl"]

[[instruction]]
type = "copy"
from = "bin"
into = "/usr/local/bin"
layer = 1

[[instruction]]
type = "cmd"
args = ["/usr/local/bin/tool", "--serve"]
"#;

/// Lock file matching [`DAEMON_MANIFEST`]
pub const DAEMON_LOCK: &str = r#"
x86_64:
  packages:
  - name: curl
    version: 7.61.1
    release: 22.el8
    architecture: x86_64
  - name: jq
    version: '1.5'
    release: 12.el8
    architecture: x86_64
  baseImage:
    repository: rockylinux
    tag: '8'
    digest: sha256:9e5c4d3b0a8a2b6f2c0b6c2e1c7d5d6a7b8c9d0e1f2a3b4c5d6e7f8091a2b3c4
"#;
