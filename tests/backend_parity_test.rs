//! Daemon and daemonless backends produce equivalent images
//!
//! Needs a local docker engine and network access to pull the parent
//! image; skipped otherwise.

mod common;

use std::process::Command;

use common::{docker_available, TestUnit};
use stratum::core::manifest::{Backend, BuildUnit};
use stratum::core::secrets::StaticSecrets;
use stratum::infra::archive::ImageArchive;
use stratum::infra::backend::{build_unit, builder_for, BuildOptions};
use tempfile::TempDir;

const PARENT: &str = "alpine:3.19";

const MANIFEST: &str = r#"
[unit]
name = "parity"
tag = "stratum-parity:test"
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
key = "APP_MODE"
value = "parity"

[[instruction]]
type = "label"
key = "org.example.parity"
value = "yes"

[[instruction]]
type = "cmd"
args = ["/opt/app/run.sh"]
"#;

fn save_parent(path: &std::path::Path) -> bool {
    let pulled = Command::new("docker").args(["pull", PARENT]).status();
    if !pulled.is_ok_and(|s| s.success()) {
        return false;
    }
    Command::new("docker")
        .arg("save")
        .arg(format!("--output={}", path.display()))
        .arg(PARENT)
        .status()
        .is_ok_and(|s| s.success())
}

fn build_with(backend: Backend, cache: &TempDir) -> (TestUnit, ImageArchive) {
    let unit = TestUnit::new();
    unit.write_manifest(MANIFEST);
    unit.create_file("app/run.sh", "#!/bin/sh\necho parity\n");
    unit.create_file("app/data/values.txt", "1 2 3\n");
    assert!(save_parent(&unit.path().join("base.tar")));

    let loaded = BuildUnit::load(&unit.path()).unwrap();
    let options = BuildOptions::default()
        .with_backend(Some(backend))
        .with_layer_cache(Some(cache.path().to_path_buf()));
    let secrets = StaticSecrets::new();
    let builder = builder_for(&loaded, &options, &secrets).unwrap();
    build_unit(&loaded, builder.as_ref()).unwrap();

    let image = ImageArchive::open(&unit.path().join("build/image.tar")).unwrap();
    (unit, image)
}

#[test]
fn test_backends_produce_equivalent_images() {
    if !docker_available() {
        eprintln!("Skipping: docker not available");
        return;
    }
    let scratch = TempDir::new().unwrap();
    if !save_parent(&scratch.path().join("base.tar")) {
        eprintln!("Skipping: cannot pull {PARENT}");
        return;
    }

    let cache = TempDir::new().unwrap();
    let (_daemon_unit, daemon) = build_with(Backend::Daemon, &cache);
    let (_daemonless_unit, daemonless) = build_with(Backend::Daemonless, &cache);

    assert_eq!(daemon.cmd(), daemonless.cmd());
    let env = |image: &ImageArchive| image.config().config.env.clone().unwrap_or_default();
    assert!(env(&daemon).contains(&"APP_MODE=parity".to_string()));
    assert!(env(&daemonless).contains(&"APP_MODE=parity".to_string()));
    let label = "org.example.parity";
    assert_eq!(daemon.labels().get(label).map(String::as_str), Some("yes"));
    assert_eq!(daemon.labels().get(label), daemonless.labels().get(label));

    let daemon_root = TempDir::new().unwrap();
    let daemonless_root = TempDir::new().unwrap();
    daemon.flatten(daemon_root.path()).unwrap();
    daemonless.flatten(daemonless_root.path()).unwrap();
    for file in ["opt/app/run.sh", "opt/app/data/values.txt", "etc/alpine-release"] {
        assert_eq!(
            std::fs::read(daemon_root.path().join(file)).unwrap(),
            std::fs::read(daemonless_root.path().join(file)).unwrap(),
            "{file} differs between backends"
        );
    }

    let _ = Command::new("docker")
        .args(["image", "rm", "--force", "stratum-parity:test"])
        .status();
}
