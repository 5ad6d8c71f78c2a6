//! Integration tests for lock file driven compilation

mod common;

use common::{TestUnit, DAEMON_LOCK, DAEMON_MANIFEST};
use stratum::core::compiler::BaseImage;
use stratum::core::lock::{Architecture, LockFile};
use stratum::core::manifest::BuildUnit;
use stratum::error::{ConfigError, StratumError};
use stratum::infra::backend::compile_unit;

fn unit(lock: Option<&str>) -> TestUnit {
    let unit = TestUnit::new();
    unit.write_manifest(DAEMON_MANIFEST);
    if let Some(lock) = lock {
        unit.create_file("stratum.lock", lock);
    }
    unit
}

#[test]
fn test_lock_pins_packages_and_base() {
    let unit = unit(Some(DAEMON_LOCK));
    let loaded = BuildUnit::load(&unit.path()).unwrap();
    let build = compile_unit(&loaded).unwrap();

    assert_eq!(
        build.installs[0].tokens,
        vec!["curl-7.61.1-22.el8.x86_64", "jq-1.5-12.el8.x86_64"]
    );
    match &build.base {
        BaseImage::Registry { digest, .. } => assert!(digest
            .as_deref()
            .is_some_and(|d| d.starts_with("sha256:9e5c"))),
        other => panic!("unexpected base {other:?}"),
    }
}

#[test]
fn test_lock_missing_package_fails() {
    let lock = DAEMON_LOCK.replace("name: curl", "name: wget");
    let unit = unit(Some(&lock));
    let loaded = BuildUnit::load(&unit.path()).unwrap();
    let err = compile_unit(&loaded).unwrap_err();
    assert!(matches!(
        err,
        StratumError::Config(ConfigError::UnresolvablePackage { ref package, .. }) if package == "curl"
    ));
}

#[test]
fn test_lock_pins_packages_no_instruction_names() {
    let lock = DAEMON_LOCK.replace(
        "  baseImage:",
        "  - name: oniguruma\n    version: 6.8.2\n    release: 2.1.el8\n    architecture: x86_64\n  baseImage:",
    );
    let unit = unit(Some(&lock));
    let loaded = BuildUnit::load(&unit.path()).unwrap();
    let build = compile_unit(&loaded).unwrap();

    assert_eq!(build.installs.len(), 2);
    assert_eq!(build.installs[1].tokens, vec!["oniguruma-6.8.2-2.1.el8.x86_64"]);
    assert_eq!(build.installs[1].repositories, vec!["internal"]);
}

#[test]
fn test_lock_without_entry_for_architecture_fails() {
    let lock = DAEMON_LOCK.replace("x86_64:", "aarch64:");
    let unit = unit(Some(&lock));
    let loaded = BuildUnit::load(&unit.path()).unwrap();
    let err = compile_unit(&loaded).unwrap_err();
    assert!(matches!(
        err,
        StratumError::Config(ConfigError::LockEntryMissing { ref architecture, .. }) if architecture == "x86_64"
    ));
}

#[test]
fn test_lock_for_other_base_version_fails() {
    let unit = unit(Some(DAEMON_LOCK));
    unit.write_manifest(&DAEMON_MANIFEST.replace("version = \"8\"", "version = \"9\""));
    let loaded = BuildUnit::load(&unit.path()).unwrap();
    let err = compile_unit(&loaded).unwrap_err();
    assert!(matches!(
        err,
        StratumError::Config(ConfigError::LockedBaseMismatch { ref declared, .. }) if declared == "rockylinux:9"
    ));
}

#[test]
fn test_fixture_round_trips_through_disk() {
    let unit = unit(Some(DAEMON_LOCK));
    let path = unit.path().join("stratum.lock");
    let lock = LockFile::load(&path).unwrap();
    lock.save(&path).unwrap();
    let reloaded = LockFile::load(&path).unwrap();
    assert_eq!(reloaded, lock);
    assert_eq!(reloaded.architectures().collect::<Vec<_>>(), vec![Architecture::X86_64]);
    assert_eq!(
        reloaded
            .get(Architecture::X86_64)
            .and_then(|entry| entry.packages.find_by_name("jq"))
            .map(|p| p.release.as_str()),
        Some("12.el8")
    );
}
