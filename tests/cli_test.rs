//! Integration tests for the stratum command line
//!
//! Drives the compiled binary against temporary build units. Nothing here
//! needs a container engine or network access.

mod common;

use common::{write_parent_archive, TestUnit, DAEMONLESS_MANIFEST, DAEMON_LOCK, DAEMON_MANIFEST};

fn stdout(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn daemon_unit() -> TestUnit {
    let unit = TestUnit::new();
    unit.write_manifest(DAEMON_MANIFEST);
    unit.create_file("stratum.lock", DAEMON_LOCK);
    unit.create_file("bin/tool", "#!/bin/sh\necho tool\n");
    unit
}

fn daemonless_unit() -> TestUnit {
    let unit = TestUnit::new();
    unit.write_manifest(DAEMONLESS_MANIFEST);
    unit.create_file("app/index.html", "<h1>hello</h1>\n");
    write_parent_archive(
        &unit.path().join("base.tar"),
        "base:1.0",
        &["/bin/sh"],
        &[("etc/os-release", "ID=test\n")],
    );
    unit
}

#[test]
fn test_render_pins_packages_and_base() {
    let unit = daemon_unit();
    let output = unit.run(&["render"]);
    assert!(output.status.success(), "render failed: {}", stderr(&output));

    let rendered = stdout(&output);
    assert!(rendered.contains(
        "FROM rockylinux:8@sha256:9e5c4d3b0a8a2b6f2c0b6c2e1c7d5d6a7b8c9d0e1f2a3b4c5d6e7f8091a2b3c4"
    ));
    assert!(rendered.contains("jq-1.5-12.el8.x86_64"));
    assert!(rendered.contains("curl-7.61.1-22.el8.x86_64"));
    assert!(rendered.contains("--mount=type=bind,target=/mnt/ephemeral,source=ephemeral"));
    assert!(rendered.contains("COPY context/layer1 /"));
    assert!(rendered.contains(r#"CMD ["/usr/local/bin/tool", "--serve"]"#));
}

#[test]
fn test_render_never_contains_repository_url() {
    let unit = daemon_unit();
    let output = unit.run(&["render"]);
    assert!(output.status.success());
    let rendered = stdout(&output);
    assert!(!rendered.contains("repo.example.com"));
    assert!(!rendered.contains("REPO_TOKEN"));
}

#[test]
fn test_lock_show() {
    let unit = daemon_unit();
    let output = unit.run(&["lock", "show"]);
    assert!(output.status.success());
    let shown = stdout(&output);
    assert!(shown.contains("x86_64:"));
    assert!(shown.contains("name: jq"));
    assert!(shown.contains("baseImage:"));
}

#[test]
fn test_lock_show_without_lock_file() {
    let unit = TestUnit::new();
    unit.write_manifest(DAEMONLESS_MANIFEST);
    let output = unit.run(&["lock", "show"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("No lock entries"));
}

#[test]
fn test_missing_manifest_fails() {
    let unit = TestUnit::new();
    let output = unit.run(&["render"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("Failed to load build unit"));
}

#[test]
fn test_daemonless_build_and_inspect() {
    let unit = daemonless_unit();
    let cache = unit.path().join("layer-cache");
    let output = unit.run(&["build", "--layer-cache", cache.to_str().unwrap()]);
    assert!(output.status.success(), "build failed: {}", stderr(&output));
    assert!(stdout(&output).contains("Built web:1.0"));
    assert!(unit.file_exists("build/image.tar"));
    assert!(unit.read_file("build/imageBuildInfo.json").contains("\"tag\": \"web:1.0\""));

    let archive = unit.path().join("build/image.tar");
    let output = common::run_stratum(&unit.path(), &["inspect", archive.to_str().unwrap()]);
    assert!(output.status.success(), "inspect failed: {}", stderr(&output));
    let shown = stdout(&output);
    assert!(shown.contains("web:1.0"));
    assert!(shown.contains(r#"["/bin/sh"]"#));
    assert!(shown.contains("org.example.team=platform"));
    assert!(shown.contains("Layers:       2"));
}

#[test]
fn test_push_without_archive_fails() {
    let unit = daemonless_unit();
    let output = unit.run(&["push"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("stratum build"));
}

#[test]
fn test_version_flag() {
    let output = std::process::Command::new(env!("CARGO_BIN_EXE_stratum"))
        .arg("--version")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(stdout(&output).contains(env!("CARGO_PKG_VERSION")));
}
