//! Daemon backend
//!
//! Renders the compiled build to a Dockerfile and drives an external
//! container engine (`docker` or a CLI compatible one) to build, save and
//! inspect the image. The engine's own layer cache is never used and its
//! environment is reduced to an allow-list, so results depend only on the
//! build unit.

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::NamedTempFile;

use tracing::{debug, info, warn};

use crate::config::defaults;
use crate::config::paths::UnitLayout;
use crate::core::build_info::{BuildInfo, BuilderKind};
use crate::core::compiler::{BaseImage, CompiledBuild};
use crate::core::dockerfile::{self, RenderContext};
use crate::core::manifest::BuildUnit;
use crate::core::retry::RetryPolicy;
use crate::core::secrets::SecretProvider;
use crate::error::{ExternalToolError, FilesystemError, StratumError};
use crate::infra::archive::ImageArchive;
use crate::infra::backend::ImageBuilder;
use crate::infra::{context, filesystem};

/// Name of the ephemeral directory as seen from the build context
const EPHEMERAL_SOURCE: &str = "ephemeral";

/// An external container engine CLI
#[derive(Debug, Clone)]
pub struct Engine {
    name: String,
    binary: PathBuf,
}

impl Engine {
    /// Locate `name` in `PATH`
    pub fn detect(name: &str) -> Result<Self, ExternalToolError> {
        let binary = which::which(name).map_err(|_| ExternalToolError::EngineNotFound {
            engine: name.to_string(),
        })?;
        Ok(Self {
            name: name.to_string(),
            binary,
        })
    }

    /// Check whether `name` can be found in `PATH`
    pub fn is_available(name: &str) -> bool {
        which::which(name).is_ok()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args).env_clear();
        for var in defaults::ENGINE_ENV_ALLOWLIST {
            if let Ok(value) = std::env::var(var) {
                cmd.env(var, value);
            }
        }
        cmd.env("DOCKER_BUILDKIT", "1");
        cmd
    }

    /// Run the engine and return its standard output
    ///
    /// A non-zero exit carries the combined output in the error.
    pub fn run(&self, args: &[String], cwd: Option<&Path>) -> Result<String, ExternalToolError> {
        let command_line = format!("{} {}", self.name, args.join(" "));
        debug!("Running {}", command_line);

        let mut cmd = self.command(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        let output = cmd.output().map_err(|e| ExternalToolError::SpawnFailed {
            command: command_line.clone(),
            error: e.to_string(),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExternalToolError::NonZeroExit {
                command: command_line,
                code: output.status.code(),
                output: format!("{stdout}{stderr}").trim().to_string(),
            });
        }
        Ok(stdout)
    }

    /// Fail unless the engine server is recent enough
    pub fn check_version(&self) -> Result<(), ExternalToolError> {
        let version = self.run(&version_args(), None)?;
        check_server_version(version.trim())
    }

    /// Pull `reference`, retrying transient failures
    pub fn pull(&self, reference: &str, policy: &RetryPolicy) -> Result<(), ExternalToolError> {
        info!("Pulling {}", reference);
        policy.retry(
            || self.run(&pull_args(reference), None).map(|_| ()),
            |attempt, e| warn!("Pull attempt {} of {} failed: {}", attempt, reference, e),
        )
    }

    /// Load an image archive into the engine
    pub fn load(&self, archive: &Path) -> Result<(), ExternalToolError> {
        info!("Loading {}", archive.display());
        self.run(&load_args(archive), None).map(|_| ())
    }

    /// Build the Dockerfile in `dir` and tag the result
    pub fn build(&self, dir: &Path, tag: &str) -> Result<(), ExternalToolError> {
        self.run(&build_args(tag), Some(dir)).map(|_| ())
    }

    /// Save a tagged image to an archive file
    pub fn save(&self, tag: &str, output: &Path) -> Result<(), ExternalToolError> {
        self.run(&save_args(tag, output), None).map(|_| ())
    }

    /// Content-addressed id of a tagged image
    pub fn image_id(&self, tag: &str) -> Result<String, ExternalToolError> {
        let args = inspect_id_args(tag);
        let output = self.run(&args, None)?;
        parse_image_id(&output).ok_or_else(|| ExternalToolError::UnexpectedOutput {
            command: format!("{} {}", self.name, args.join(" ")),
            message: format!("expected an image id, got '{}'", output.trim()),
        })
    }

    /// Registry digest of a pulled image
    pub fn repo_digest(&self, reference: &str) -> Result<String, ExternalToolError> {
        let args = repo_digest_args(reference);
        let output = self.run(&args, None)?;
        parse_repo_digest(&output).ok_or_else(|| ExternalToolError::UnexpectedOutput {
            command: format!("{} {}", self.name, args.join(" ")),
            message: format!("expected a repository digest, got '{}'", output.trim()),
        })
    }

    /// Run a shell script in a throwaway container of `image`
    pub fn run_script(&self, image: &str, script: &str) -> Result<String, ExternalToolError> {
        self.run(&run_script_args(image, script), None)
    }

    /// Remove a tagged image
    pub fn remove_image(&self, tag: &str) -> Result<(), ExternalToolError> {
        self.run(&remove_args(tag), None).map(|_| ())
    }
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| (*a).to_string()).collect()
}

pub fn version_args() -> Vec<String> {
    to_args(&["version", "--format", "{{.Server.Version}}"])
}

pub fn build_args(tag: &str) -> Vec<String> {
    vec![
        "image".to_string(),
        "build".to_string(),
        "--no-cache".to_string(),
        format!("--tag={tag}"),
        ".".to_string(),
    ]
}

pub fn save_args(tag: &str, output: &Path) -> Vec<String> {
    vec![
        "save".to_string(),
        format!("--output={}", output.display()),
        tag.to_string(),
    ]
}

pub fn inspect_id_args(tag: &str) -> Vec<String> {
    to_args(&["inspect", "--format='{{index .Id}}'", tag])
}

pub fn repo_digest_args(reference: &str) -> Vec<String> {
    to_args(&["image", "inspect", "--format={{index .RepoDigests 0}}", reference])
}

pub fn load_args(archive: &Path) -> Vec<String> {
    vec![
        "load".to_string(),
        "--input".to_string(),
        archive.display().to_string(),
    ]
}

pub fn pull_args(reference: &str) -> Vec<String> {
    to_args(&["pull", reference])
}

pub fn run_script_args(image: &str, script: &str) -> Vec<String> {
    to_args(&["run", "--rm", "--entrypoint", "sh", image, "-c", script])
}

pub fn remove_args(tag: &str) -> Vec<String> {
    to_args(&["image", "rm", "--force", tag])
}

/// Leading numeric component of a version string
pub fn major_version(version: &str) -> Option<u32> {
    let digits: String = version
        .trim()
        .trim_start_matches('v')
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

fn check_server_version(version: &str) -> Result<(), ExternalToolError> {
    match major_version(version) {
        Some(major) if major >= defaults::MIN_ENGINE_MAJOR_VERSION => Ok(()),
        _ => Err(ExternalToolError::UnsupportedVersion {
            minimum: defaults::MIN_ENGINE_MAJOR_VERSION,
            actual: version.to_string(),
        }),
    }
}

/// Image id printed by `inspect`, with the quotes of the format removed
pub fn parse_image_id(output: &str) -> Option<String> {
    let id = output.trim().trim_matches('\'').trim();
    id.starts_with("sha256:").then(|| id.to_string())
}

/// Digest part of a `repo@sha256:...` reference
pub fn parse_repo_digest(output: &str) -> Option<String> {
    output
        .trim()
        .rsplit_once('@')
        .map(|(_, digest)| digest.to_string())
        .filter(|digest| digest.starts_with("sha256:"))
}

/// Build-file inputs derived from the base image
///
/// Repository definitions are mounted when `with_repositories` is set.
pub fn render_context(build: &CompiledBuild, with_repositories: bool) -> Result<RenderContext, StratumError> {
    let ctx = match &build.base {
        BaseImage::Registry { .. } => RenderContext::new(build.base.reference().unwrap_or_default()),
        BaseImage::Archive(path) => {
            let archive = ImageArchive::open(path)?;
            let from = archive
                .tag()
                .map(str::to_string)
                .unwrap_or_else(|| archive.image_id());
            RenderContext::new(from).with_from_comment(path.display().to_string())
        }
        BaseImage::LocalBuild(reference) => {
            RenderContext::new(reference.tag()?).with_from_comment(reference.unit.display().to_string())
        }
    };
    Ok(if with_repositories {
        ctx.with_ephemeral(EPHEMERAL_SOURCE)
    } else {
        ctx
    })
}

/// Write the Dockerfile and `.dockerignore` of a build
pub fn write_build_files(layout: &UnitLayout, build: &CompiledBuild, ctx: &RenderContext) -> Result<(), StratumError> {
    filesystem::write_file(&layout.dockerfile(), &dockerfile::render(build, ctx))?;
    filesystem::write_file(&layout.build_dir().join(".dockerignore"), dockerfile::dockerignore())?;
    Ok(())
}

/// Builds through an external container engine
pub struct DaemonBackend<'a> {
    engine: Engine,
    secrets: &'a dyn SecretProvider,
    retry: RetryPolicy,
}

impl<'a> DaemonBackend<'a> {
    pub fn new(engine: Engine, secrets: &'a dyn SecretProvider) -> Self {
        Self {
            engine,
            secrets,
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Make the base image available to the engine
    pub fn provide_base(&self, base: &BaseImage) -> Result<(), StratumError> {
        match base {
            BaseImage::Registry { .. } => {
                let reference = base.reference().unwrap_or_default();
                self.engine
                    .pull(&reference, &self.retry)
                    .map_err(|e| StratumError::in_stage("pull base image", e))
            }
            BaseImage::Archive(path) => self
                .engine
                .load(path)
                .map_err(|e| StratumError::in_stage("load base image", e)),
            BaseImage::LocalBuild(reference) => {
                reference.build_info()?;
                self.engine
                    .load(&reference.archive())
                    .map_err(|e| StratumError::in_stage("load base image", e))
            }
        }
    }

    /// Render, build and tag `build` as `tag` from the unit's build directory
    ///
    /// Repository definitions are written before and removed after the
    /// engine runs, whatever the outcome.
    pub fn build_image(&self, unit: &BuildUnit, build: &CompiledBuild, tag: &str) -> Result<(), StratumError> {
        let layout = &unit.layout;
        let with_repositories = build.uses_repositories()
            && context::write_repositories(&unit.manifest.repositories, layout, self.secrets)?;
        let result = self.render_and_build(unit, build, tag, with_repositories);
        context::clean_ephemeral(layout)?;
        result
    }

    fn render_and_build(
        &self,
        unit: &BuildUnit,
        build: &CompiledBuild,
        tag: &str,
        with_repositories: bool,
    ) -> Result<(), StratumError> {
        let layout = &unit.layout;
        let ctx = render_context(build, with_repositories)?;
        self.provide_base(&build.base)?;
        write_build_files(layout, build, &ctx)?;
        info!("Building {} with {}", tag, self.engine.name());
        self.engine
            .build(&layout.build_dir(), tag)
            .map_err(|e| StratumError::in_stage("build image", e))
    }

    /// Save `tag` to a temporary archive next to `build/image.tar`
    fn save(&self, layout: &UnitLayout, tag: &str) -> Result<NamedTempFile, StratumError> {
        let build_dir = layout.build_dir();
        let partial = tempfile::Builder::new()
            .prefix(".image")
            .suffix(".tar")
            .tempfile_in(&build_dir)
            .map_err(|e| FilesystemError::WriteFile {
                path: build_dir.clone(),
                error: e.to_string(),
            })?;
        self.engine
            .save(tag, partial.path())
            .map_err(|e| StratumError::in_stage("save image", e))?;
        Ok(partial)
    }
}

/// Move a saved archive into place
fn publish_archive(partial: NamedTempFile, target: &Path) -> Result<(), FilesystemError> {
    partial
        .persist(target)
        .map(|_| ())
        .map_err(|e| FilesystemError::WriteFile {
            path: target.to_path_buf(),
            error: e.error.to_string(),
        })
}

impl ImageBuilder for DaemonBackend<'_> {
    fn kind(&self) -> BuilderKind {
        BuilderKind::Daemon
    }

    fn build(&self, unit: &BuildUnit, build: &CompiledBuild) -> Result<BuildInfo, StratumError> {
        self.engine.check_version()?;
        let layout = &unit.layout;
        let tag = unit.tag();

        context::stage_copy_layers(build, layout)?;
        self.build_image(unit, build, &tag)?;
        let partial = self.save(layout, &tag)?;
        let image_id = self
            .engine
            .image_id(&tag)
            .map_err(|e| StratumError::in_stage("inspect image", e))?;
        publish_archive(partial, &layout.image_archive())?;
        info!("Built {} ({})", tag, image_id);
        Ok(BuildInfo::new(tag, BuilderKind::Daemon, image_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::compiler::compile;
    use crate::core::instruction::{BuildInstruction, LocalImageRef};
    use tempfile::TempDir;

    #[test]
    fn test_engine_command_lines() {
        assert_eq!(
            build_args("web:1.0").join(" "),
            "image build --no-cache --tag=web:1.0 ."
        );
        assert_eq!(
            save_args("web:1.0", Path::new("/b/image.tar")).join(" "),
            "save --output=/b/image.tar web:1.0"
        );
        assert_eq!(
            inspect_id_args("web:1.0").join(" "),
            "inspect --format='{{index .Id}}' web:1.0"
        );
        assert_eq!(pull_args("alpine:3.19"), vec!["pull", "alpine:3.19"]);
        assert_eq!(
            run_script_args("img", "rpm -qa"),
            vec!["run", "--rm", "--entrypoint", "sh", "img", "-c", "rpm -qa"]
        );
    }

    #[test]
    fn test_version_check() {
        assert_eq!(major_version("24.0.7"), Some(24));
        assert_eq!(major_version("v19.03.1"), Some(19));
        assert_eq!(major_version("unknown"), None);
        assert!(check_server_version("20.10.21").is_ok());
        assert!(matches!(
            check_server_version("18.09.0"),
            Err(ExternalToolError::UnsupportedVersion { minimum: 19, .. })
        ));
    }

    #[test]
    fn test_parse_image_id() {
        assert_eq!(
            parse_image_id("'sha256:0123abcd'\n"),
            Some("sha256:0123abcd".to_string())
        );
        assert_eq!(parse_image_id("Error: No such object"), None);
    }

    #[test]
    fn test_parse_repo_digest() {
        assert_eq!(
            parse_repo_digest("alpine@sha256:51b6\n"),
            Some("sha256:51b6".to_string())
        );
        assert_eq!(parse_repo_digest("<no value>"), None);
    }

    #[test]
    fn test_engine_environment_is_allow_listed() {
        std::env::set_var("STRATUM_TEST_ENGINE_SENTINEL", "leaked");
        let engine = Engine {
            name: "docker".to_string(),
            binary: PathBuf::from("/usr/bin/docker"),
        };
        let cmd = engine.command(&version_args());
        let envs: Vec<(String, Option<String>)> = cmd
            .get_envs()
            .map(|(k, v)| {
                (
                    k.to_string_lossy().into_owned(),
                    v.map(|v| v.to_string_lossy().into_owned()),
                )
            })
            .collect();
        std::env::remove_var("STRATUM_TEST_ENGINE_SENTINEL");

        for (key, _) in &envs {
            assert!(
                defaults::ENGINE_ENV_ALLOWLIST.contains(&key.as_str()) || key == "DOCKER_BUILDKIT",
                "unexpected variable {key}"
            );
        }
        assert!(envs.contains(&("DOCKER_BUILDKIT".to_string(), Some("1".to_string()))));
        assert!(!envs.iter().any(|(k, _)| k == "STRATUM_TEST_ENGINE_SENTINEL"));
        if let Ok(path) = std::env::var("PATH") {
            assert!(envs.contains(&("PATH".to_string(), Some(path))));
        }
    }

    #[test]
    fn test_publish_archive_replaces_target() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("image.tar");
        std::fs::write(&target, "previous").unwrap();

        let partial = NamedTempFile::new_in(dir.path()).unwrap();
        std::fs::write(partial.path(), "saved").unwrap();
        let leftover = partial.path().to_path_buf();
        drop(partial);
        assert!(!leftover.exists());
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "previous");

        let partial = NamedTempFile::new_in(dir.path()).unwrap();
        std::fs::write(partial.path(), "saved").unwrap();
        publish_archive(partial, &target).unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "saved");
    }

    #[test]
    fn test_missing_engine() {
        let err = Engine::detect("stratum-no-such-engine").unwrap_err();
        assert!(matches!(err, ExternalToolError::EngineNotFound { .. }));
    }

    #[test]
    fn test_render_context_for_local_build() {
        let dir = TempDir::new().unwrap();
        let base_unit = dir.path().join("base");
        let layout = UnitLayout::new(&base_unit);
        std::fs::create_dir_all(layout.build_dir()).unwrap();
        BuildInfo::new("base:2.0", BuilderKind::Daemon, "sha256:ff")
            .write(&layout.build_info())
            .unwrap();

        let build = compile(
            "web",
            &[BuildInstruction::FromLocalImageBuild(LocalImageRef::new(&base_unit))],
            None,
        )
        .unwrap();
        let ctx = render_context(&build, true).unwrap();
        assert_eq!(ctx.from, "base:2.0");
        assert_eq!(ctx.from_comment, Some(base_unit.display().to_string()));
        assert_eq!(ctx.ephemeral_source.as_deref(), Some("ephemeral"));
    }

    #[test]
    fn test_render_context_requires_built_sibling() {
        let dir = TempDir::new().unwrap();
        let build = compile(
            "web",
            &[BuildInstruction::FromLocalImageBuild(LocalImageRef::new(dir.path()))],
            None,
        )
        .unwrap();
        assert!(render_context(&build, false).is_err());
    }
}
