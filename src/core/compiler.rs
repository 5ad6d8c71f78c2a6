//! Layer compiler
//!
//! Partitions an ordered instruction list into the shape both backends
//! consume: a base image, copy layers keyed by ordinal, shell command
//! batches, package installs and image metadata. Nothing is executed here.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use tracing::debug;

use crate::core::instruction::{
    image_reference, BuildInstruction, HealthCheck, Installer, LocalImageRef, PackageRequest,
    Protocol,
};
use crate::core::lock::ArchLock;
use crate::core::package::PinnedPackage;
use crate::core::resolver::PackageResolver;
use crate::error::{ConfigError, StratumError};

/// Base image of a build
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseImage {
    /// Registry image
    Registry {
        image: String,
        version: String,
        digest: Option<String>,
    },
    /// Image archive on disk
    Archive(PathBuf),
    /// Output of another build unit
    LocalBuild(LocalImageRef),
}

impl BaseImage {
    /// Registry reference, for registry bases only
    pub fn reference(&self) -> Option<String> {
        match self {
            Self::Registry {
                image,
                version,
                digest,
            } => Some(image_reference(image, version, digest.as_deref())),
            _ => None,
        }
    }
}

/// Files copied into the image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopySource {
    /// Source file or directory
    pub from: PathBuf,
    /// Absolute destination directory in the image
    pub into: String,
}

/// One filesystem layer built from every copy sharing an ordinal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyLayer {
    pub ordinal: u32,
    pub sources: Vec<CopySource>,
    /// `user[:group]` applied to everything in the layer
    pub owner: Option<String>,
}

/// Shell commands executed as one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunBatch {
    pub commands: Vec<String>,
    /// Whether the unit's repository definitions are mounted
    pub with_repositories: bool,
}

impl RunBatch {
    /// Commands joined so that any failure aborts the batch
    pub fn script(&self) -> String {
        self.commands.join(" && ")
    }
}

/// User and group creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSpec {
    pub username: String,
    pub group: String,
    pub uid: u32,
    pub gid: u32,
}

/// Packages installed with one package manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallStep {
    pub installer: Installer,
    pub repositories: Vec<String>,
    /// Pins, empty when compiled without a resolver
    pub pinned: Vec<PinnedPackage>,
    /// Arguments handed to the package manager
    pub tokens: Vec<String>,
}

/// Layer or batch in declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Copy layer with this ordinal
    Copy(u32),
    /// Index into the run batches
    Run(usize),
}

/// Result of compiling a build unit's instructions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledBuild {
    pub base: BaseImage,
    pub maintainer: Option<String>,
    pub users: Vec<UserSpec>,
    pub installs: Vec<InstallStep>,
    pub env: Vec<(String, String)>,
    pub steps: Vec<Step>,
    pub user: Option<String>,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub healthcheck: Option<HealthCheck>,
    pub labels: Vec<(String, String)>,
    pub workdir: Option<String>,
    pub exposed: Vec<(u16, Protocol)>,
    copy_layers: BTreeMap<u32, CopyLayer>,
    run_batches: Vec<RunBatch>,
}

impl CompiledBuild {
    /// Visit every copy layer in ordinal order
    pub fn for_each_copy_layer<F>(&self, mut f: F) -> Result<(), StratumError>
    where
        F: FnMut(&CopyLayer) -> Result<(), StratumError>,
    {
        self.copy_layers.values().try_for_each(|layer| f(layer))
    }

    /// Visit every run batch in declaration order
    pub fn for_each_run_layer<F>(&self, mut f: F) -> Result<(), StratumError>
    where
        F: FnMut(&RunBatch) -> Result<(), StratumError>,
    {
        self.run_batches.iter().try_for_each(|batch| f(batch))
    }

    pub fn copy_layer(&self, ordinal: u32) -> Option<&CopyLayer> {
        self.copy_layers.get(&ordinal)
    }

    pub fn run_batch(&self, index: usize) -> Option<&RunBatch> {
        self.run_batches.get(index)
    }

    pub fn copy_layers(&self) -> impl Iterator<Item = &CopyLayer> {
        self.copy_layers.values()
    }

    pub fn run_batches(&self) -> &[RunBatch] {
        &self.run_batches
    }

    /// Whether any step needs the unit's repository definitions
    pub fn uses_repositories(&self) -> bool {
        self.installs.iter().any(|i| !i.repositories.is_empty())
            || self.run_batches.iter().any(|b| b.with_repositories)
    }

    /// Instructions that need a shell inside the image
    pub fn shell_steps(&self) -> Vec<&'static str> {
        let mut steps = Vec::new();
        if !self.users.is_empty() {
            steps.push("create_user");
        }
        if !self.installs.is_empty() {
            steps.push("install");
        }
        if self.run_batches.iter().any(|b| !b.with_repositories) {
            steps.push("run");
        }
        if self.run_batches.iter().any(|b| b.with_repositories) {
            steps.push("repo_config_run");
        }
        steps
    }
}

/// Compile instructions of the unit `unit`
///
/// Install requests are pinned through `resolver`. Without one, requests
/// are passed to the package manager as written.
pub fn compile(
    unit: &str,
    instructions: &[BuildInstruction],
    resolver: Option<&PackageResolver<'_>>,
) -> Result<CompiledBuild, StratumError> {
    if instructions.is_empty() {
        return Err(ConfigError::EmptyInstructions {
            unit: unit.to_string(),
        }
        .into());
    }

    let mut base = None;
    let mut build = CompiledBuild {
        base: BaseImage::Archive(PathBuf::new()),
        maintainer: None,
        users: Vec::new(),
        installs: Vec::new(),
        env: Vec::new(),
        steps: Vec::new(),
        user: None,
        entrypoint: Vec::new(),
        cmd: Vec::new(),
        healthcheck: None,
        labels: Vec::new(),
        workdir: None,
        exposed: Vec::new(),
        copy_layers: BTreeMap::new(),
        run_batches: Vec::new(),
    };

    for instruction in instructions {
        match instruction {
            BuildInstruction::From {
                image,
                version,
                digest,
            } => {
                let registry = match resolver.and_then(PackageResolver::lock) {
                    Some(lock) => locked_base(image, version, digest.as_deref(), lock)?,
                    None => BaseImage::Registry {
                        image: image.clone(),
                        version: version.clone(),
                        digest: digest.clone(),
                    },
                };
                set_base(&mut base, unit, registry)?;
            }
            BuildInstruction::FromLocalArchive { archive } => {
                set_base(&mut base, unit, BaseImage::Archive(archive.clone()))?;
            }
            BuildInstruction::FromLocalImageBuild(reference) => {
                set_base(&mut base, unit, BaseImage::LocalBuild(reference.clone()))?;
            }
            BuildInstruction::Copy {
                from,
                into,
                layer,
                owner,
            } => add_copy(&mut build, *layer, from, into, owner.as_ref())?,
            BuildInstruction::Run { commands } => add_batch(&mut build, commands, false),
            BuildInstruction::RepoConfigRun { commands } => add_batch(&mut build, commands, true),
            BuildInstruction::Env { key, value } => upsert(&mut build.env, key, value),
            BuildInstruction::Label { key, value } | BuildInstruction::ChangingLabel { key, value } => {
                upsert(&mut build.labels, key, value);
            }
            BuildInstruction::Maintainer { name, email } => {
                build.maintainer = Some(format!("{name} <{email}>"));
            }
            BuildInstruction::Workdir { path } => build.workdir = Some(path.clone()),
            BuildInstruction::Entrypoint { args } => build.entrypoint = args.clone(),
            BuildInstruction::Cmd { args } => build.cmd = args.clone(),
            BuildInstruction::Expose { port, protocol } => {
                if !build.exposed.contains(&(*port, *protocol)) {
                    build.exposed.push((*port, *protocol));
                }
            }
            BuildInstruction::CreateUser {
                username,
                group,
                uid,
                gid,
            } => build.users.push(UserSpec {
                username: username.clone(),
                group: group.clone(),
                uid: *uid,
                gid: *gid,
            }),
            BuildInstruction::SetUser { username } => build.user = Some(username.clone()),
            BuildInstruction::Install {
                installer,
                repositories,
                packages,
            } => {
                let step = install_step(*installer, repositories, packages, resolver)?;
                build.installs.push(step);
            }
            BuildInstruction::HealthCheck(check) => build.healthcheck = Some(check.clone()),
        }
    }

    build.base = base.ok_or_else(|| ConfigError::MissingBase {
        unit: unit.to_string(),
    })?;
    if let Some(resolver) = resolver {
        if let Some(step) = locked_only_step(instructions, &build.installs, resolver) {
            build.installs.push(step);
        }
    }
    debug!(
        "Compiled {}: {} copy layers, {} run batches, {} installs",
        unit,
        build.copy_layers.len(),
        build.run_batches.len(),
        build.installs.len()
    );
    Ok(build)
}

/// Registry base pinned to the digest recorded in the lock entry
///
/// A digest declared in the manifest must be the locked one.
fn locked_base(
    image: &str,
    version: &str,
    digest: Option<&str>,
    lock: &ArchLock,
) -> Result<BaseImage, ConfigError> {
    let declared = image_reference(image, version, digest);
    let Some(locked) = &lock.base_image else {
        return Err(ConfigError::LockedBaseMissing { reference: declared });
    };
    let same_image = locked.repository == image && locked.tag == version;
    if !same_image || digest.is_some_and(|d| d != locked.digest) {
        return Err(ConfigError::LockedBaseMismatch {
            declared,
            locked: locked.reference(),
        });
    }
    Ok(BaseImage::Registry {
        image: image.to_string(),
        version: version.to_string(),
        digest: Some(locked.digest.clone()),
    })
}

/// Install of every locked package no instruction asks for
///
/// Runs with the package manager and repositories of the first install.
fn locked_only_step(
    instructions: &[BuildInstruction],
    installs: &[InstallStep],
    resolver: &PackageResolver<'_>,
) -> Option<InstallStep> {
    let first = installs.first()?;
    let requested: HashSet<&str> = instructions
        .iter()
        .filter_map(|i| match i {
            BuildInstruction::Install { packages, .. } => Some(packages),
            _ => None,
        })
        .flatten()
        .map(|p| p.name.as_str())
        .collect();
    let pinned = resolver.unrequested(&requested);
    if pinned.is_empty() {
        return None;
    }

    let mut repositories: Vec<String> = Vec::new();
    for step in installs.iter().filter(|s| s.installer == first.installer) {
        for repository in &step.repositories {
            if !repositories.contains(repository) {
                repositories.push(repository.clone());
            }
        }
    }
    debug!("Pinning {} locked packages not requested by the unit", pinned.len());
    Some(InstallStep {
        installer: first.installer,
        repositories,
        tokens: pinned.iter().map(|p| p.install_token(first.installer)).collect(),
        pinned,
    })
}

fn set_base(slot: &mut Option<BaseImage>, unit: &str, base: BaseImage) -> Result<(), ConfigError> {
    if slot.is_some() {
        return Err(ConfigError::MultipleBases {
            unit: unit.to_string(),
        });
    }
    *slot = Some(base);
    Ok(())
}

fn add_copy(
    build: &mut CompiledBuild,
    ordinal: u32,
    from: &std::path::Path,
    into: &str,
    owner: Option<&String>,
) -> Result<(), ConfigError> {
    let source = CopySource {
        from: from.to_path_buf(),
        into: into.to_string(),
    };
    match build.copy_layers.get_mut(&ordinal) {
        Some(layer) => {
            if layer.owner.as_ref() != owner {
                let describe = |o: Option<&String>| o.cloned().unwrap_or_else(|| "<none>".to_string());
                return Err(ConfigError::ConflictingLayerOwner {
                    ordinal,
                    first: describe(layer.owner.as_ref()),
                    second: describe(owner),
                });
            }
            layer.sources.push(source);
        }
        None => {
            build.copy_layers.insert(
                ordinal,
                CopyLayer {
                    ordinal,
                    sources: vec![source],
                    owner: owner.cloned(),
                },
            );
            build.steps.push(Step::Copy(ordinal));
        }
    }
    Ok(())
}

fn add_batch(build: &mut CompiledBuild, commands: &[String], with_repositories: bool) {
    if commands.is_empty() {
        return;
    }
    build.steps.push(Step::Run(build.run_batches.len()));
    build.run_batches.push(RunBatch {
        commands: commands.to_vec(),
        with_repositories,
    });
}

fn upsert(entries: &mut Vec<(String, String)>, key: &str, value: &str) {
    match entries.iter_mut().find(|(k, _)| k == key) {
        Some(entry) => entry.1 = value.to_string(),
        None => entries.push((key.to_string(), value.to_string())),
    }
}

fn install_step(
    installer: Installer,
    repositories: &[String],
    packages: &[PackageRequest],
    resolver: Option<&PackageResolver<'_>>,
) -> Result<InstallStep, StratumError> {
    let (pinned, tokens) = match resolver {
        Some(resolver) => {
            let pinned = resolver.resolve(packages)?;
            let tokens = pinned.iter().map(|p| p.install_token(installer)).collect();
            (pinned, tokens)
        }
        None => {
            let tokens = packages
                .iter()
                .map(|request| match (&request.version, installer) {
                    (None, _) => request.name.clone(),
                    (Some(v), Installer::Yum) => format!("{}-{}", request.name, v),
                    (Some(v), Installer::Apt | Installer::Apk) => format!("{}={}", request.name, v),
                })
                .collect();
            (Vec::new(), tokens)
        }
    };
    Ok(InstallStep {
        installer,
        repositories: repositories.to_vec(),
        pinned,
        tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::lock::{Architecture, UnchangingContainerReference};
    use crate::core::package::Packages;

    fn from() -> BuildInstruction {
        BuildInstruction::From {
            image: "ubuntu".to_string(),
            version: "22.04".to_string(),
            digest: None,
        }
    }

    fn copy(layer: u32, from: &str, owner: Option<&str>) -> BuildInstruction {
        BuildInstruction::Copy {
            from: PathBuf::from(from),
            into: "/app".to_string(),
            layer,
            owner: owner.map(str::to_string),
        }
    }

    fn run(commands: &[&str]) -> BuildInstruction {
        BuildInstruction::Run {
            commands: commands.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[test]
    fn test_compile_rejects_empty() {
        let err = compile("web", &[], None).unwrap_err();
        assert!(matches!(
            err,
            StratumError::Config(ConfigError::EmptyInstructions { .. })
        ));
    }

    #[test]
    fn test_compile_requires_base() {
        let err = compile("web", &[run(&["true"])], None).unwrap_err();
        assert!(matches!(err, StratumError::Config(ConfigError::MissingBase { .. })));
    }

    #[test]
    fn test_copies_grouped_by_ordinal() {
        let build = compile(
            "web",
            &[
                from(),
                copy(2, "lib", None),
                copy(1, "bin", None),
                copy(2, "share", None),
            ],
            None,
        )
        .unwrap();

        let mut seen = Vec::new();
        build
            .for_each_copy_layer(|layer| {
                seen.push((layer.ordinal, layer.sources.len()));
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![(1, 1), (2, 2)]);
        assert_eq!(build.steps, vec![Step::Copy(2), Step::Copy(1)]);
    }

    #[test]
    fn test_conflicting_owner() {
        let err = compile(
            "web",
            &[from(), copy(1, "a", Some("1000:1000")), copy(1, "b", Some("0:0"))],
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("conflicting owners"));

        assert!(compile(
            "web",
            &[from(), copy(1, "a", Some("app")), copy(1, "b", Some("app"))],
            None,
        )
        .is_ok());
    }

    #[test]
    fn test_run_batches_joined() {
        let build = compile(
            "web",
            &[
                from(),
                run(&["apt-get update", "apt-get install -y jq"]),
                BuildInstruction::RepoConfigRun {
                    commands: vec!["cat /etc/os-release".to_string()],
                },
            ],
            None,
        )
        .unwrap();
        let mut scripts = Vec::new();
        build
            .for_each_run_layer(|batch| {
                scripts.push((batch.script(), batch.with_repositories));
                Ok(())
            })
            .unwrap();
        assert_eq!(
            scripts,
            vec![
                ("apt-get update && apt-get install -y jq".to_string(), false),
                ("cat /etc/os-release".to_string(), true),
            ]
        );
        assert!(build.uses_repositories());
    }

    #[test]
    fn test_metadata_last_wins() {
        let build = compile(
            "web",
            &[
                from(),
                BuildInstruction::Label {
                    key: "a".into(),
                    value: "1".into(),
                },
                BuildInstruction::ChangingLabel {
                    key: "a".into(),
                    value: "2".into(),
                },
                BuildInstruction::Cmd {
                    args: vec!["old".into()],
                },
                BuildInstruction::Cmd {
                    args: vec!["new".into()],
                },
                BuildInstruction::Expose {
                    port: 80,
                    protocol: Protocol::Tcp,
                },
                BuildInstruction::Expose {
                    port: 80,
                    protocol: Protocol::Tcp,
                },
            ],
            None,
        )
        .unwrap();
        assert_eq!(build.labels, vec![("a".to_string(), "2".to_string())]);
        assert_eq!(build.cmd, vec!["new".to_string()]);
        assert_eq!(build.exposed.len(), 1);
    }

    #[test]
    fn test_install_pinned_from_lock() {
        let lock = ArchLock::new(
            Packages::new(vec![PinnedPackage::new("jq", "1.6", "2", "amd64")]).unwrap(),
            Some(UnchangingContainerReference::new("ubuntu", "22.04", "sha256:aaa")),
        );
        let resolver = PackageResolver::new(Architecture::X86_64).with_lock(Some(&lock));
        let build = compile(
            "web",
            &[
                from(),
                BuildInstruction::Install {
                    installer: Installer::Apt,
                    repositories: vec![],
                    packages: vec![PackageRequest::any("jq")],
                },
            ],
            Some(&resolver),
        )
        .unwrap();
        assert_eq!(build.installs[0].tokens, vec!["jq=1.6-2".to_string()]);
        assert_eq!(
            build.base.reference().as_deref(),
            Some("ubuntu:22.04@sha256:aaa")
        );
    }

    fn jq_install(repositories: &[&str]) -> BuildInstruction {
        BuildInstruction::Install {
            installer: Installer::Yum,
            repositories: repositories.iter().map(|r| r.to_string()).collect(),
            packages: vec![PackageRequest::any("jq")],
        }
    }

    fn el9_lock(base: Option<UnchangingContainerReference>) -> ArchLock {
        ArchLock::new(
            Packages::new(vec![
                PinnedPackage::new("jq", "1.6", "15.el9", "x86_64"),
                PinnedPackage::new("oniguruma", "6.9.6", "1.el9.5", "x86_64"),
            ])
            .unwrap(),
            base,
        )
    }

    #[test]
    fn test_locked_packages_not_requested_are_installed() {
        let lock = el9_lock(Some(UnchangingContainerReference::new("ubuntu", "22.04", "sha256:aaa")));
        let resolver = PackageResolver::new(Architecture::X86_64).with_lock(Some(&lock));
        let build = compile("web", &[from(), jq_install(&["internal"])], Some(&resolver)).unwrap();

        assert_eq!(build.installs.len(), 2);
        assert_eq!(build.installs[0].tokens, vec!["jq-1.6-15.el9.x86_64"]);
        assert_eq!(build.installs[1].tokens, vec!["oniguruma-6.9.6-1.el9.5.x86_64"]);
        assert_eq!(build.installs[1].repositories, vec!["internal".to_string()]);

        let unpinned = compile("web", &[from(), jq_install(&[])], None).unwrap();
        assert_eq!(unpinned.installs.len(), 1);
    }

    #[test]
    fn test_locked_base_required() {
        let lock = el9_lock(None);
        let resolver = PackageResolver::new(Architecture::X86_64).with_lock(Some(&lock));
        let err = compile("web", &[from(), jq_install(&[])], Some(&resolver)).unwrap_err();
        assert!(matches!(
            err,
            StratumError::Config(ConfigError::LockedBaseMissing { ref reference }) if reference == "ubuntu:22.04"
        ));
    }

    #[test]
    fn test_declared_digest_must_match_lock() {
        let lock = el9_lock(Some(UnchangingContainerReference::new("ubuntu", "22.04", "sha256:aaa")));
        let resolver = PackageResolver::new(Architecture::X86_64).with_lock(Some(&lock));
        let pinned_from = |digest: &str| BuildInstruction::From {
            image: "ubuntu".to_string(),
            version: "22.04".to_string(),
            digest: Some(digest.to_string()),
        };

        let err = compile("web", &[pinned_from("sha256:bbb")], Some(&resolver)).unwrap_err();
        assert!(matches!(
            err,
            StratumError::Config(ConfigError::LockedBaseMismatch { .. })
        ));
        let build = compile("web", &[pinned_from("sha256:aaa")], Some(&resolver)).unwrap();
        assert_eq!(build.base.reference().as_deref(), Some("ubuntu:22.04@sha256:aaa"));
    }

    #[test]
    fn test_install_unpinned() {
        let build = compile(
            "web",
            &[
                from(),
                BuildInstruction::Install {
                    installer: Installer::Yum,
                    repositories: vec![],
                    packages: vec![PackageRequest::any("jq"), PackageRequest::exact("curl", "7.61.1")],
                },
            ],
            None,
        )
        .unwrap();
        assert_eq!(build.installs[0].tokens, vec!["jq", "curl-7.61.1"]);
        assert!(build.installs[0].pinned.is_empty());
        assert_eq!(build.shell_steps(), vec!["install"]);
    }
}
