//! Build-file rendering for the daemon backend
//!
//! The layout is fixed so that tooling which lints or greps generated
//! files keeps working: header, `FROM`, maintainer, user creation,
//! package installs, `ENV`, then copy layers and run batches in
//! declaration order, followed by the image metadata.

use std::fmt::Write as _;

use crate::core::compiler::{CompiledBuild, InstallStep, Step, UserSpec};
use crate::core::instruction::{HealthCheck, Installer};

const HEADER: &str = "\
#############################
#                           #
# Auto generated Dockerfile #
#                           #
#############################
";

const CONTINUATION: &str = " && \\\n    ";

/// Where the unit's ephemeral files are mounted during `RUN`
pub const EPHEMERAL_MOUNT: &str = "/mnt/ephemeral";

/// Inputs the renderer cannot derive from the compiled build
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderContext {
    /// Reference written after `FROM`
    pub from: String,
    /// Comment line written above `FROM`
    pub from_comment: Option<String>,
    /// Ephemeral directory name relative to the build directory, if any
    pub ephemeral_source: Option<String>,
}

impl RenderContext {
    pub fn new(from: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_from_comment(mut self, comment: impl Into<String>) -> Self {
        self.from_comment = Some(comment.into());
        self
    }

    #[must_use]
    pub fn with_ephemeral(mut self, source: impl Into<String>) -> Self {
        self.ephemeral_source = Some(source.into());
        self
    }

    fn mount(&self) -> Option<String> {
        self.ephemeral_source
            .as_ref()
            .map(|source| format!("--mount=type=bind,target={EPHEMERAL_MOUNT},source={source} "))
    }
}

/// Contents of `.dockerignore` next to the rendered file
pub fn dockerignore() -> &'static str {
    "**\n!context\n!ephemeral\n"
}

/// Render the build-file
pub fn render(build: &CompiledBuild, ctx: &RenderContext) -> String {
    let mut out = String::from(HEADER);
    out.push('\n');

    if let Some(comment) = &ctx.from_comment {
        let _ = writeln!(out, "# {comment}");
    }
    let _ = writeln!(out, "FROM {}", ctx.from);

    if let Some(maintainer) = &build.maintainer {
        let _ = writeln!(out, "LABEL maintainer={}", quote(maintainer));
    }

    for user in &build.users {
        out.push_str(&create_user(user));
        out.push('\n');
    }

    for step in merge_installs(&build.installs) {
        let mount = if step.repositories.is_empty() {
            String::new()
        } else {
            ctx.mount().unwrap_or_default()
        };
        let commands = install_commands(&step);
        let _ = writeln!(out, "RUN {mount}{}", commands.join(CONTINUATION));
    }

    for (key, value) in &build.env {
        let _ = writeln!(out, "ENV {key}={}", quote(value));
    }

    for step in &build.steps {
        match step {
            Step::Copy(ordinal) => {
                if let Some(layer) = build.copy_layer(*ordinal) {
                    let chown = layer
                        .owner
                        .as_ref()
                        .map(|o| format!("--chown={o} "))
                        .unwrap_or_default();
                    let _ = writeln!(out, "COPY {chown}context/layer{ordinal} /");
                }
            }
            Step::Run(index) => {
                if let Some(batch) = build.run_batch(*index) {
                    let mount = if batch.with_repositories {
                        ctx.mount().unwrap_or_default()
                    } else {
                        String::new()
                    };
                    let _ = writeln!(out, "RUN {mount}{}", batch.commands.join(CONTINUATION));
                }
            }
        }
    }

    if let Some(user) = &build.user {
        let _ = writeln!(out, "USER {user}");
    }
    if !build.entrypoint.is_empty() {
        let _ = writeln!(out, "ENTRYPOINT {}", exec_form(&build.entrypoint));
    }
    if !build.cmd.is_empty() {
        let _ = writeln!(out, "CMD {}", exec_form(&build.cmd));
    }
    if let Some(check) = &build.healthcheck {
        let _ = writeln!(out, "{}", healthcheck(check));
    }
    for (key, value) in &build.labels {
        let _ = writeln!(out, "LABEL {}={}", quote_key(key), quote(value));
    }
    if let Some(workdir) = &build.workdir {
        let _ = writeln!(out, "WORKDIR {workdir}");
    }
    if !build.exposed.is_empty() {
        let ports: Vec<String> = build
            .exposed
            .iter()
            .map(|(port, protocol)| format!("{port}/{protocol}"))
            .collect();
        let _ = writeln!(out, "EXPOSE {}", ports.join(" "));
    }
    out
}

/// Double quoted, JSON escaped string
fn quote(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("\"{value}\""))
}

fn quote_key(key: &str) -> String {
    if key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/'))
    {
        key.to_string()
    } else {
        quote(key)
    }
}

/// `["a", "b"]`
fn exec_form(args: &[String]) -> String {
    let quoted: Vec<String> = args.iter().map(|a| quote(a)).collect();
    format!("[{}]", quoted.join(", "))
}

fn healthcheck(check: &HealthCheck) -> String {
    let mut line = String::from("HEALTHCHECK ");
    if let Some(interval) = &check.interval {
        let _ = write!(line, "--interval={interval} ");
    }
    if let Some(timeout) = &check.timeout {
        let _ = write!(line, "--timeout={timeout} ");
    }
    if let Some(start_period) = &check.start_period {
        let _ = write!(line, "--start-period={start_period} ");
    }
    if let Some(retries) = check.retries {
        let _ = write!(line, "--retries={retries} ");
    }
    let _ = write!(line, "CMD {}", check.cmd);
    line
}

/// User creation that works on both regular and BusyBox based images
fn create_user(user: &UserSpec) -> String {
    let UserSpec {
        username,
        group,
        uid,
        gid,
    } = user;
    format!(
        "RUN if ! command -v busybox >/dev/null 2>&1; then \\\n       \
         groupadd -g {gid} {group} ; \\\n       \
         useradd -r -s /bin/false -g {gid} --uid {uid} {username} ; \\\n   \
         else \\\n       \
         addgroup --gid {gid} {group} ; \\\n       \
         adduser -S -s /bin/false --ingroup {group} -H -D -u {uid} {username} ; \\\n   \
         fi"
    )
}

/// One install step per package manager, in order of first use
fn merge_installs(installs: &[InstallStep]) -> Vec<InstallStep> {
    let mut merged: Vec<InstallStep> = Vec::new();
    for step in installs {
        match merged.iter_mut().find(|m| m.installer == step.installer) {
            Some(existing) => {
                for repo in &step.repositories {
                    if !existing.repositories.contains(repo) {
                        existing.repositories.push(repo.clone());
                    }
                }
                for token in &step.tokens {
                    if !existing.tokens.contains(token) {
                        existing.tokens.push(token.clone());
                    }
                }
                existing.pinned.extend(step.pinned.iter().cloned());
            }
            None => merged.push(step.clone()),
        }
    }
    merged
}

/// Shell statements installing one step's packages
///
/// Repository definitions are read from the ephemeral mount only when the
/// step names repositories. Every family ends with its cache cleanup.
pub fn install_commands(step: &InstallStep) -> Vec<String> {
    let repos = format!("{EPHEMERAL_MOUNT}/repos");
    let with_repos = !step.repositories.is_empty();
    let packages = step.tokens.join(" ");
    match step.installer {
        Installer::Yum => {
            let opts = if with_repos {
                format!(" --setopt=reposdir=/etc/yum.repos.d,{repos}")
            } else {
                String::new()
            };
            vec![
                format!("yum install -y{opts} {packages}"),
                "yum clean all".to_string(),
                "rm -rf /var/cache/yum".to_string(),
            ]
        }
        Installer::Apt => {
            let opts = if with_repos {
                format!(" -o Dir::Etc::sourceparts={repos}")
            } else {
                String::new()
            };
            vec![
                "export DEBIAN_FRONTEND=noninteractive".to_string(),
                format!("apt-get update{opts}"),
                format!("apt-get install -y{opts} {packages}"),
                "apt-get clean".to_string(),
                "rm -rf /var/lib/apt/lists/* /tmp/* /var/tmp/*".to_string(),
            ]
        }
        Installer::Apk => {
            let opts = if with_repos {
                format!(" --repositories-file {repos}/repositories")
            } else {
                String::new()
            };
            vec![
                format!("apk update{opts}"),
                format!("apk add{opts} {packages}"),
                "rm -rf /var/cache/apk/*".to_string(),
            ]
        }
    }
}
