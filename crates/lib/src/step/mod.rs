//! Structured job steps.
//!
//! A job is an ordered list of typed steps. Steps are validated against the
//! job's declared variables before they are serialized to a backend script,
//! and the same steps drive the local executor.
//!
//! Step fields may carry placeholders (see [`crate::placeholder`]). Fields
//! are either *shell* fields, which only ever become shell text, or *native*
//! fields, which the local executor resolves in-process. Secrets may only be
//! referenced from shell fields, where they stay environment references.

mod job;
pub(crate) mod shell;

pub use job::*;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::deploy::{CollisionPolicy, ContainerBinding, PR_CREATE_ATTEMPTS};
use crate::placeholder::{self, Placeholder, PlaceholderError, Resolver, ScriptResolver, TAG_VAR};
use crate::revision::SHORT_TAG_LEN;
use shell::{dquote, squote};

/// Errors raised while validating or rendering steps.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
  #[error("{step}: field '{field}' is empty")]
  EmptyField { step: &'static str, field: &'static str },

  #[error("{step}: field '{field}': {source}")]
  Placeholder {
    step: &'static str,
    field: &'static str,
    #[source]
    source: PlaceholderError,
  },

  #[error("{step}: variable '{name}' is not declared on the job")]
  UndeclaredVar { step: &'static str, name: String },

  #[error("{step}: secret '{name}' is not declared as a secret on the job")]
  UndeclaredSecret { step: &'static str, name: String },

  #[error("{step}: field '{field}' references secret '{name}' but is not shell text")]
  SecretInNativeField {
    step: &'static str,
    field: &'static str,
    name: String,
  },

  #[error("invalid branch name '{branch}': {reason}")]
  InvalidBranch { branch: String, reason: &'static str },

  #[error("invalid variable name '{0}'")]
  InvalidVariable(String),

  #[error("variable '{0}' is reserved and set by deckhand")]
  ReservedVariable(String),

  #[error("step {step} ({phase}) cannot follow a step in phase {previous}")]
  PhaseOrder {
    step: &'static str,
    phase: Phase,
    previous: Phase,
  },

  #[error("job '{0}' has no steps")]
  NoSteps(String),
}

/// Backend build phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
  Install,
  PreBuild,
  Build,
  PostBuild,
}

impl Phase {
  pub fn as_str(&self) -> &'static str {
    match self {
      Phase::Install => "install",
      Phase::PreBuild => "pre_build",
      Phase::Build => "build",
      Phase::PostBuild => "post_build",
    }
  }
}

impl std::fmt::Display for Phase {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

fn default_run_phase() -> Phase {
  Phase::Build
}

/// A single typed job step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
  /// Authenticate the docker client against the image registry.
  RegistryLogin { registry: String, region: String },

  /// Derive the short image tag from the source revision.
  DeriveTag,

  DockerBuild {
    dockerfile: String,
    image: String,
    context: String,
  },

  DockerTag { source: String, target: String },

  DockerPush { image: String },

  /// Install the SSH key held in the secret variable `secret`.
  InstallSshKey { secret: String, host: String },

  GitIdentity { name: String, email: String },

  /// Clone `url` into `dir`, or refresh an existing clone, and check out
  /// the remote `base`.
  GitClone { url: String, dir: String, base: String },

  CheckoutBranch {
    dir: String,
    branch: String,
    policy: CollisionPolicy,
  },

  /// Rewrite the tag of each bound container in the deployment descriptor.
  RewriteDescriptor {
    dir: String,
    path: String,
    registry: String,
    bindings: Vec<ContainerBinding>,
  },

  Commit {
    dir: String,
    paths: Vec<String>,
    message: String,
  },

  PushBranch {
    dir: String,
    branch: String,
    policy: CollisionPolicy,
  },

  /// Open a pull request unless one is already open for `head`.
  /// `token` names the secret variable holding the API token.
  OpenPullRequest {
    repo: String,
    base: String,
    head: String,
    title: String,
    token: String,
  },

  /// A custom shell command.
  Run {
    command: String,
    #[serde(default = "default_run_phase")]
    phase: Phase,
  },
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FieldKind {
  Shell,
  Native,
}

impl Step {
  pub fn name(&self) -> &'static str {
    match self {
      Step::RegistryLogin { .. } => "registry_login",
      Step::DeriveTag => "derive_tag",
      Step::DockerBuild { .. } => "docker_build",
      Step::DockerTag { .. } => "docker_tag",
      Step::DockerPush { .. } => "docker_push",
      Step::InstallSshKey { .. } => "install_ssh_key",
      Step::GitIdentity { .. } => "git_identity",
      Step::GitClone { .. } => "git_clone",
      Step::CheckoutBranch { .. } => "checkout_branch",
      Step::RewriteDescriptor { .. } => "rewrite_descriptor",
      Step::Commit { .. } => "commit",
      Step::PushBranch { .. } => "push_branch",
      Step::OpenPullRequest { .. } => "open_pull_request",
      Step::Run { .. } => "run",
    }
  }

  pub fn phase(&self) -> Phase {
    match self {
      Step::InstallSshKey { .. } | Step::GitIdentity { .. } => Phase::Install,
      Step::RegistryLogin { .. } | Step::DeriveTag | Step::GitClone { .. } | Step::CheckoutBranch { .. } => {
        Phase::PreBuild
      }
      Step::DockerBuild { .. } | Step::DockerTag { .. } | Step::RewriteDescriptor { .. } | Step::Commit { .. } => {
        Phase::Build
      }
      Step::DockerPush { .. } | Step::PushBranch { .. } | Step::OpenPullRequest { .. } => Phase::PostBuild,
      Step::Run { phase, .. } => *phase,
    }
  }

  /// Whether the step runs as shell text in the local executor.
  pub fn is_shell(&self) -> bool {
    matches!(
      self,
      Step::RegistryLogin { .. }
        | Step::DockerBuild { .. }
        | Step::DockerTag { .. }
        | Step::DockerPush { .. }
        | Step::Run { .. }
    )
  }

  fn fields(&self) -> Vec<(&'static str, &String, FieldKind)> {
    use FieldKind::{Native, Shell};
    match self {
      Step::RegistryLogin { registry, region } => vec![("registry", registry, Shell), ("region", region, Shell)],
      Step::DeriveTag => vec![],
      Step::DockerBuild {
        dockerfile,
        image,
        context,
      } => vec![
        ("dockerfile", dockerfile, Shell),
        ("image", image, Shell),
        ("context", context, Shell),
      ],
      Step::DockerTag { source, target } => vec![("source", source, Shell), ("target", target, Shell)],
      Step::DockerPush { image } => vec![("image", image, Shell)],
      Step::InstallSshKey { host, .. } => vec![("host", host, Native)],
      Step::GitIdentity { name, email } => vec![("name", name, Native), ("email", email, Native)],
      Step::GitClone { url, dir, base } => vec![("url", url, Native), ("dir", dir, Native), ("base", base, Native)],
      Step::CheckoutBranch { dir, branch, .. } | Step::PushBranch { dir, branch, .. } => {
        vec![("dir", dir, Native), ("branch", branch, Native)]
      }
      Step::RewriteDescriptor {
        dir, path, registry, ..
      } => vec![("dir", dir, Native), ("path", path, Native), ("registry", registry, Native)],
      Step::Commit { dir, message, .. } => vec![("dir", dir, Native), ("message", message, Native)],
      Step::OpenPullRequest {
        repo,
        base,
        head,
        title,
        ..
      } => vec![
        ("repo", repo, Native),
        ("base", base, Native),
        ("head", head, Native),
        ("title", title, Native),
      ],
      Step::Run { command, .. } => vec![("command", command, Shell)],
    }
  }

  /// Validate the step against the job's declared variables.
  pub fn validate(&self, vars: &JobVariables) -> Result<(), StepError> {
    let step = self.name();

    for (field, value, kind) in self.fields() {
      if value.trim().is_empty() {
        return Err(StepError::EmptyField { step, field });
      }

      let refs = placeholder::references(value).map_err(|source| StepError::Placeholder { step, field, source })?;
      for r in refs {
        match r {
          Placeholder::Var(name) => {
            if !matches!(vars.get(&name), Some(EnvVar::Plain(_))) {
              return Err(StepError::UndeclaredVar { step, name });
            }
          }
          Placeholder::Secret(name) => {
            if kind == FieldKind::Native {
              return Err(StepError::SecretInNativeField { step, field, name });
            }
            if !matches!(vars.get(&name), Some(EnvVar::Secret(_))) {
              return Err(StepError::UndeclaredSecret { step, name });
            }
          }
          Placeholder::Tag | Placeholder::Revision => {}
        }
      }
    }

    match self {
      Step::InstallSshKey { secret: name, .. } | Step::OpenPullRequest { token: name, .. } => {
        if !matches!(vars.get(name), Some(EnvVar::Secret(_))) {
          return Err(StepError::UndeclaredSecret {
            step,
            name: name.clone(),
          });
        }
      }
      Step::RewriteDescriptor { bindings, .. } => {
        if bindings.is_empty() {
          return Err(StepError::EmptyField { step, field: "bindings" });
        }
        for binding in bindings {
          if binding.name.trim().is_empty() || binding.repository.trim().is_empty() {
            return Err(StepError::EmptyField { step, field: "bindings" });
          }
        }
      }
      Step::Commit { paths, .. } if paths.is_empty() => {
        return Err(StepError::EmptyField { step, field: "paths" });
      }
      _ => {}
    }

    match self {
      Step::GitClone { base: branch, .. }
      | Step::CheckoutBranch { branch, .. }
      | Step::PushBranch { branch, .. } => validate_branch(branch)?,
      Step::OpenPullRequest { base, head, .. } => {
        validate_branch(base)?;
        validate_branch(head)?;
      }
      _ => {}
    }

    Ok(())
  }

  /// Render the step as backend shell commands.
  ///
  /// Placeholders become environment references; secret values never appear.
  pub fn commands(&self) -> Result<Vec<String>, StepError> {
    let step = self.name();
    let text = |field: &'static str, value: &str| {
      placeholder::substitute(value, &ScriptResolver).map_err(|source| StepError::Placeholder { step, field, source })
    };

    let commands = match self {
      Step::RegistryLogin { registry, region } => vec![format!(
        "aws ecr get-login-password --region {} | docker login --username AWS --password-stdin {}",
        dquote(&text("region", region)?),
        dquote(&text("registry", registry)?)
      )],
      Step::DeriveTag => vec![format!(
        "export {TAG_VAR}=\"$(printf '%s' \"${{SOURCE_REVISION:-$CODEBUILD_RESOLVED_SOURCE_VERSION}}\" | cut -c 1-{SHORT_TAG_LEN})\""
      )],
      Step::DockerBuild {
        dockerfile,
        image,
        context,
      } => vec![format!(
        "docker build -f {} -t {} {}",
        dquote(&text("dockerfile", dockerfile)?),
        dquote(&text("image", image)?),
        dquote(&text("context", context)?)
      )],
      Step::DockerTag { source, target } => vec![format!(
        "docker tag {} {}",
        dquote(&text("source", source)?),
        dquote(&text("target", target)?)
      )],
      Step::DockerPush { image } => vec![format!("docker push {}", dquote(&text("image", image)?))],
      Step::InstallSshKey { secret, host } => vec![
        "mkdir -p ~/.ssh && chmod 700 ~/.ssh".to_string(),
        format!("printf '%s\\n' \"${{{secret}}}\" > ~/.ssh/id_rsa"),
        "chmod 600 ~/.ssh/id_rsa".to_string(),
        format!("ssh-keyscan {} >> ~/.ssh/known_hosts", dquote(&text("host", host)?)),
      ],
      Step::GitIdentity { name, email } => vec![
        format!("git config --global user.name {}", dquote(&text("name", name)?)),
        format!("git config --global user.email {}", dquote(&text("email", email)?)),
      ],
      Step::GitClone { url, dir, base } => {
        let dir = text("dir", dir)?;
        let git = format!("git -C {}", dquote(&dir));
        vec![
          format!(
            "[ -d {} ] || git clone {} {}",
            dquote(&format!("{dir}/.git")),
            dquote(&text("url", url)?),
            dquote(&dir)
          ),
          format!(
            "{git} fetch --prune origin && {git} checkout --force --detach {} && {git} clean -fd",
            dquote(&format!("origin/{}", text("base", base)?))
          ),
        ]
      }
      Step::CheckoutBranch { dir, branch, policy } => {
        let git = format!("git -C {}", dquote(&text("dir", dir)?));
        let branch = dquote(&text("branch", branch)?);
        let exists = format!("{git} ls-remote --exit-code --heads origin {branch} >/dev/null");
        match policy {
          CollisionPolicy::Skip => vec![format!(
            "if {exists}; then {git} fetch origin {branch} && {git} checkout -B {branch} FETCH_HEAD; else {git} checkout -B {branch}; fi"
          )],
          CollisionPolicy::Fail => vec![
            format!("if {exists}; then echo 'deploy branch already exists:' {branch} >&2; exit 1; fi"),
            format!("{git} checkout -B {branch}"),
          ],
          CollisionPolicy::ForcePush => vec![format!("{git} checkout -B {branch}")],
        }
      }
      Step::RewriteDescriptor {
        dir,
        path,
        registry,
        bindings,
      } => {
        let file = dquote(&format!("{}/{}", text("dir", dir)?, text("path", path)?));
        let tmp = dquote(&format!("{}/{}.tmp", text("dir", dir)?, text("path", path)?));
        let registry = text("registry", registry)?;
        let mut commands = vec![
          format!("mkdir -p \"$(dirname {file})\""),
          format!("[ -f {file} ] || echo '[]' > {file}"),
        ];
        for binding in bindings {
          commands.push(format!(
            "jq -c --arg name {} --arg uri {} --arg tag \"${{{TAG_VAR}}}\" {} {file} > {tmp} && mv {tmp} {file}",
            squote(&binding.name),
            dquote(&format!("{registry}/{}", binding.repository)),
            squote(JQ_REWRITE)
          ));
        }
        commands
      }
      Step::Commit { dir, paths, message } => {
        let git = format!("git -C {}", dquote(&text("dir", dir)?));
        let paths = paths.iter().map(|p| text("paths", p).map(|p| dquote(&p))).collect::<Result<Vec<_>, _>>()?;
        vec![
          format!("{git} add -- {}", paths.join(" ")),
          format!(
            "{git} diff --cached --quiet || {git} commit -m {}",
            dquote(&text("message", message)?)
          ),
        ]
      }
      Step::PushBranch { dir, branch, policy } => {
        let git = format!("git -C {}", dquote(&text("dir", dir)?));
        let force = if *policy == CollisionPolicy::ForcePush { " --force" } else { "" };
        vec![format!("{git} push{force} origin {}", dquote(&text("branch", branch)?))]
      }
      Step::OpenPullRequest {
        repo,
        base,
        head,
        title,
        token,
      } => {
        let repo = dquote(&text("repo", repo)?);
        let base = dquote(&text("base", base)?);
        let head = dquote(&text("head", head)?);
        let title = dquote(&text("title", title)?);
        let mut commands = Vec::new();
        if token != "GH_TOKEN" {
          commands.push(format!("export GH_TOKEN=\"${{{token}}}\""));
        }
        commands.push(format!(
          "n=0; until [ -n \"$(gh pr list --repo {repo} --head {head} --base {base} --state open --json number --jq '.[0].number')\" ] || gh pr create --repo {repo} --base {base} --head {head} --title {title} --body {title}; do n=$((n + 1)); [ \"$n\" -lt {PR_CREATE_ATTEMPTS} ] || exit 1; sleep 5; done"
        ));
        commands
      }
      Step::Run { command, .. } => vec![text("command", command)?],
    };

    Ok(commands)
  }
}

/// jq filter replacing the tag of the entry named `$name`, or appending it.
const JQ_REWRITE: &str = r#"if any(.[]; .name == $name) then map(if .name == $name then .imageUri = ((.imageUri | sub("(:[^:/@]*)?(@.*)?$"; "")) + ":" + $tag) else . end) else . + [{"name": $name, "imageUri": ($uri + ":" + $tag)}] end"#;

/// Stand-in values used to check branch templates.
struct ProbeResolver;

impl Resolver for ProbeResolver {
  fn resolve_tag(&self) -> Result<String, PlaceholderError> {
    Ok("0".repeat(SHORT_TAG_LEN))
  }

  fn resolve_revision(&self) -> Result<String, PlaceholderError> {
    Ok("0".repeat(40))
  }

  fn resolve_var(&self, _name: &str) -> Result<String, PlaceholderError> {
    Ok("v".to_string())
  }

  fn resolve_secret(&self, name: &str) -> Result<String, PlaceholderError> {
    Err(PlaceholderError::SecretNotInlinable(name.to_string()))
  }
}

/// Check a branch template against git's ref name rules.
pub fn validate_branch(template: &str) -> Result<(), StepError> {
  let branch = placeholder::substitute(template, &ProbeResolver).map_err(|source| StepError::Placeholder {
    step: "branch",
    field: "branch",
    source,
  })?;
  let invalid = |reason| {
    Err(StepError::InvalidBranch {
      branch: template.to_string(),
      reason,
    })
  };

  if branch.is_empty() {
    return invalid("empty");
  }
  if branch.starts_with('/') || branch.ends_with('/') || branch.contains("//") {
    return invalid("empty path component");
  }
  if branch.starts_with('-') {
    return invalid("starts with '-'");
  }
  if branch.contains("..") || branch.contains("@{") {
    return invalid("contains '..' or '@{'");
  }
  if branch.ends_with('.') || branch.ends_with(".lock") {
    return invalid("ends with '.' or '.lock'");
  }
  if branch.split('/').any(|part| part.starts_with('.')) {
    return invalid("path component starts with '.'");
  }
  if branch
    .chars()
    .any(|c| c.is_ascii_control() || c.is_whitespace() || matches!(c, '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
  {
    return invalid("contains a forbidden character");
  }
  Ok(())
}
