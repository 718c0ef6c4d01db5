//! Deploy-descriptor stage.
//!
//! After every image build of a run succeeds, the deploy job clones the
//! operations repository, checks out `deploy/<tag>`, rewrites the deployment
//! descriptor with the new tag, commits, pushes and opens a pull request
//! against the configured base branch.
//!
//! # Branch Collisions
//!
//! Re-running the same revision lands on the same branch. What happens then
//! is governed by [`CollisionPolicy`]; the default, `Skip`, makes a re-run an
//! idempotent no-op: the existing branch is reused, a commit is only made
//! when the descriptor changed, the branch is only pushed when something was
//! committed or it did not exist yet, and a pull request is only opened when
//! none is open for the branch.

mod git;

pub use git::*;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::build::{BuildEnvironment, BuildSpec, context_variables};
use crate::config::DeployContext;
use crate::params::SecretHandle;
use crate::pipeline::RepoSpec;
use crate::step::{EnvVar, JobKind, JobSpec, JobVariables, Step};

/// Secret variable holding the deploy SSH key.
pub const SSH_KEY_VAR: &str = "GIT_SSH_KEY";

/// Secret variable holding the pull request API token.
pub const TOKEN_VAR: &str = "GITHUB_TOKEN";

/// Bounded attempts for pull request creation after a successful push.
pub const PR_CREATE_ATTEMPTS: u32 = 3;

/// Behavior when `deploy/<tag>` already exists on the remote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
  /// Reuse the branch and skip work that is already done.
  #[default]
  Skip,
  /// Fail the run.
  Fail,
  /// Recreate the branch from the base and force push.
  ForcePush,
}

/// Maps a logical container name in the descriptor to the repository whose
/// image it runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerBinding {
  pub name: String,
  pub repository: String,
}

impl ContainerBinding {
  pub fn new(name: impl Into<String>, repository: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      repository: repository.into(),
    }
  }
}

/// `<app>/imagedefinitions.json`
pub fn default_descriptor_path(app: &str) -> String {
  format!("{app}/imagedefinitions.json")
}

/// Destination and identity for the deployment descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploySpec {
  pub ops_repo: RepoSpec,
  pub git_identity: GitIdentity,
  pub ssh_key: SecretHandle,
  /// API token used to open pull requests.
  pub token: SecretHandle,
  pub descriptor_path: String,
  /// Explicit container bindings. Empty means one container per build,
  /// named after its repository.
  pub containers: Vec<ContainerBinding>,
  pub environment: BuildEnvironment,
  pub on_collision: CollisionPolicy,
}

impl DeploySpec {
  pub fn new(
    ops_repo: RepoSpec,
    git_identity: GitIdentity,
    ssh_key: SecretHandle,
    token: SecretHandle,
    descriptor_path: impl Into<String>,
  ) -> Self {
    Self {
      ops_repo,
      git_identity,
      ssh_key,
      token,
      descriptor_path: descriptor_path.into(),
      containers: Vec::new(),
      environment: BuildEnvironment::default(),
      on_collision: CollisionPolicy::default(),
    }
  }

  pub fn with_containers(mut self, containers: Vec<ContainerBinding>) -> Self {
    self.containers = containers;
    self
  }

  pub fn with_collision_policy(mut self, policy: CollisionPolicy) -> Self {
    self.on_collision = policy;
    self
  }

  /// Bindings used for the descriptor rewrite.
  pub fn bindings(&self, builds: &[BuildSpec]) -> Vec<ContainerBinding> {
    if !self.containers.is_empty() {
      return self.containers.clone();
    }
    builds
      .iter()
      .map(|b| ContainerBinding::new(&b.repository, &b.repository))
      .collect()
  }
}

/// Backend action name of the deploy job.
pub fn action_name(ctx: &DeployContext) -> String {
  ctx.cid("PrepareDeploy")
}

/// Build the deploy job specification.
pub fn prepare_deploy_job(spec: &DeploySpec, ctx: &DeployContext, bindings: &[ContainerBinding]) -> JobSpec {
  let mut variables: JobVariables = spec
    .environment
    .variables
    .iter()
    .map(|(name, value)| (name.clone(), EnvVar::Plain(value.clone())))
    .collect();
  variables.extend(context_variables(ctx));
  variables.insert("APP_NAME".to_string(), EnvVar::Plain(ctx.app.clone()));
  variables.insert("GIT_OWNER".to_string(), EnvVar::Plain(spec.ops_repo.owner.clone()));
  variables.insert("GIT_REPO".to_string(), EnvVar::Plain(spec.ops_repo.repo.clone()));
  variables.insert("GIT_BRANCH".to_string(), EnvVar::Plain(spec.ops_repo.branch.clone()));
  variables.insert(SSH_KEY_VAR.to_string(), EnvVar::Secret(spec.ssh_key.clone()));
  variables.insert(TOKEN_VAR.to_string(), EnvVar::Secret(spec.token.clone()));

  let dir = "$${var:GIT_REPO}".to_string();
  let branch = "deploy/$${tag}".to_string();

  let steps = vec![
    Step::InstallSshKey {
      secret: SSH_KEY_VAR.to_string(),
      host: spec.ops_repo.host.clone(),
    },
    Step::GitIdentity {
      name: spec.git_identity.name.clone(),
      email: spec.git_identity.email.clone(),
    },
    Step::DeriveTag,
    Step::GitClone {
      url: format!("git@{}:$${{var:GIT_OWNER}}/$${{var:GIT_REPO}}.git", spec.ops_repo.host),
      dir: dir.clone(),
      base: "$${var:GIT_BRANCH}".to_string(),
    },
    Step::CheckoutBranch {
      dir: dir.clone(),
      branch: branch.clone(),
      policy: spec.on_collision,
    },
    Step::RewriteDescriptor {
      dir: dir.clone(),
      path: spec.descriptor_path.clone(),
      registry: "$${var:REGISTRY_HOST}".to_string(),
      bindings: bindings.to_vec(),
    },
    Step::Commit {
      dir: dir.clone(),
      paths: vec![spec.descriptor_path.clone()],
      message: "deploy $${tag}".to_string(),
    },
    Step::PushBranch {
      dir,
      branch: branch.clone(),
      policy: spec.on_collision,
    },
    Step::OpenPullRequest {
      repo: "$${var:GIT_OWNER}/$${var:GIT_REPO}".to_string(),
      base: "$${var:GIT_BRANCH}".to_string(),
      head: branch.clone(),
      title: branch,
      token: TOKEN_VAR.to_string(),
    },
  ];

  JobSpec {
    name: action_name(ctx),
    kind: JobKind::PrepareDeploy,
    environment: spec.environment.clone(),
    variables,
    steps,
  }
}

/// How the pull request for a deploy branch came to be open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployOutcome {
  /// Created on the first attempt.
  Opened,
  /// An open pull request already existed.
  AlreadyOpen,
  /// Open after one or more failed creation attempts.
  Retried,
}

/// Result of a completed deploy job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployReport {
  pub branch: String,
  pub branch_existed: bool,
  pub committed: bool,
  pub pushed: bool,
  pub outcome: DeployOutcome,
  pub pull_request: PullRequest,
}

/// Pull request coordinates for [`ensure_pull_request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestTarget {
  pub repo: String,
  pub base: String,
  pub head: String,
  pub title: String,
}

/// Make sure a pull request is open for `target.head`.
///
/// Every attempt looks for an open pull request before creating one, so a
/// creation that succeeded remotely but failed locally is never duplicated.
/// Only transient errors are retried. The branch is never pushed again here.
pub async fn ensure_pull_request<G: GitOps>(
  git: &G,
  target: &PullRequestTarget,
  session: &GitSession,
  attempts: u32,
  backoff: Duration,
) -> Result<(DeployOutcome, PullRequest), GitError> {
  let attempts = attempts.max(1);
  let mut last = None;

  for attempt in 1..=attempts {
    let outcome = |first| if attempt == 1 { first } else { DeployOutcome::Retried };

    let result = match git
      .find_open_pull_request(&target.repo, &target.head, &target.base, session)
      .await
    {
      Ok(Some(pr)) => {
        info!(repo = %target.repo, head = %target.head, number = pr.number, "pull request already open");
        return Ok((outcome(DeployOutcome::AlreadyOpen), pr));
      }
      Ok(None) => {
        git
          .create_pull_request(&target.repo, &target.head, &target.base, &target.title, session)
          .await
      }
      Err(e) => Err(e),
    };

    match result {
      Ok(pr) => {
        info!(repo = %target.repo, head = %target.head, number = pr.number, attempt, "opened pull request");
        return Ok((outcome(DeployOutcome::Opened), pr));
      }
      Err(e) if !e.is_transient() => return Err(e),
      Err(e) => {
        warn!(repo = %target.repo, head = %target.head, attempt, error = %e, "pull request attempt failed");
        last = Some(e);
      }
    }

    if attempt < attempts {
      tokio::time::sleep(backoff).await;
    }
  }

  Err(GitError::RetriesExhausted {
    attempts,
    last: Box::new(last.unwrap_or(GitError::Parse {
      command: "pull request".to_string(),
      message: "no attempt was made".to_string(),
    })),
  })
}
