//! Local execution backend.
//!
//! Shell steps run their rendered commands through the shell with an
//! isolated environment that carries the job variables, `IMAGE_TAG`,
//! `SOURCE_REVISION` and the revealed secrets. Git, descriptor and pull
//! request steps run natively against [`GitOps`], which is what makes the
//! collision policy observable: the executor knows whether the deploy
//! branch existed, whether anything was committed and whether a pull
//! request was already open.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::executor::{JobError, JobExecutor, JobReport, RunContext, SourceArtifact};
use super::shell::{StepEnv, forwarded_env, run_shell};
use super::types::ExecuteConfig;
use crate::deploy::{
  CollisionPolicy, DeployOutcome, DeployReport, GitError, GitIdentity, GitOps, GitSession, PR_CREATE_ATTEMPTS, PullRequest,
  PullRequestTarget, ensure_pull_request,
};
use crate::descriptor;
use crate::params::{ParameterStore, SecretValue};
use crate::pipeline::SourceSpec;
use crate::placeholder::{self, REVISION_VAR, RunResolver, TAG_VAR};
use crate::revision::Revision;
use crate::step::{JobKind, JobSpec, Step};

/// Default pause between pull request creation attempts.
pub const PR_BACKOFF: Duration = Duration::from_secs(5);

pub struct LocalExecutor<G: GitOps> {
  git: Arc<G>,
  store: Arc<dyn ParameterStore>,
  config: ExecuteConfig,
  pr_attempts: u32,
  pr_backoff: Duration,
}

impl<G: GitOps> LocalExecutor<G> {
  pub fn new(git: G, store: Arc<dyn ParameterStore>, config: ExecuteConfig) -> Self {
    Self {
      git: Arc::new(git),
      store,
      config,
      pr_attempts: PR_CREATE_ATTEMPTS,
      pr_backoff: PR_BACKOFF,
    }
  }

  pub fn with_pr_retry(mut self, attempts: u32, backoff: Duration) -> Self {
    self.pr_attempts = attempts;
    self.pr_backoff = backoff;
    self
  }

  pub fn git(&self) -> &G {
    &self.git
  }

  pub fn config(&self) -> &ExecuteConfig {
    &self.config
  }

  fn job_dir(&self, ctx: &RunContext, job: &JobSpec) -> PathBuf {
    self
      .config
      .workspace
      .join(&ctx.pipeline)
      .join(ctx.tag.as_str())
      .join(&job.name)
  }
}

/// Deploy facts collected while the steps of a job run.
#[derive(Default)]
struct DeployProgress {
  branch: Option<String>,
  branch_existed: bool,
  committed: bool,
  pushed: bool,
  pull_request: Option<(DeployOutcome, PullRequest)>,
}

impl DeployProgress {
  fn into_report(self) -> Option<DeployReport> {
    let (outcome, pull_request) = self.pull_request?;
    Some(DeployReport {
      branch: self.branch.unwrap_or_default(),
      branch_existed: self.branch_existed,
      committed: self.committed,
      pushed: self.pushed,
      outcome,
      pull_request,
    })
  }
}

/// Per-job execution state.
struct JobRun<'a, G: GitOps> {
  executor: &'a LocalExecutor<G>,
  job: &'a JobSpec,
  ctx: &'a RunContext,
  /// Working directory of shell steps and root of relative step paths.
  cwd: PathBuf,
  scratch: PathBuf,
  vars: BTreeMap<String, String>,
  secrets: BTreeMap<String, SecretValue>,
  session: GitSession,
  ssh_key: Option<tempfile::NamedTempFile>,
  progress: DeployProgress,
}

impl<'a, G: GitOps> JobRun<'a, G> {
  fn fail(&self, message: impl Into<String>) -> JobError {
    JobError::for_job(self.job, message)
  }

  fn resolve(&self, step: &Step, field: &str, value: &str) -> Result<String, JobError> {
    let resolver = RunResolver::new(self.ctx.tag.as_str(), self.ctx.revision.as_str(), &self.vars);
    placeholder::substitute(value, &resolver).map_err(|e| self.fail(format!("{}: field '{field}': {e}", step.name())))
  }

  fn path(&self, step: &Step, field: &str, value: &str) -> Result<PathBuf, JobError> {
    Ok(self.cwd.join(self.resolve(step, field, value)?))
  }

  fn secret(&self, name: &str) -> Result<&SecretValue, JobError> {
    self
      .secrets
      .get(name)
      .ok_or_else(|| self.fail(format!("secret variable {name} is not available")))
  }

  fn git_err(&self, err: GitError) -> JobError {
    self.fail(err.to_string())
  }

  async fn shell(&self, step: &Step) -> Result<(), JobError> {
    let commands = step.commands().map_err(|e| self.fail(e.to_string()))?;

    let mut env = StepEnv {
      inherited: forwarded_env(&self.executor.config.forward_env),
      vars: self.vars.clone(),
      secrets: self.secrets.iter().map(|(name, value)| (name.clone(), value)).collect(),
    };
    env.vars.insert(TAG_VAR.to_string(), self.ctx.tag.to_string());
    env.vars.insert(REVISION_VAR.to_string(), self.ctx.revision.to_string());

    for command in commands {
      run_shell(
        &command,
        &env,
        &self.cwd,
        &self.scratch,
        self.executor.config.shell.as_deref(),
      )
      .await
      .map_err(|e| self.fail(e.to_string()))?;
    }
    Ok(())
  }

  async fn native(&mut self, step: &Step) -> Result<(), JobError> {
    let executor = self.executor;
    let git = executor.git.as_ref();

    match step {
      Step::DeriveTag => {
        debug!(job = %self.job.name, tag = %self.ctx.tag, "derived image tag");
      }
      Step::InstallSshKey { secret, host } => {
        let key = self.secret(secret)?.clone();
        let mut file = tempfile::Builder::new()
          .prefix("deploy-key-")
          .tempfile_in(&self.scratch)
          .map_err(|e| self.fail(format!("failed to create key file: {e}")))?;
        writeln!(file, "{}", key.expose())
          .and_then(|()| file.flush())
          .map_err(|e| self.fail(format!("failed to write key file: {e}")))?;
        debug!(job = %self.job.name, host = %host, "installed ssh key");
        self.session.ssh_key = Some(file.path().to_path_buf());
        self.ssh_key = Some(file);
      }
      Step::GitIdentity { name, email } => {
        self.session.identity = Some(GitIdentity::new(
          self.resolve(step, "name", name)?,
          self.resolve(step, "email", email)?,
        ));
      }
      Step::GitClone { url, dir, base } => {
        let url = self.resolve(step, "url", url)?;
        let dir = self.path(step, "dir", dir)?;
        let base = self.resolve(step, "base", base)?;
        if dir.join(".git").exists() {
          debug!(dir = %dir.display(), "repository already cloned, refreshing");
        } else {
          git.clone_repo(&url, &dir, &self.session).await.map_err(|e| self.git_err(e))?;
        }
        git
          .sync_to_remote(&dir, &base, &self.session)
          .await
          .map_err(|e| self.git_err(e))?;
      }
      Step::CheckoutBranch { dir, branch, policy } => {
        let dir = self.path(step, "dir", dir)?;
        let branch = self.resolve(step, "branch", branch)?;
        let exists = git
          .remote_branch_exists(&dir, &branch, &self.session)
          .await
          .map_err(|e| self.git_err(e))?;

        let checkout = match (*policy, exists) {
          (CollisionPolicy::Skip, true) => {
            info!(job = %self.job.name, branch = %branch, "deploy branch exists, reusing it");
            git.checkout_remote_branch(&dir, &branch, &self.session).await
          }
          (CollisionPolicy::Fail, true) => return Err(self.fail(format!("deploy branch {branch} already exists"))),
          // A local branch left by an earlier run is reset to the fresh base.
          (CollisionPolicy::ForcePush, _) | (_, false) => {
            git.checkout_new_branch(&dir, &branch, true, &self.session).await
          }
        };
        checkout.map_err(|e| self.git_err(e))?;

        self.progress.branch = Some(branch);
        self.progress.branch_existed = exists;
      }
      Step::RewriteDescriptor {
        dir,
        path,
        registry,
        bindings,
      } => {
        let file = self.path(step, "dir", dir)?.join(self.resolve(step, "path", path)?);
        let registry = self.resolve(step, "registry", registry)?;
        let changed = descriptor::rewrite_file(&file, bindings, &registry, self.ctx.tag.as_str())
          .map_err(|e| self.fail(e.to_string()))?;
        info!(job = %self.job.name, path = %file.display(), changed, "rewrote descriptor");
      }
      Step::Commit { dir, paths, message } => {
        let dir = self.path(step, "dir", dir)?;
        let paths = paths
          .iter()
          .map(|p| self.resolve(step, "paths", p))
          .collect::<Result<Vec<_>, _>>()?;
        let message = self.resolve(step, "message", message)?;
        self.progress.committed = git
          .commit_if_changed(&dir, &paths, &message, &self.session)
          .await
          .map_err(|e| self.git_err(e))?;
      }
      Step::PushBranch { dir, branch, policy } => {
        let dir = self.path(step, "dir", dir)?;
        let branch = self.resolve(step, "branch", branch)?;
        let force = *policy == CollisionPolicy::ForcePush;
        if force || self.progress.committed || !self.progress.branch_existed {
          git.push(&dir, &branch, force, &self.session).await.map_err(|e| self.git_err(e))?;
          self.progress.pushed = true;
        } else {
          info!(job = %self.job.name, branch = %branch, "deploy branch up to date, not pushing");
        }
      }
      Step::OpenPullRequest {
        repo,
        base,
        head,
        title,
        token,
      } => {
        let target = PullRequestTarget {
          repo: self.resolve(step, "repo", repo)?,
          base: self.resolve(step, "base", base)?,
          head: self.resolve(step, "head", head)?,
          title: self.resolve(step, "title", title)?,
        };
        let mut session = self.session.clone();
        session.token = Some(self.secret(token)?.clone());
        let opened = ensure_pull_request(
          git,
          &target,
          &session,
          executor.pr_attempts,
          executor.pr_backoff,
        )
        .await
        .map_err(|e| self.git_err(e))?;
        self.progress.pull_request = Some(opened);
      }
      other => return Err(self.fail(format!("{} has no native implementation", other.name()))),
    }

    Ok(())
  }
}

impl<G: GitOps> JobExecutor for LocalExecutor<G> {
  async fn fetch_source(&self, source: &SourceSpec, revision: &Revision) -> Result<SourceArtifact, JobError> {
    if let Some(dir) = &self.config.source_dir {
      info!(path = %dir.display(), revision = %revision, "using existing checkout");
      return Ok(SourceArtifact {
        revision: revision.clone(),
        path: Some(dir.clone()),
      });
    }

    let source_err = |message: String| JobError::Source { message };

    let mut session = GitSession::default();
    if let Some(credential) = &source.credential {
      let token = self.store.reveal(credential).map_err(|e| source_err(e.to_string()))?;
      session.token = Some(token);
    }

    let dir = self
      .config
      .workspace
      .join("sources")
      .join(format!("{}-{}", source.owner, source.repo));
    if !dir.join(".git").exists() {
      tokio::fs::create_dir_all(&self.config.workspace)
        .await
        .map_err(|e| source_err(e.to_string()))?;
      self
        .git
        .clone_repo(&source.clone_url(), &dir, &session)
        .await
        .map_err(|e| source_err(e.to_string()))?;
    }
    self
      .git
      .checkout_revision(&dir, revision.as_str(), &session)
      .await
      .map_err(|e| source_err(e.to_string()))?;

    info!(repo = %source.slug(), revision = %revision, "fetched source");
    Ok(SourceArtifact {
      revision: revision.clone(),
      path: Some(dir),
    })
  }

  async fn run_job(&self, job: &JobSpec, ctx: &RunContext) -> Result<JobReport, JobError> {
    let job_dir = self.job_dir(ctx, job);
    let scratch = job_dir.join(".scratch");
    tokio::fs::create_dir_all(&scratch)
      .await
      .map_err(|e| JobError::for_job(job, format!("failed to create {}: {e}", scratch.display())))?;

    let mut secrets = BTreeMap::new();
    for (name, handle) in job.secret_variables() {
      let value = self.store.reveal(&handle).map_err(|source| JobError::Secret {
        job: job.name.clone(),
        source,
      })?;
      secrets.insert(name, value);
    }

    let cwd = match job.kind {
      JobKind::ImageBuild => ctx.source.path.clone().unwrap_or_else(|| job_dir.clone()),
      JobKind::PrepareDeploy => job_dir.clone(),
    };

    let mut run = JobRun {
      executor: self,
      job,
      ctx,
      cwd,
      scratch,
      vars: job.plain_variables(),
      secrets,
      session: GitSession::default(),
      ssh_key: None,
      progress: DeployProgress::default(),
    };

    info!(job = %job.name, tag = %ctx.tag, steps = job.steps.len(), "running job");
    for step in &job.steps {
      debug!(job = %job.name, step = step.name(), phase = %step.phase(), "step");
      if step.is_shell() {
        run.shell(step).await?;
      } else {
        run.native(step).await?;
      }
    }

    if run.ssh_key.take().is_some_and(|file| file.close().is_err()) {
      warn!(job = %job.name, "failed to remove ssh key file");
    }

    Ok(JobReport {
      job: job.name.clone(),
      kind: job.kind,
      steps: job.steps.len(),
      deploy: run.progress.into_report(),
    })
  }
}
