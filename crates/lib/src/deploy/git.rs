//! Git and pull request operations for the deploy stage.
//!
//! [`GitOps`] is the seam between the deploy logic and the outside world.
//! [`GitCli`] drives the `git` and `gh` command line tools. Credentials only
//! ever reach those tools through environment variables: the SSH key as a
//! file referenced by `GIT_SSH_COMMAND`, the API token as `GH_TOKEN`.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::params::SecretValue;

#[derive(Debug, Error)]
pub enum GitError {
  #[error("failed to spawn {program}: {source}")]
  Spawn {
    program: String,
    #[source]
    source: std::io::Error,
  },

  #[error("authentication failed running '{command}': {stderr}")]
  Authentication { command: String, stderr: String },

  #[error("rejected by remote running '{command}': {stderr}")]
  Rejected { command: String, stderr: String },

  #[error("'{command}' exited with code {code:?}: {stderr}")]
  Command {
    command: String,
    code: Option<i32>,
    stderr: String,
  },

  #[error("unexpected output from '{command}': {message}")]
  Parse { command: String, message: String },

  #[error("gave up after {attempts} attempts: {last}")]
  RetriesExhausted { attempts: u32, last: Box<GitError> },
}

impl GitError {
  /// Whether retrying the same operation may succeed.
  pub fn is_transient(&self) -> bool {
    matches!(
      self,
      GitError::Spawn { .. } | GitError::Command { .. } | GitError::Parse { .. }
    )
  }
}

/// Commit identity applied to automated commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitIdentity {
  pub name: String,
  pub email: String,
}

impl GitIdentity {
  pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      email: email.into(),
    }
  }
}

/// Credentials and identity for one job's git operations.
#[derive(Debug, Clone, Default)]
pub struct GitSession {
  /// Private key file used for SSH remotes.
  pub ssh_key: Option<PathBuf>,
  /// API token for HTTPS remotes and pull request calls.
  pub token: Option<SecretValue>,
  pub identity: Option<GitIdentity>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
  pub number: u64,
  pub url: String,
}

/// Git and pull request operations used by the deploy stage.
pub trait GitOps: Send + Sync + 'static {
  fn clone_repo(&self, url: &str, dir: &Path, session: &GitSession) -> impl Future<Output = Result<(), GitError>> + Send;

  fn checkout_revision(
    &self,
    dir: &Path,
    revision: &str,
    session: &GitSession,
  ) -> impl Future<Output = Result<(), GitError>> + Send;

  /// Fetch `origin` and leave a clean, detached checkout of its `base`.
  fn sync_to_remote(
    &self,
    dir: &Path,
    base: &str,
    session: &GitSession,
  ) -> impl Future<Output = Result<(), GitError>> + Send;

  fn remote_branch_exists(
    &self,
    dir: &Path,
    branch: &str,
    session: &GitSession,
  ) -> impl Future<Output = Result<bool, GitError>> + Send;

  /// Create `branch` at HEAD. With `force`, an existing local branch is reset.
  fn checkout_new_branch(
    &self,
    dir: &Path,
    branch: &str,
    force: bool,
    session: &GitSession,
  ) -> impl Future<Output = Result<(), GitError>> + Send;

  /// Check out the remote `branch` as a local branch.
  fn checkout_remote_branch(
    &self,
    dir: &Path,
    branch: &str,
    session: &GitSession,
  ) -> impl Future<Output = Result<(), GitError>> + Send;

  /// Stage `paths` and commit them. Returns `false` when nothing changed.
  fn commit_if_changed(
    &self,
    dir: &Path,
    paths: &[String],
    message: &str,
    session: &GitSession,
  ) -> impl Future<Output = Result<bool, GitError>> + Send;

  fn push(
    &self,
    dir: &Path,
    branch: &str,
    force: bool,
    session: &GitSession,
  ) -> impl Future<Output = Result<(), GitError>> + Send;

  fn find_open_pull_request(
    &self,
    repo: &str,
    head: &str,
    base: &str,
    session: &GitSession,
  ) -> impl Future<Output = Result<Option<PullRequest>, GitError>> + Send;

  fn create_pull_request(
    &self,
    repo: &str,
    head: &str,
    base: &str,
    title: &str,
    session: &GitSession,
  ) -> impl Future<Output = Result<PullRequest, GitError>> + Send;
}

/// Environment variable that carries the API token to `gh` and the git
/// credential helper.
const TOKEN_ENV: &str = "GH_TOKEN";

/// Credential helper reading the token from the environment, so it never
/// appears on a command line.
const CREDENTIAL_HELPER: &str = "!f() { echo username=x-access-token; echo \"password=${GH_TOKEN}\"; }; f";

struct Output {
  code: Option<i32>,
  stdout: String,
  stderr: String,
}

/// [`GitOps`] backed by the `git` and `gh` executables.
#[derive(Debug, Clone)]
pub struct GitCli {
  git: String,
  gh: String,
}

impl Default for GitCli {
  fn default() -> Self {
    Self {
      git: "git".to_string(),
      gh: "gh".to_string(),
    }
  }
}

impl GitCli {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_programs(git: impl Into<String>, gh: impl Into<String>) -> Self {
    Self {
      git: git.into(),
      gh: gh.into(),
    }
  }

  async fn run(&self, program: &str, args: &[&str], session: &GitSession) -> Result<Output, GitError> {
    let command_line = format!("{program} {}", args.join(" "));
    debug!(command = %command_line, "running");

    let mut command = Command::new(program);
    command
      .args(args)
      .env_clear()
      .env("LANG", "C")
      .env("LC_ALL", "C")
      .env("GIT_TERMINAL_PROMPT", "0")
      .env("GH_PROMPT_DISABLED", "1")
      .stdin(Stdio::null());

    for name in ["PATH", "HOME"] {
      if let Some(value) = std::env::var_os(name) {
        command.env(name, value);
      }
    }

    if let Some(key) = &session.ssh_key {
      command.env(
        "GIT_SSH_COMMAND",
        format!(
          "ssh -i '{}' -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new",
          key.display()
        ),
      );
    }

    if let Some(token) = &session.token {
      command
        .env(TOKEN_ENV, token.expose())
        .env("GIT_CONFIG_COUNT", "1")
        .env("GIT_CONFIG_KEY_0", "credential.helper")
        .env("GIT_CONFIG_VALUE_0", CREDENTIAL_HELPER);
    }

    if let Some(identity) = &session.identity {
      command
        .env("GIT_AUTHOR_NAME", &identity.name)
        .env("GIT_AUTHOR_EMAIL", &identity.email)
        .env("GIT_COMMITTER_NAME", &identity.name)
        .env("GIT_COMMITTER_EMAIL", &identity.email);
    }

    let output = command.output().await.map_err(|source| GitError::Spawn {
      program: program.to_string(),
      source,
    })?;

    Ok(Output {
      code: output.status.code(),
      stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
      stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
  }

  async fn run_ok(&self, program: &str, args: &[&str], session: &GitSession) -> Result<String, GitError> {
    let output = self.run(program, args, session).await?;
    if output.code == Some(0) {
      Ok(output.stdout)
    } else {
      Err(classify(program, args, output))
    }
  }

  async fn git(&self, dir: &Path, args: &[&str], session: &GitSession) -> Result<String, GitError> {
    let dir = dir.display().to_string();
    let mut full = vec!["-C", dir.as_str()];
    full.extend_from_slice(args);
    self.run_ok(&self.git, &full, session).await
  }
}

fn classify(program: &str, args: &[&str], output: Output) -> GitError {
  let command = format!("{program} {}", args.join(" "));
  let stderr = output.stderr;
  let lower = stderr.to_ascii_lowercase();

  if lower.contains("permission denied")
    || lower.contains("authentication failed")
    || lower.contains("could not read username")
    || lower.contains("http 401")
    || lower.contains("bad credentials")
  {
    GitError::Authentication { command, stderr }
  } else if lower.contains("[rejected]") || lower.contains("non-fast-forward") || lower.contains("failed to push") {
    GitError::Rejected { command, stderr }
  } else {
    GitError::Command {
      command,
      code: output.code,
      stderr,
    }
  }
}

/// PR number from a URL such as `https://github.com/o/r/pull/42`.
fn pull_request_from_url(command: &str, url: &str) -> Result<PullRequest, GitError> {
  let url = url.lines().last().unwrap_or_default().trim();
  let number = url
    .rsplit('/')
    .next()
    .and_then(|n| n.parse().ok())
    .ok_or_else(|| GitError::Parse {
      command: command.to_string(),
      message: format!("no pull request number in '{url}'"),
    })?;
  Ok(PullRequest {
    number,
    url: url.to_string(),
  })
}

impl GitOps for GitCli {
  async fn clone_repo(&self, url: &str, dir: &Path, session: &GitSession) -> Result<(), GitError> {
    let dir = dir.display().to_string();
    self.run_ok(&self.git, &["clone", "--", url, dir.as_str()], session).await?;
    Ok(())
  }

  async fn checkout_revision(&self, dir: &Path, revision: &str, session: &GitSession) -> Result<(), GitError> {
    self.git(dir, &["checkout", "--detach", revision], session).await?;
    Ok(())
  }

  async fn sync_to_remote(&self, dir: &Path, base: &str, session: &GitSession) -> Result<(), GitError> {
    let upstream = format!("origin/{base}");
    self.git(dir, &["fetch", "--prune", "origin"], session).await?;
    self.git(dir, &["checkout", "--force", "--detach", upstream.as_str()], session).await?;
    self.git(dir, &["clean", "-fd"], session).await?;
    Ok(())
  }

  async fn remote_branch_exists(&self, dir: &Path, branch: &str, session: &GitSession) -> Result<bool, GitError> {
    let dir_arg = dir.display().to_string();
    let args = ["-C", dir_arg.as_str(), "ls-remote", "--exit-code", "--heads", "origin", branch];
    let output = self.run(&self.git, &args, session).await?;
    match output.code {
      Some(0) => Ok(true),
      // ls-remote --exit-code reports "no matching refs" as 2
      Some(2) => Ok(false),
      _ => Err(classify(&self.git, &args, output)),
    }
  }

  async fn checkout_new_branch(
    &self,
    dir: &Path,
    branch: &str,
    force: bool,
    session: &GitSession,
  ) -> Result<(), GitError> {
    let flag = if force { "-B" } else { "-b" };
    self.git(dir, &["checkout", flag, branch], session).await?;
    Ok(())
  }

  async fn checkout_remote_branch(&self, dir: &Path, branch: &str, session: &GitSession) -> Result<(), GitError> {
    self.git(dir, &["fetch", "origin", branch], session).await?;
    self.git(dir, &["checkout", "-B", branch, "FETCH_HEAD"], session).await?;
    Ok(())
  }

  async fn commit_if_changed(
    &self,
    dir: &Path,
    paths: &[String],
    message: &str,
    session: &GitSession,
  ) -> Result<bool, GitError> {
    let mut add = vec!["add", "--"];
    add.extend(paths.iter().map(String::as_str));
    self.git(dir, &add, session).await?;

    let dir_arg = dir.display().to_string();
    let diff = ["-C", dir_arg.as_str(), "diff", "--cached", "--quiet"];
    let output = self.run(&self.git, &diff, session).await?;
    match output.code {
      Some(0) => return Ok(false),
      Some(1) => {}
      _ => return Err(classify(&self.git, &diff, output)),
    }

    self.git(dir, &["commit", "-m", message], session).await?;
    Ok(true)
  }

  async fn push(&self, dir: &Path, branch: &str, force: bool, session: &GitSession) -> Result<(), GitError> {
    if force {
      self.git(dir, &["push", "--force", "origin", branch], session).await?;
    } else {
      self.git(dir, &["push", "origin", branch], session).await?;
    }
    Ok(())
  }

  async fn find_open_pull_request(
    &self,
    repo: &str,
    head: &str,
    base: &str,
    session: &GitSession,
  ) -> Result<Option<PullRequest>, GitError> {
    let args = [
      "pr", "list", "--repo", repo, "--head", head, "--base", base, "--state", "open", "--json", "number,url",
      "--limit", "1",
    ];
    let stdout = self.run_ok(&self.gh, &args, session).await?;
    let found: Vec<PullRequest> = serde_json::from_str(&stdout).map_err(|e| GitError::Parse {
      command: format!("{} pr list", self.gh),
      message: e.to_string(),
    })?;
    Ok(found.into_iter().next())
  }

  async fn create_pull_request(
    &self,
    repo: &str,
    head: &str,
    base: &str,
    title: &str,
    session: &GitSession,
  ) -> Result<PullRequest, GitError> {
    let args = [
      "pr", "create", "--repo", repo, "--head", head, "--base", base, "--title", title, "--body", title,
    ];
    let stdout = self.run_ok(&self.gh, &args, session).await?;
    pull_request_from_url(&format!("{} pr create", self.gh), &stdout)
  }
}
