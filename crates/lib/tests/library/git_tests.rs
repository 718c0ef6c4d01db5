//! Deploy preparation through `GitCli` against a real bare remote.
//!
//! `git@github.com:` is rewritten to a local directory with `insteadOf` in a
//! scratch `HOME`, and `gh` is a small script that remembers whether it
//! opened a pull request.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use serial_test::serial;
use tempfile::TempDir;

use deckhand_lib::deploy::{
  ContainerBinding, DeployOutcome, DeployReport, DeploySpec, GitCli, GitIdentity, default_descriptor_path,
  prepare_deploy_job,
};
use deckhand_lib::params::SecretHandle;
use deckhand_lib::pipeline::RepoSpec;
use deckhand_lib::run::{ExecuteConfig, JobExecutor, LocalExecutor, RunContext, SourceArtifact};
use deckhand_lib::step::JobSpec;

use super::common::{ctx, revision, store, token};

const BRANCH: &str = "deploy/1234567";
const DESCRIPTOR: &str = "laravel-app/imagedefinitions.json";

const GH_STUB: &str = r#"#!/bin/sh
state="$(dirname "$0")/opened"
case "$2" in
  list) if [ -f "$state" ]; then echo '[{"number":1,"url":"https://github.com/x/ops/pull/1"}]'; else echo '[]'; fi ;;
  create) touch "$state"; echo 'https://github.com/x/ops/pull/1' ;;
  *) exit 1 ;;
esac
"#;

fn git(dir: &Path, args: &[&str]) -> String {
  let output = Command::new("git")
    .arg("-C")
    .arg(dir)
    .env("GIT_CONFIG_GLOBAL", "/dev/null")
    .env("GIT_CONFIG_NOSYSTEM", "1")
    .args(["-c", "user.name=seed", "-c", "user.email=seed@example.com"])
    .args(args)
    .output()
    .unwrap();
  assert!(
    output.status.success(),
    "git {args:?} failed: {}",
    String::from_utf8_lossy(&output.stderr)
  );
  String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A bare ops repository with one commit on `main`.
struct OpsRemote {
  root: TempDir,
}

impl OpsRemote {
  fn new() -> Self {
    let root = TempDir::new().unwrap();
    let base = root.path();

    let home = base.join("home");
    std::fs::create_dir_all(&home).unwrap();
    std::fs::write(
      home.join(".gitconfig"),
      format!("[url \"file://{}/\"]\n\tinsteadOf = git@github.com:\n", base.join("remote").display()),
    )
    .unwrap();

    let bin = base.join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    let gh = bin.join("gh");
    std::fs::write(&gh, GH_STUB).unwrap();
    std::fs::set_permissions(&gh, std::fs::Permissions::from_mode(0o755)).unwrap();

    let seed = base.join("seed");
    std::fs::create_dir_all(&seed).unwrap();
    git(&seed, &["init", "-q", "-b", "main"]);
    std::fs::write(seed.join("README.md"), "ops\n").unwrap();
    git(&seed, &["add", "README.md"]);
    git(&seed, &["commit", "-q", "-m", "init"]);
    std::fs::create_dir_all(base.join("remote/x")).unwrap();
    git(base, &["clone", "-q", "--bare", "seed", "remote/x/ops.git"]);

    Self { root }
  }

  fn path(&self, relative: &str) -> PathBuf {
    self.root.path().join(relative)
  }

  fn bare(&self) -> PathBuf {
    self.path("remote/x/ops.git")
  }

  fn executor(&self) -> LocalExecutor<GitCli> {
    let gh = self.path("bin/gh").display().to_string();
    LocalExecutor::new(
      GitCli::with_programs("git", gh),
      store(),
      ExecuteConfig::new(self.path("jobs")),
    )
    .with_pr_retry(1, Duration::from_millis(1))
  }

  /// Simulate the pull request being merged and its branch deleted.
  fn merge_and_delete_branch(&self) {
    git(&self.bare(), &["branch", "-D", BRANCH]);
    std::fs::remove_file(self.path("bin/opened")).unwrap();
  }

  /// Run `f` with `HOME` pointing at the scratch git config.
  fn with_home<T>(&self, f: impl FnOnce() -> T) -> T {
    let home = self.path("home");
    temp_env::with_var("HOME", Some(home.as_os_str()), f)
  }
}

fn deploy_job() -> JobSpec {
  let spec = DeploySpec::new(
    RepoSpec::github("x", "ops", "main"),
    GitIdentity::new("deploy-bot", "bot@example.com"),
    SecretHandle::new("/LaravelApp/Prod/Cd/Git/SshKey"),
    token(),
    default_descriptor_path("laravel-app"),
  );
  prepare_deploy_job(&spec, &ctx(), &[ContainerBinding::new("app", "app")])
}

fn run_ctx(source: &Path) -> RunContext {
  let revision = revision("1234567890ab");
  RunContext {
    pipeline: "laravel-app-web-prod-pipeline".to_string(),
    tag: revision.short_tag(),
    source: SourceArtifact {
      revision: revision.clone(),
      path: Some(source.to_path_buf()),
    },
    revision,
  }
}

fn deploy_twice(remote: &OpsRemote, between: impl FnOnce()) -> (DeployReport, DeployReport) {
  remote.with_home(|| {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let executor = remote.executor();
    let job = deploy_job();
    let ctx = run_ctx(&remote.path("seed"));

    let first = rt.block_on(executor.run_job(&job, &ctx)).unwrap().deploy.unwrap();
    between();
    let second = rt
      .block_on(executor.run_job(&job, &ctx))
      .unwrap_or_else(|e| panic!("second deploy failed: {e}"))
      .deploy
      .unwrap();
    (first, second)
  })
}

#[test]
#[serial]
fn rerun_reuses_the_existing_branch_and_pull_request() {
  let remote = OpsRemote::new();
  let (first, second) = deploy_twice(&remote, || {});

  assert_eq!(first.branch, BRANCH);
  assert!(!first.branch_existed);
  assert!(first.pushed);
  assert_eq!(first.outcome, DeployOutcome::Opened);

  assert!(second.branch_existed);
  assert!(!second.committed);
  assert!(!second.pushed);
  assert_eq!(second.outcome, DeployOutcome::AlreadyOpen);

  let descriptor = git(&remote.bare(), &["show", &format!("{BRANCH}:{DESCRIPTOR}")]);
  assert!(descriptor.contains(":1234567"), "unexpected descriptor: {descriptor}");
}

#[test]
#[serial]
fn rerun_recreates_a_deleted_branch_from_the_current_base() {
  let remote = OpsRemote::new();
  let (_, second) = deploy_twice(&remote, || {
    remote.merge_and_delete_branch();
    // The base moves on while the old clone sits in the workspace.
    let upstream = remote.path("upstream");
    git(remote.root.path(), &["clone", "-q", "remote/x/ops.git", "upstream"]);
    std::fs::write(upstream.join("NOTES.md"), "moved on\n").unwrap();
    git(&upstream, &["add", "NOTES.md"]);
    git(&upstream, &["commit", "-q", "-m", "advance main"]);
    git(&upstream, &["push", "-q", "origin", "main"]);
  });

  assert!(!second.branch_existed);
  assert!(second.committed);
  assert!(second.pushed);
  assert_eq!(second.outcome, DeployOutcome::Opened);

  let files = git(&remote.bare(), &["ls-tree", "-r", "--name-only", BRANCH]);
  assert!(files.lines().any(|f| f == "NOTES.md"), "branch not based on current main: {files}");
  assert!(files.lines().any(|f| f == DESCRIPTOR));
  let parent = git(&remote.bare(), &["rev-parse", &format!("{BRANCH}^")]);
  assert_eq!(parent, git(&remote.bare(), &["rev-parse", "main"]));
}
