use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use super::executor::{JobError, JobReport};
use super::state::{InvalidTransition, RunState};
use crate::deploy::DeployReport;
use crate::error::ErrorClass;
use crate::pipeline::DefinitionError;
use crate::revision::{ImageTag, Revision};

/// Errors that stop a run from being executed at all. Job failures are not
/// errors here; they end the run in `Failed`.
#[derive(Debug, Error)]
pub enum RunError {
  #[error(transparent)]
  Definition(#[from] DefinitionError),

  #[error(transparent)]
  Transition(#[from] InvalidTransition),
}

/// Configuration for the local backend.
#[derive(Debug, Clone)]
pub struct ExecuteConfig {
  /// Maximum number of jobs to run in parallel.
  pub parallelism: usize,

  /// Root under which job working directories are created.
  pub workspace: PathBuf,

  /// Existing checkout to build from instead of cloning the source.
  pub source_dir: Option<PathBuf>,

  /// Shell used for shell steps. Defaults to `/bin/sh`.
  pub shell: Option<String>,

  /// Parent environment variables passed through to shell steps. A trailing
  /// `*` matches a prefix. Registry login and image pushes read their
  /// credentials from these.
  pub forward_env: Vec<String>,
}

/// Variables shell steps inherit by default.
pub const DEFAULT_FORWARD_ENV: &[&str] = &["AWS_*", "DOCKER_*"];

impl ExecuteConfig {
  pub fn new(workspace: impl Into<PathBuf>) -> Self {
    Self {
      parallelism: num_cpus(),
      workspace: workspace.into(),
      source_dir: None,
      shell: None,
      forward_env: DEFAULT_FORWARD_ENV.iter().map(|name| name.to_string()).collect(),
    }
  }

  pub fn with_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.source_dir = Some(dir.into());
    self
  }

  pub fn with_forward_env(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
    self.forward_env = names.into_iter().map(Into::into).collect();
    self
  }

  pub fn with_parallelism(mut self, parallelism: usize) -> Self {
    self.parallelism = parallelism.max(1);
    self
  }
}

impl Default for ExecuteConfig {
  fn default() -> Self {
    Self::new(std::env::temp_dir().join("deckhand"))
  }
}

fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}

/// A failed job and its error.
#[derive(Debug, Serialize)]
pub struct JobFailure {
  pub job: String,
  pub class: ErrorClass,
  pub message: String,
}

impl JobFailure {
  pub fn new(job: impl Into<String>, error: &JobError) -> Self {
    Self {
      job: job.into(),
      class: error.class(),
      message: error.to_string(),
    }
  }
}

/// Outcome of one pipeline run.
#[derive(Debug, Serialize)]
pub struct RunResult {
  pub pipeline: String,
  pub revision: Revision,
  pub tag: ImageTag,
  pub state: RunState,
  pub history: Vec<RunState>,
  /// Completed jobs, in completion order.
  pub jobs: Vec<JobReport>,
  pub failed: Option<JobFailure>,
  /// Actions that never ran or were aborted.
  pub skipped: Vec<String>,
}

impl RunResult {
  pub fn is_success(&self) -> bool {
    self.state == RunState::Succeeded
  }

  pub fn deploy(&self) -> Option<&DeployReport> {
    self.jobs.iter().find_map(|job| job.deploy.as_ref())
  }

  pub fn job(&self, name: &str) -> Option<&JobReport> {
    self.jobs.iter().find(|job| job.job == name)
  }
}
