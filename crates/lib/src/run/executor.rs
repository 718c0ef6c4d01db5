//! The execution backend contract.

use std::future::Future;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::deploy::DeployReport;
use crate::error::ErrorClass;
use crate::params::ParamError;
use crate::pipeline::SourceSpec;
use crate::revision::{ImageTag, Revision};
use crate::step::{JobKind, JobSpec};

#[derive(Debug, Error)]
pub enum JobError {
  #[error("source checkout failed: {message}")]
  Source { message: String },

  #[error("build job {job} failed: {message}")]
  Build { job: String, message: String },

  #[error("deploy job {job} failed: {message}")]
  DeployPreparation { job: String, message: String },

  #[error("job {job}: {source}")]
  Secret {
    job: String,
    #[source]
    source: ParamError,
  },
}

impl JobError {
  /// A failure of `job`, classified by the job's kind.
  pub fn for_job(job: &JobSpec, message: impl Into<String>) -> Self {
    match job.kind {
      JobKind::ImageBuild => JobError::Build {
        job: job.name.clone(),
        message: message.into(),
      },
      JobKind::PrepareDeploy => JobError::DeployPreparation {
        job: job.name.clone(),
        message: message.into(),
      },
    }
  }

  pub fn class(&self) -> ErrorClass {
    match self {
      JobError::Source { .. } | JobError::Build { .. } => ErrorClass::Build,
      JobError::DeployPreparation { .. } => ErrorClass::DeployPreparation,
      JobError::Secret { .. } => ErrorClass::SecretResolution,
    }
  }
}

/// The checked-out source of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceArtifact {
  pub revision: Revision,
  /// Local checkout, when the backend keeps one.
  pub path: Option<PathBuf>,
}

/// What every job of a run shares.
#[derive(Debug, Clone)]
pub struct RunContext {
  pub pipeline: String,
  pub revision: Revision,
  pub tag: ImageTag,
  pub source: SourceArtifact,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReport {
  pub job: String,
  pub kind: JobKind,
  /// Number of steps run.
  pub steps: usize,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub deploy: Option<DeployReport>,
}

/// Runs the jobs of a plan.
///
/// Jobs of one build wave are run concurrently; implementations must not
/// rely on any ordering among them.
pub trait JobExecutor: Send + Sync + 'static {
  fn fetch_source(
    &self,
    source: &SourceSpec,
    revision: &Revision,
  ) -> impl Future<Output = Result<SourceArtifact, JobError>> + Send;

  fn run_job(&self, job: &JobSpec, ctx: &RunContext) -> impl Future<Output = Result<JobReport, JobError>> + Send;
}
