use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorClass;
use crate::params::{ParamError, SecretHandle};
use crate::step::StepError;

pub const GITHUB_HOST: &str = "github.com";

fn default_host() -> String {
  GITHUB_HOST.to_string()
}

/// Errors raised while assembling a pipeline definition or its plan.
#[derive(Debug, Error)]
pub enum DefinitionError {
  #[error("invalid service name '{0}'")]
  InvalidService(String),

  #[error("pipeline {0} has no source")]
  MissingSource(String),

  #[error("pipeline {0}: source has no credential reference")]
  MissingCredential(String),

  #[error("pipeline {0} has no deploy stage")]
  MissingDeploy(String),

  #[error("pipeline {0} declares no image builds")]
  NoBuilds(String),

  #[error("repository '{0}' is declared more than once")]
  DuplicateRepository(String),

  #[error("invalid repository name '{name}': {reason}")]
  InvalidRepository { name: String, reason: &'static str },

  #[error("container '{0}' is bound more than once")]
  DuplicateContainer(String),

  #[error("container '{name}' is bound to undeclared repository '{repository}'")]
  UnknownRepository { name: String, repository: String },

  #[error("invalid descriptor path '{0}': must be a relative path inside the repository")]
  InvalidDescriptorPath(String),

  #[error("invalid branch: {0}")]
  Branch(#[source] StepError),

  #[error("job {job}: {source}")]
  Job {
    job: String,
    #[source]
    source: StepError,
  },

  #[error("'{0}' must reference the parameter store, not hold a literal secret")]
  LiteralSecret(String),

  #[error("parameter resolution failed: {0}")]
  Param(#[from] ParamError),

  #[error("service {service}: {source}")]
  Service {
    service: String,
    #[source]
    source: Box<DefinitionError>,
  },

  #[error("stage graph contains a cycle")]
  Cycle,
}

impl DefinitionError {
  pub fn class(&self) -> ErrorClass {
    match self {
      DefinitionError::Param(_) => ErrorClass::SecretResolution,
      DefinitionError::Service { source, .. } => source.class(),
      _ => ErrorClass::Configuration,
    }
  }

  pub(crate) fn in_service(self, service: &str) -> Self {
    DefinitionError::Service {
      service: service.to_string(),
      source: Box::new(self),
    }
  }
}

/// Where the pipeline's source originates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
  pub owner: String,
  pub repo: String,
  pub branch: String,
  /// OAuth token used to read the repository.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub credential: Option<SecretHandle>,
}

impl SourceSpec {
  pub fn new(owner: impl Into<String>, repo: impl Into<String>, branch: impl Into<String>) -> Self {
    Self {
      owner: owner.into(),
      repo: repo.into(),
      branch: branch.into(),
      credential: None,
    }
  }

  pub fn with_credential(mut self, credential: SecretHandle) -> Self {
    self.credential = Some(credential);
    self
  }

  /// `owner/repo`
  pub fn slug(&self) -> String {
    format!("{}/{}", self.owner, self.repo)
  }

  pub fn clone_url(&self) -> String {
    format!("https://{GITHUB_HOST}/{}/{}.git", self.owner, self.repo)
  }
}

/// A git repository and branch, such as the operations repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSpec {
  #[serde(default = "default_host")]
  pub host: String,
  pub owner: String,
  pub repo: String,
  /// Base branch pull requests target.
  pub branch: String,
}

impl RepoSpec {
  pub fn github(owner: impl Into<String>, repo: impl Into<String>, branch: impl Into<String>) -> Self {
    Self {
      host: default_host(),
      owner: owner.into(),
      repo: repo.into(),
      branch: branch.into(),
    }
  }

  pub fn slug(&self) -> String {
    format!("{}/{}", self.owner, self.repo)
  }

  pub fn ssh_url(&self) -> String {
    format!("git@{}:{}/{}.git", self.host, self.owner, self.repo)
  }
}
