//! Job specifications handed to the execution backend.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Phase, Step, StepError};
use crate::build::BuildEnvironment;
use crate::params::SecretHandle;
use crate::placeholder::{REVISION_VAR, TAG_VAR, is_env_name};

/// A job environment variable. Secrets are carried by handle only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvVar {
  Plain(String),
  Secret(SecretHandle),
}

pub type JobVariables = BTreeMap<String, EnvVar>;

/// Variables every generated job sets itself. Extra environment variables
/// may not reuse these names.
pub const RESERVED_VARIABLES: &[&str] = &[
  "AWS_ACCOUNT_ID",
  "AWS_REGION",
  "ENV",
  "REGISTRY_HOST",
  "REPO_NAME",
  "DOCKERFILE",
  "APP_NAME",
  "GIT_OWNER",
  "GIT_REPO",
  "GIT_BRANCH",
  "GIT_SSH_KEY",
  "GITHUB_TOKEN",
  TAG_VAR,
  REVISION_VAR,
];

/// Reject extra variables that would shadow a generated one.
pub fn check_extra_variables<'a>(names: impl IntoIterator<Item = &'a String>) -> Result<(), StepError> {
  for name in names {
    if RESERVED_VARIABLES.contains(&name.as_str()) {
      return Err(StepError::ReservedVariable(name.clone()));
    }
  }
  Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
  ImageBuild,
  PrepareDeploy,
}

/// Everything a backend needs to run one job: its environment, variables
/// and ordered steps. Never holds a secret value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
  pub name: String,
  pub kind: JobKind,
  pub environment: BuildEnvironment,
  pub variables: JobVariables,
  pub steps: Vec<Step>,
}

impl JobSpec {
  /// Validate variables and steps.
  ///
  /// Steps must be declared in phase order so a phase-grouped rendering
  /// runs them in the same order as the local executor.
  pub fn validate(&self) -> Result<(), StepError> {
    if self.steps.is_empty() {
      return Err(StepError::NoSteps(self.name.clone()));
    }

    for name in self.variables.keys() {
      if !is_env_name(name) {
        return Err(StepError::InvalidVariable(name.clone()));
      }
      if name == TAG_VAR || name == REVISION_VAR {
        return Err(StepError::ReservedVariable(name.clone()));
      }
    }

    let mut previous = Phase::Install;
    for step in &self.steps {
      let phase = step.phase();
      if phase < previous {
        return Err(StepError::PhaseOrder {
          step: step.name(),
          phase,
          previous,
        });
      }
      previous = phase;
      step.validate(&self.variables)?;
    }

    Ok(())
  }

  /// Plain variables, by name.
  pub fn plain_variables(&self) -> BTreeMap<String, String> {
    self
      .variables
      .iter()
      .filter_map(|(name, var)| match var {
        EnvVar::Plain(value) => Some((name.clone(), value.clone())),
        EnvVar::Secret(_) => None,
      })
      .collect()
  }

  /// Secret variables, by name.
  pub fn secret_variables(&self) -> BTreeMap<String, SecretHandle> {
    self
      .variables
      .iter()
      .filter_map(|(name, var)| match var {
        EnvVar::Secret(handle) => Some((name.clone(), handle.clone())),
        EnvVar::Plain(_) => None,
      })
      .collect()
  }

  /// Rendered shell commands grouped by phase, in execution order.
  pub fn phase_commands(&self) -> Result<BTreeMap<Phase, Vec<String>>, StepError> {
    let mut phases: BTreeMap<Phase, Vec<String>> = BTreeMap::new();
    for step in &self.steps {
      phases.entry(step.phase()).or_default().extend(step.commands()?);
    }
    Ok(phases)
  }
}
