use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Compute size requested from the build executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeClass {
  #[default]
  Small,
  Medium,
  Large,
}

impl ComputeClass {
  /// Backend compute type identifier.
  pub fn backend_name(&self) -> &'static str {
    match self {
      ComputeClass::Small => "BUILD_GENERAL1_SMALL",
      ComputeClass::Medium => "BUILD_GENERAL1_MEDIUM",
      ComputeClass::Large => "BUILD_GENERAL1_LARGE",
    }
  }
}

/// Executor-local cache kept between builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
  DockerLayer,
  Source,
}

impl CacheMode {
  pub fn backend_name(&self) -> &'static str {
    match self {
      CacheMode::DockerLayer => "LOCAL_DOCKER_LAYER_CACHE",
      CacheMode::Source => "LOCAL_SOURCE_CACHE",
    }
  }
}

pub const DEFAULT_BUILD_IMAGE: &str = "aws/codebuild/standard:7.0";

fn default_image() -> String {
  DEFAULT_BUILD_IMAGE.to_string()
}

fn default_privileged() -> bool {
  true
}

/// Executor environment for a job. Forwarded to the backend as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildEnvironment {
  #[serde(default = "default_image")]
  pub image: String,

  #[serde(default)]
  pub compute: ComputeClass,

  /// Docker builds need a privileged executor.
  #[serde(default = "default_privileged")]
  pub privileged: bool,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cache: Option<CacheMode>,

  /// Extra plain variables added to the job.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub variables: BTreeMap<String, String>,
}

impl Default for BuildEnvironment {
  fn default() -> Self {
    Self {
      image: default_image(),
      compute: ComputeClass::default(),
      privileged: default_privileged(),
      cache: None,
      variables: BTreeMap::new(),
    }
  }
}

impl BuildEnvironment {
  pub fn with_compute(mut self, compute: ComputeClass) -> Self {
    self.compute = compute;
    self
  }

  pub fn with_cache(mut self, cache: CacheMode) -> Self {
    self.cache = Some(cache);
    self
  }

  pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.variables.insert(name.into(), value.into());
    self
  }
}

/// One image produced from the source checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
  /// Registry repository name. Unique within a pipeline.
  pub repository: String,
  pub dockerfile: String,
  pub context: String,
  pub environment: BuildEnvironment,
}

impl BuildSpec {
  pub fn new(repository: impl Into<String>, dockerfile: impl Into<String>) -> Self {
    Self {
      repository: repository.into(),
      dockerfile: dockerfile.into(),
      context: ".".to_string(),
      environment: BuildEnvironment::default(),
    }
  }

  pub fn with_context(mut self, context: impl Into<String>) -> Self {
    self.context = context.into();
    self
  }

  pub fn with_environment(mut self, environment: BuildEnvironment) -> Self {
    self.environment = environment;
    self
  }
}
