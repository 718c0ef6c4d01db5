use serde::{Deserialize, Serialize};

use crate::params::Namespace;

/// Explicit deployment context passed to every constructor that needs the
/// account, region or environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeployContext {
  pub app: String,
  pub env: String,
  pub account: String,
  pub region: String,
  /// Registry host override. Defaults to the account's regional registry.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub registry: Option<String>,
}

impl DeployContext {
  pub fn new(
    app: impl Into<String>,
    env: impl Into<String>,
    account: impl Into<String>,
    region: impl Into<String>,
  ) -> Self {
    Self {
      app: app.into(),
      env: env.into(),
      account: account.into(),
      region: region.into(),
      registry: None,
    }
  }

  pub fn with_registry(mut self, registry: impl Into<String>) -> Self {
    self.registry = Some(registry.into());
    self
  }

  /// `<account>.dkr.ecr.<region>.amazonaws.com` unless overridden.
  pub fn registry_host(&self) -> String {
    match &self.registry {
      Some(host) => host.trim_end_matches('/').to_string(),
      None => format!("{}.dkr.ecr.{}.amazonaws.com", self.account, self.region),
    }
  }

  pub fn is_prod(&self) -> bool {
    matches!(self.env.as_str(), "prod" | "production")
  }

  /// Context-scoped identifier: `<app>-<env>-<id>`.
  pub fn cid(&self, id: &str) -> String {
    format!("{}-{}-{}", self.app, self.env, id)
  }

  pub fn namespace(&self) -> Namespace {
    Namespace::new(&self.app, &self.env)
  }
}

/// Feature flags replacing per-revision copies of the pipeline stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeatureFlags {
  /// Keep docker layers between builds on the executor.
  pub docker_layer_cache: bool,
  /// Build images for pull requests against the source branch.
  pub pull_request_builds: bool,
  /// Allow only one in-flight run per service.
  pub serialize_runs: bool,
  /// Cancel a run once a newer push to the same branch arrives.
  pub cancel_superseded: bool,
}

impl Default for FeatureFlags {
  fn default() -> Self {
    Self {
      docker_layer_cache: true,
      pull_request_builds: false,
      serialize_runs: true,
      cancel_superseded: true,
    }
  }
}
