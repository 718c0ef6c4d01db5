//! The pipeline file.
//!
//! ```toml
//! version = 1
//!
//! [context]
//! app = "laravel-app"
//! env = "prod"
//! account = "123456789012"
//! region = "ap-northeast-1"
//!
//! [[services]]
//! name = "web"
//! source = { owner = { param = "/Cd/Git/Owner" }, repo = "y", branch = "main", credential = { secret = "/Cd/Git/Token", field = "github-token" } }
//! builds = [{ repository = "app", dockerfile = "docker/app/Dockerfile" }]
//!
//! [services.deploy]
//! owner = "x"
//! repo = "ops"
//! branch = "main"
//! identity = { name = "deploy-bot", email = "bot@example.com" }
//! ssh_key = { secret = "github-sshkey" }
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{ConfigError, DeployContext, FeatureFlags, SCHEMA_VERSION};
use crate::build::{BuildEnvironment, BuildSpec};
use crate::deploy::{CollisionPolicy, ContainerBinding, DeploySpec, GitIdentity, default_descriptor_path};
use crate::params::{ParamResolver, ParameterStore, SecretHandle};
use crate::pipeline::{DefinitionError, GITHUB_HOST, PipelineDefinition, RepoSpec, SourceSpec};

/// A literal or a reference into the parameter store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueRef {
  Literal(String),
  Param {
    param: String,
  },
  Secret {
    secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    field: Option<String>,
  },
}

impl ValueRef {
  pub fn resolve_plain(&self, resolver: &ParamResolver<'_>) -> Result<String, DefinitionError> {
    match self {
      ValueRef::Literal(value) => Ok(value.clone()),
      ValueRef::Param { param } => Ok(resolver.plain(param)?),
      ValueRef::Secret { secret, .. } => Ok(resolver.plain(secret)?),
    }
  }

  /// Resolve to a secret handle. `what` names the setting for errors.
  pub fn resolve_secret(&self, resolver: &ParamResolver<'_>, what: &str) -> Result<SecretHandle, DefinitionError> {
    match self {
      ValueRef::Literal(_) => Err(DefinitionError::LiteralSecret(what.to_string())),
      ValueRef::Param { param } => Ok(resolver.secret(param, None)?),
      ValueRef::Secret { secret, field } => Ok(resolver.secret(secret, field.as_deref())?),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceEntry {
  pub owner: ValueRef,
  pub repo: ValueRef,
  pub branch: ValueRef,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub credential: Option<ValueRef>,
}

fn default_context() -> String {
  ".".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildEntry {
  pub repository: String,
  pub dockerfile: String,
  #[serde(default = "default_context")]
  pub context: String,
  #[serde(default)]
  pub environment: BuildEnvironment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityEntry {
  pub name: ValueRef,
  pub email: ValueRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeployEntry {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub host: Option<String>,
  pub owner: ValueRef,
  pub repo: ValueRef,
  pub branch: ValueRef,
  pub identity: IdentityEntry,
  pub ssh_key: ValueRef,
  /// Pull request token. Defaults to the source credential.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub token: Option<ValueRef>,
  /// Descriptor path in the ops repository. Defaults to
  /// `<app>/imagedefinitions.json`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub descriptor: Option<String>,
  #[serde(default)]
  pub on_collision: CollisionPolicy,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub containers: Vec<ContainerBinding>,
  #[serde(default)]
  pub environment: BuildEnvironment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceEntry {
  pub name: String,
  pub source: SourceEntry,
  #[serde(default)]
  pub builds: Vec<BuildEntry>,
  pub deploy: DeployEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineFile {
  pub version: u32,
  pub context: DeployContext,
  #[serde(default)]
  pub features: FeatureFlags,
  #[serde(default)]
  pub services: Vec<ServiceEntry>,
}

impl PipelineFile {
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    let file = Self::from_toml_str(&content)?;
    info!(path = %path.display(), services = file.services.len(), "loaded pipeline file");
    Ok(file)
  }

  pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
    let file: PipelineFile = toml::from_str(content)?;
    if file.version != SCHEMA_VERSION {
      return Err(ConfigError::UnsupportedVersion(file.version));
    }
    if file.services.is_empty() {
      return Err(ConfigError::NoServices);
    }
    let mut seen = HashSet::new();
    for service in &file.services {
      if !seen.insert(service.name.as_str()) {
        return Err(ConfigError::DuplicateService(service.name.clone()));
      }
    }
    Ok(file)
  }

  /// A resolver over `store` in this file's namespace.
  pub fn resolver<'a>(&self, store: &'a dyn ParameterStore) -> ParamResolver<'a> {
    ParamResolver::new(store, self.context.namespace())
  }

  pub fn service(&self, name: &str) -> Option<&ServiceEntry> {
    self.services.iter().find(|service| service.name == name)
  }

  /// Resolve every reference and build one definition per service.
  ///
  /// Fails on the first error; repository names must be unique across the
  /// whole file.
  pub fn definitions(&self, resolver: &ParamResolver<'_>) -> Result<Vec<PipelineDefinition>, DefinitionError> {
    let mut repositories = HashSet::new();
    let mut definitions = Vec::with_capacity(self.services.len());

    for service in &self.services {
      for build in &service.builds {
        if !repositories.insert(build.repository.as_str()) {
          return Err(DefinitionError::DuplicateRepository(build.repository.clone()).in_service(&service.name));
        }
      }
      let definition = self
        .definition_for(service, resolver)
        .map_err(|err| err.in_service(&service.name))?;
      debug!(pipeline = %definition.name(), "resolved pipeline definition");
      definitions.push(definition);
    }

    Ok(definitions)
  }

  /// Resolve a single service.
  pub fn definition(&self, name: &str, resolver: &ParamResolver<'_>) -> Option<Result<PipelineDefinition, DefinitionError>> {
    let service = self.service(name)?;
    Some(
      self
        .definition_for(service, resolver)
        .map_err(|err| err.in_service(&service.name)),
    )
  }

  fn definition_for(
    &self,
    service: &ServiceEntry,
    resolver: &ParamResolver<'_>,
  ) -> Result<PipelineDefinition, DefinitionError> {
    let mut source = SourceSpec::new(
      service.source.owner.resolve_plain(resolver)?,
      service.source.repo.resolve_plain(resolver)?,
      service.source.branch.resolve_plain(resolver)?,
    );
    if let Some(credential) = &service.source.credential {
      source = source.with_credential(credential.resolve_secret(resolver, "source.credential")?);
    }

    let deploy = &service.deploy;
    let token = match &deploy.token {
      Some(token) => token.resolve_secret(resolver, "deploy.token")?,
      None => source
        .credential
        .clone()
        .ok_or_else(|| DefinitionError::MissingCredential(format!("{} (deploy.token)", service.name)))?,
    };
    let ops_repo = RepoSpec {
      host: deploy.host.clone().unwrap_or_else(|| GITHUB_HOST.to_string()),
      owner: deploy.owner.resolve_plain(resolver)?,
      repo: deploy.repo.resolve_plain(resolver)?,
      branch: deploy.branch.resolve_plain(resolver)?,
    };
    let identity = GitIdentity::new(
      deploy.identity.name.resolve_plain(resolver)?,
      deploy.identity.email.resolve_plain(resolver)?,
    );
    let descriptor_path = deploy
      .descriptor
      .clone()
      .unwrap_or_else(|| default_descriptor_path(&self.context.app));

    let mut deploy_spec = DeploySpec::new(
      ops_repo,
      identity,
      deploy.ssh_key.resolve_secret(resolver, "deploy.ssh_key")?,
      token,
      descriptor_path,
    )
    .with_containers(deploy.containers.clone())
    .with_collision_policy(deploy.on_collision);
    deploy_spec.environment = deploy.environment.clone();

    let builds = service.builds.iter().map(|entry| BuildSpec {
      repository: entry.repository.clone(),
      dockerfile: entry.dockerfile.clone(),
      context: entry.context.clone(),
      environment: entry.environment.clone(),
    });

    PipelineDefinition::builder(&service.name, self.context.clone())
      .features(self.features)
      .source(source)
      .images(builds)
      .deploy(deploy_spec)
      .build()
  }
}
