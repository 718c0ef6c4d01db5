//! Image build jobs.
//!
//! Each [`BuildSpec`] becomes one independent image build job: log in to the
//! registry, derive the short tag, build, tag with the registry URI, push.
//! This module only emits the job specification; running it is up to the
//! execution backend.

mod types;

pub use types::*;

use std::collections::BTreeMap;

use crate::config::{DeployContext, FeatureFlags};
use crate::step::{EnvVar, JobKind, JobSpec, Step};

pub const MAX_REPOSITORY_LEN: usize = 256;

/// Backend action name for a repository's build job.
pub fn action_name(repository: &str) -> String {
  format!("{repository}-ImageBuild")
}

/// Check a registry repository name: lowercase alphanumeric path components
/// separated by single `.`, `_` or `-` characters.
pub fn validate_repository_name(name: &str) -> Result<(), &'static str> {
  if name.len() < 2 || name.len() > MAX_REPOSITORY_LEN {
    return Err("must be between 2 and 256 characters");
  }

  for component in name.split('/') {
    if component.is_empty() {
      return Err("contains an empty path component");
    }
    let mut previous_sep = true;
    for c in component.chars() {
      match c {
        'a'..='z' | '0'..='9' => previous_sep = false,
        '.' | '_' | '-' => {
          if previous_sep {
            return Err("separators must sit between alphanumeric characters");
          }
          previous_sep = true;
        }
        _ => return Err("only lowercase letters, digits, '.', '_', '-' and '/' are allowed"),
      }
    }
    if previous_sep {
      return Err("separators must sit between alphanumeric characters");
    }
  }

  Ok(())
}

/// Job variables shared by every job of a deploy context.
pub(crate) fn context_variables(ctx: &DeployContext) -> BTreeMap<String, EnvVar> {
  BTreeMap::from([
    ("AWS_ACCOUNT_ID".to_string(), EnvVar::Plain(ctx.account.clone())),
    ("AWS_REGION".to_string(), EnvVar::Plain(ctx.region.clone())),
    ("ENV".to_string(), EnvVar::Plain(ctx.env.clone())),
    ("REGISTRY_HOST".to_string(), EnvVar::Plain(ctx.registry_host())),
  ])
}

/// Build the job specification for one image.
pub fn image_build_job(spec: &BuildSpec, ctx: &DeployContext, features: &FeatureFlags) -> JobSpec {
  let mut environment = spec.environment.clone();
  match environment.cache {
    None if features.docker_layer_cache => environment.cache = Some(CacheMode::DockerLayer),
    Some(CacheMode::DockerLayer) if !features.docker_layer_cache => environment.cache = None,
    _ => {}
  }

  let mut variables: BTreeMap<String, EnvVar> = environment
    .variables
    .iter()
    .map(|(name, value)| (name.clone(), EnvVar::Plain(value.clone())))
    .collect();
  variables.extend(context_variables(ctx));
  variables.insert("REPO_NAME".to_string(), EnvVar::Plain(spec.repository.clone()));
  variables.insert("DOCKERFILE".to_string(), EnvVar::Plain(spec.dockerfile.clone()));

  let local_image = "$${var:REPO_NAME}:$${tag}".to_string();
  let remote_image = "$${var:REGISTRY_HOST}/$${var:REPO_NAME}:$${tag}".to_string();

  let steps = vec![
    Step::RegistryLogin {
      registry: "$${var:REGISTRY_HOST}".to_string(),
      region: "$${var:AWS_REGION}".to_string(),
    },
    Step::DeriveTag,
    Step::DockerBuild {
      dockerfile: "$${var:DOCKERFILE}".to_string(),
      image: local_image.clone(),
      context: spec.context.clone(),
    },
    Step::DockerTag {
      source: local_image,
      target: remote_image.clone(),
    },
    Step::DockerPush { image: remote_image },
  ];

  JobSpec {
    name: action_name(&spec.repository),
    kind: JobKind::ImageBuild,
    environment,
    variables,
    steps,
  }
}
