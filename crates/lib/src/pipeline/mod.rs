//! Pipeline definitions.
//!
//! A [`PipelineDefinition`] names one service's Source → Build[] →
//! PrepareDeploy pipeline. It is assembled once per service and environment
//! through [`PipelineDefinition::builder`] and is immutable afterwards. All
//! validation happens in [`PipelineBuilder::build`], so a definition that
//! exists is always complete: there are no partial pipelines.

mod graph;
mod plan;
mod trigger;
mod types;

pub use graph::*;
pub use plan::*;
pub use trigger::*;
pub use types::*;

use std::collections::HashSet;

use tracing::debug;

use crate::build::{self, BuildSpec, validate_repository_name};
use crate::config::{DeployContext, FeatureFlags};
use crate::deploy::{self, DeploySpec};
use crate::step::{check_extra_variables, validate_branch};

/// Action name of the source stage.
pub const SOURCE_ACTION: &str = "GitHub-Source";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDefinition {
  service: String,
  context: DeployContext,
  features: FeatureFlags,
  source: SourceSpec,
  builds: Vec<BuildSpec>,
  deploy: DeploySpec,
}

impl PipelineDefinition {
  pub fn builder(service: impl Into<String>, context: DeployContext) -> PipelineBuilder {
    PipelineBuilder {
      service: service.into(),
      context,
      features: FeatureFlags::default(),
      source: None,
      builds: Vec::new(),
      deploy: None,
    }
  }

  pub fn service(&self) -> &str {
    &self.service
  }

  pub fn context(&self) -> &DeployContext {
    &self.context
  }

  pub fn features(&self) -> &FeatureFlags {
    &self.features
  }

  pub fn source(&self) -> &SourceSpec {
    &self.source
  }

  pub fn builds(&self) -> &[BuildSpec] {
    &self.builds
  }

  pub fn deploy(&self) -> &DeploySpec {
    &self.deploy
  }

  /// Stable identity: `<app>-<service>-<env>-pipeline`.
  pub fn name(&self) -> String {
    format!("{}-{}-{}-pipeline", self.context.app, self.service, self.context.env)
  }

  pub fn trigger(&self) -> Trigger {
    let pull_requests = if self.features.pull_request_builds {
      PullRequestAction::ALL.to_vec()
    } else {
      Vec::new()
    };
    Trigger {
      owner: self.source.owner.clone(),
      repo: self.source.repo.clone(),
      branch: self.source.branch.clone(),
      pull_requests,
    }
  }

  /// Expand the definition into its staged plan and validate every job.
  pub fn plan(&self) -> Result<PipelinePlan, DefinitionError> {
    let build_actions = self
      .builds
      .iter()
      .map(|spec| {
        let job = build::image_build_job(spec, &self.context, &self.features);
        Action {
          name: job.name.clone(),
          kind: ActionKind::Job(job),
        }
      })
      .collect::<Vec<_>>();

    let bindings = self.deploy.bindings(&self.builds);
    let deploy_job = deploy::prepare_deploy_job(&self.deploy, &self.context, &bindings);

    let plan = PipelinePlan {
      name: self.name(),
      service: self.service.clone(),
      trigger: self.trigger(),
      stages: vec![
        Stage {
          kind: StageKind::Source,
          actions: vec![Action {
            name: SOURCE_ACTION.to_string(),
            kind: ActionKind::Source(self.source.clone()),
          }],
        },
        Stage {
          kind: StageKind::Build,
          actions: build_actions,
        },
        Stage {
          kind: StageKind::PrepareDeploy,
          actions: vec![Action {
            name: deploy_job.name.clone(),
            kind: ActionKind::Job(deploy_job),
          }],
        },
      ],
    };

    for job in plan.jobs() {
      job.validate().map_err(|source| DefinitionError::Job {
        job: job.name.clone(),
        source,
      })?;
    }

    debug!(pipeline = %plan.name, jobs = plan.jobs().count(), "planned pipeline");
    Ok(plan)
  }
}

pub struct PipelineBuilder {
  service: String,
  context: DeployContext,
  features: FeatureFlags,
  source: Option<SourceSpec>,
  builds: Vec<BuildSpec>,
  deploy: Option<DeploySpec>,
}

impl PipelineBuilder {
  pub fn features(mut self, features: FeatureFlags) -> Self {
    self.features = features;
    self
  }

  pub fn source(mut self, source: SourceSpec) -> Self {
    self.source = Some(source);
    self
  }

  pub fn image(mut self, build: BuildSpec) -> Self {
    self.builds.push(build);
    self
  }

  pub fn images(mut self, builds: impl IntoIterator<Item = BuildSpec>) -> Self {
    self.builds.extend(builds);
    self
  }

  pub fn deploy(mut self, deploy: DeploySpec) -> Self {
    self.deploy = Some(deploy);
    self
  }

  pub fn build(self) -> Result<PipelineDefinition, DefinitionError> {
    if !is_service_name(&self.service) {
      return Err(DefinitionError::InvalidService(self.service));
    }
    let name = format!("{}-{}-{}-pipeline", self.context.app, self.service, self.context.env);

    let source = self.source.ok_or_else(|| DefinitionError::MissingSource(name.clone()))?;
    if source.credential.is_none() {
      return Err(DefinitionError::MissingCredential(name));
    }
    validate_branch(&source.branch).map_err(DefinitionError::Branch)?;

    if self.builds.is_empty() {
      return Err(DefinitionError::NoBuilds(name));
    }
    let mut repositories = HashSet::new();
    for spec in &self.builds {
      validate_repository_name(&spec.repository).map_err(|reason| DefinitionError::InvalidRepository {
        name: spec.repository.clone(),
        reason,
      })?;
      if !repositories.insert(spec.repository.as_str()) {
        return Err(DefinitionError::DuplicateRepository(spec.repository.clone()));
      }
      check_extra_variables(spec.environment.variables.keys()).map_err(|source| DefinitionError::Job {
        job: build::action_name(&spec.repository),
        source,
      })?;
    }

    let deploy = self.deploy.ok_or_else(|| DefinitionError::MissingDeploy(name.clone()))?;
    validate_branch(&deploy.ops_repo.branch).map_err(DefinitionError::Branch)?;

    let mut containers = HashSet::new();
    for binding in &deploy.containers {
      if !containers.insert(binding.name.as_str()) {
        return Err(DefinitionError::DuplicateContainer(binding.name.clone()));
      }
      if !repositories.contains(binding.repository.as_str()) {
        return Err(DefinitionError::UnknownRepository {
          name: binding.name.clone(),
          repository: binding.repository.clone(),
        });
      }
    }

    check_extra_variables(deploy.environment.variables.keys()).map_err(|source| DefinitionError::Job {
      job: deploy::action_name(&self.context),
      source,
    })?;

    let path = deploy.descriptor_path.as_str();
    if path.is_empty() || path.starts_with('/') || path.split('/').any(|part| part == ".." || part.is_empty()) {
      return Err(DefinitionError::InvalidDescriptorPath(deploy.descriptor_path.clone()));
    }

    Ok(PipelineDefinition {
      service: self.service,
      context: self.context,
      features: self.features,
      source,
      builds: self.builds,
      deploy,
    })
  }
}

fn is_service_name(name: &str) -> bool {
  !name.is_empty()
    && !name.starts_with('-')
    && !name.ends_with('-')
    && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
