//! The staged plan of a pipeline: Source, Build (fan-out), PrepareDeploy.

use serde::{Deserialize, Serialize};

use super::trigger::Trigger;
use super::types::SourceSpec;
use crate::step::{JobKind, JobSpec};
use crate::util::hash::Fingerprintable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StageKind {
  Source,
  Build,
  PrepareDeploy,
}

impl StageKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      StageKind::Source => "Source",
      StageKind::Build => "Build",
      StageKind::PrepareDeploy => "PrepareDeploy",
    }
  }
}

impl std::fmt::Display for StageKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
  Source(SourceSpec),
  Job(JobSpec),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
  pub name: String,
  pub kind: ActionKind,
}

impl Action {
  pub fn job(&self) -> Option<&JobSpec> {
    match &self.kind {
      ActionKind::Job(job) => Some(job),
      ActionKind::Source(_) => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
  pub kind: StageKind,
  pub actions: Vec<Action>,
}

/// Backend-neutral description of one pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelinePlan {
  pub name: String,
  pub service: String,
  pub trigger: Trigger,
  pub stages: Vec<Stage>,
}

impl Fingerprintable for PipelinePlan {}

impl PipelinePlan {
  pub fn stage(&self, kind: StageKind) -> Option<&Stage> {
    self.stages.iter().find(|stage| stage.kind == kind)
  }

  pub fn source(&self) -> Option<&SourceSpec> {
    self.stage(StageKind::Source)?.actions.iter().find_map(|action| match &action.kind {
      ActionKind::Source(source) => Some(source),
      ActionKind::Job(_) => None,
    })
  }

  pub fn jobs(&self) -> impl Iterator<Item = &JobSpec> {
    self.stages.iter().flat_map(|stage| stage.actions.iter().filter_map(Action::job))
  }

  pub fn build_jobs(&self) -> impl Iterator<Item = &JobSpec> {
    self.jobs().filter(|job| job.kind == JobKind::ImageBuild)
  }

  pub fn deploy_job(&self) -> Option<&JobSpec> {
    self.jobs().find(|job| job.kind == JobKind::PrepareDeploy)
  }

  pub fn job(&self, name: &str) -> Option<&JobSpec> {
    self.jobs().find(|job| job.name == name)
  }
}
