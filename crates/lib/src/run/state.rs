//! Run state machine.
//!
//! ```text
//! Idle -> SourceFetching -> Building -> PreparingDeploy -> Succeeded
//!   \__________\_______________\____________\___________-> Failed
//! ```
//!
//! Any non-terminal state may fail. Terminal states accept no event; a
//! re-trigger starts a new run.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::error::ErrorClass;
use crate::pipeline::StageKind;

/// Why a run ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
  Error { class: ErrorClass, message: String },
  /// A newer push to the same branch took over.
  Superseded,
}

impl std::fmt::Display for FailureCause {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      FailureCause::Error { class, message } => write!(f, "{class}: {message}"),
      FailureCause::Superseded => f.write_str("superseded by a newer run"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
  Idle,
  SourceFetching,
  Building,
  PreparingDeploy,
  Succeeded,
  Failed {
    /// Stage that was active, `None` when the run never started.
    stage: Option<StageKind>,
    cause: FailureCause,
  },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
  Triggered,
  SourceReady,
  BuildsSucceeded,
  DeployPrepared,
  StageFailed { stage: StageKind, cause: FailureCause },
  Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition from {from} on {event:?}")]
pub struct InvalidTransition {
  pub from: RunState,
  pub event: RunEvent,
}

impl RunState {
  pub fn is_terminal(&self) -> bool {
    matches!(self, RunState::Succeeded | RunState::Failed { .. })
  }

  /// The stage this state is executing.
  pub fn stage(&self) -> Option<StageKind> {
    match self {
      RunState::SourceFetching => Some(StageKind::Source),
      RunState::Building => Some(StageKind::Build),
      RunState::PreparingDeploy => Some(StageKind::PrepareDeploy),
      RunState::Idle | RunState::Succeeded => None,
      RunState::Failed { stage, .. } => *stage,
    }
  }

  pub fn name(&self) -> &'static str {
    match self {
      RunState::Idle => "Idle",
      RunState::SourceFetching => "SourceFetching",
      RunState::Building => "Building",
      RunState::PreparingDeploy => "PreparingDeploy",
      RunState::Succeeded => "Succeeded",
      RunState::Failed { .. } => "Failed",
    }
  }

  pub fn next(&self, event: &RunEvent) -> Result<RunState, InvalidTransition> {
    let invalid = || InvalidTransition {
      from: self.clone(),
      event: event.clone(),
    };
    if self.is_terminal() {
      return Err(invalid());
    }

    match (self, event) {
      (RunState::Idle, RunEvent::Triggered) => Ok(RunState::SourceFetching),
      (RunState::SourceFetching, RunEvent::SourceReady) => Ok(RunState::Building),
      (RunState::Building, RunEvent::BuildsSucceeded) => Ok(RunState::PreparingDeploy),
      (RunState::PreparingDeploy, RunEvent::DeployPrepared) => Ok(RunState::Succeeded),
      (_, RunEvent::StageFailed { stage, cause }) => Ok(RunState::Failed {
        stage: Some(*stage),
        cause: cause.clone(),
      }),
      (_, RunEvent::Superseded) => Ok(RunState::Failed {
        stage: self.stage(),
        cause: FailureCause::Superseded,
      }),
      _ => Err(invalid()),
    }
  }
}

impl std::fmt::Display for RunState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      RunState::Failed { stage: Some(stage), cause } => write!(f, "Failed at {stage} ({cause})"),
      RunState::Failed { stage: None, cause } => write!(f, "Failed ({cause})"),
      other => f.write_str(other.name()),
    }
  }
}

/// Current state plus every state passed through.
#[derive(Debug, Clone)]
pub struct RunTracker {
  pipeline: String,
  state: RunState,
  history: Vec<RunState>,
}

impl RunTracker {
  pub fn new(pipeline: impl Into<String>) -> Self {
    Self {
      pipeline: pipeline.into(),
      state: RunState::Idle,
      history: vec![RunState::Idle],
    }
  }

  pub fn state(&self) -> &RunState {
    &self.state
  }

  pub fn history(&self) -> &[RunState] {
    &self.history
  }

  pub fn fire(&mut self, event: RunEvent) -> Result<&RunState, InvalidTransition> {
    let next = self.state.next(&event)?;
    info!(pipeline = %self.pipeline, from = self.state.name(), to = %next, "run transition");
    self.history.push(next.clone());
    self.state = next;
    Ok(&self.state)
  }

  pub fn into_parts(self) -> (RunState, Vec<RunState>) {
    (self.state, self.history)
  }
}
