//! Pipeline run execution.
//!
//! [`execute_run`] walks the stage graph wave by wave:
//!
//! 1. Source: fetch the revision.
//! 2. Build: every image build job at once, bounded by
//!    [`ExecuteConfig::parallelism`]. The first failure aborts the rest.
//! 3. PrepareDeploy: only once every build succeeded.
//!
//! A failure ends the run in `Failed` with the stage that failed; everything
//! that did not run is recorded as skipped. There is no resume: recovery is
//! a new run.

mod coordinator;
mod executor;
mod local;
mod shell;
mod state;
mod types;

pub use coordinator::*;
pub use executor::*;
pub use local::*;
pub use shell::{ShellError, StepEnv, forwarded_env, run_shell};
pub use state::*;
pub use types::*;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Semaphore, watch};
use tokio::task::{self, JoinSet};
use tracing::{error, info, warn};

use crate::pipeline::{PipelineDefinition, PipelinePlan, StageGraph, StageKind, StageNode};
use crate::revision::Revision;
use crate::step::JobSpec;

/// Signals that a newer run took over.
///
/// Holds the generation it was issued for; the run is cancelled once the
/// shared generation moves past it.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
  rx: Option<watch::Receiver<u64>>,
  generation: u64,
}

impl Cancellation {
  /// A token that is never cancelled.
  pub fn never() -> Self {
    Self::default()
  }

  /// A token for `generation`, cancelled once `rx` moves past it.
  pub fn new(rx: watch::Receiver<u64>, generation: u64) -> Self {
    Self {
      rx: Some(rx),
      generation,
    }
  }

  pub fn is_cancelled(&self) -> bool {
    self.rx.as_ref().is_some_and(|rx| *rx.borrow() != self.generation)
  }

  /// Resolves once cancelled. Never resolves for [`Cancellation::never`].
  pub async fn cancelled(&self) {
    let Some(rx) = &self.rx else {
      return std::future::pending().await;
    };
    let mut rx = rx.clone();
    loop {
      if *rx.borrow_and_update() != self.generation {
        return;
      }
      if rx.changed().await.is_err() {
        return std::future::pending().await;
      }
    }
  }
}

enum WaveOutcome {
  Completed(Vec<JobReport>),
  Failed {
    completed: Vec<JobReport>,
    failure: JobFailure,
    aborted: Vec<String>,
  },
  Cancelled {
    completed: Vec<JobReport>,
    aborted: Vec<String>,
  },
}

/// Run every job of one wave concurrently.
async fn run_wave<E: JobExecutor>(
  jobs: Vec<JobSpec>,
  executor: &Arc<E>,
  ctx: &Arc<RunContext>,
  semaphore: &Arc<Semaphore>,
  cancel: &Cancellation,
) -> WaveOutcome {
  let mut pending: Vec<String> = jobs.iter().map(|job| job.name.clone()).collect();
  let mut join_set = JoinSet::new();
  let mut names: HashMap<task::Id, String> = HashMap::new();

  for job in jobs {
    let executor = executor.clone();
    let ctx = ctx.clone();
    let semaphore = semaphore.clone();

    let name = job.name.clone();
    let handle = join_set.spawn(async move {
      let result = match semaphore.acquire_owned().await {
        Ok(_permit) => executor.run_job(&job, &ctx).await,
        Err(_) => Err(JobError::for_job(&job, "scheduler closed")),
      };
      (job.name, result)
    });
    names.insert(handle.id(), name);
  }

  let mut completed = Vec::new();
  let mut failure = None;
  let mut cancelled = false;

  loop {
    tokio::select! {
      next = join_set.join_next() => match next {
        None => break,
        Some(Ok((name, Ok(report)))) => {
          info!(job = %name, "job succeeded");
          pending.retain(|p| p != &name);
          completed.push(report);
        }
        Some(Ok((name, Err(err)))) => {
          error!(job = %name, class = %err.class(), error = %err, "job failed");
          pending.retain(|p| p != &name);
          failure = Some(JobFailure::new(name, &err));
          break;
        }
        Some(Err(join_err)) => {
          let name = names.get(&join_err.id()).cloned().unwrap_or_default();
          error!(job = %name, error = %join_err, "job task panicked");
          pending.retain(|p| p != &name);
          failure = Some(JobFailure {
            job: name,
            class: crate::error::ErrorClass::Build,
            message: join_err.to_string(),
          });
          break;
        }
      },
      _ = cancel.cancelled() => {
        cancelled = true;
        break;
      }
    }
  }

  if failure.is_some() || cancelled {
    join_set.abort_all();
    while let Some(joined) = join_set.join_next().await {
      if let Ok((name, Ok(report))) = joined {
        pending.retain(|p| p != &name);
        completed.push(report);
      }
    }
    if !pending.is_empty() {
      warn!(jobs = ?pending, "aborted remaining jobs");
    }
  }

  match (failure, cancelled) {
    (Some(failure), _) => WaveOutcome::Failed {
      completed,
      failure,
      aborted: pending,
    },
    (None, true) => WaveOutcome::Cancelled {
      completed,
      aborted: pending,
    },
    (None, false) => WaveOutcome::Completed(completed),
  }
}

fn wave_jobs(plan: &PipelinePlan, wave: &[StageNode]) -> Vec<JobSpec> {
  wave
    .iter()
    .filter_map(|node| match node {
      StageNode::Build(name) => plan.job(name).cloned(),
      StageNode::PrepareDeploy => plan.deploy_job().cloned(),
      StageNode::Source => None,
    })
    .collect()
}

fn node_name(plan: &PipelinePlan, node: &StageNode) -> String {
  match node {
    StageNode::Source => crate::pipeline::SOURCE_ACTION.to_string(),
    StageNode::Build(name) => name.clone(),
    StageNode::PrepareDeploy => plan.deploy_job().map(|job| job.name.clone()).unwrap_or_default(),
  }
}

/// Execute one run of `definition` for `revision`.
///
/// Job failures end the run in `Failed` and are reported in the result;
/// `Err` means the run could not be executed at all.
pub async fn execute_run<E: JobExecutor>(
  definition: &PipelineDefinition,
  revision: Revision,
  executor: Arc<E>,
  config: &ExecuteConfig,
  cancel: Cancellation,
) -> Result<RunResult, RunError> {
  let plan = definition.plan()?;
  let graph = StageGraph::from_plan(&plan)?;
  let tag = revision.short_tag();
  let semaphore = Arc::new(Semaphore::new(config.parallelism.max(1)));

  let mut tracker = RunTracker::new(&plan.name);
  let mut jobs = Vec::new();
  let mut failed = None;
  let mut skipped = Vec::new();
  let mut ctx: Option<Arc<RunContext>> = None;

  info!(pipeline = %plan.name, revision = %revision, tag = %tag, "starting run");

  let waves = graph.waves();
  for (index, wave) in waves.iter().enumerate() {
    let Some(stage) = wave.first().map(StageNode::stage) else {
      continue;
    };

    if !tracker.state().is_terminal() && cancel.is_cancelled() {
      info!(pipeline = %plan.name, stage = %stage, "run superseded");
      tracker.fire(RunEvent::Superseded)?;
    }
    if tracker.state().is_terminal() {
      skipped.extend(waves[index..].iter().flatten().map(|node| node_name(&plan, node)));
      break;
    }

    match stage {
      StageKind::Source => {
        tracker.fire(RunEvent::Triggered)?;
        let result = match plan.source() {
          Some(source) => executor.fetch_source(source, &revision).await,
          None => Err(JobError::Source {
            message: "plan has no source action".to_string(),
          }),
        };
        match result {
          Ok(artifact) => {
            ctx = Some(Arc::new(RunContext {
              pipeline: plan.name.clone(),
              revision: revision.clone(),
              tag: tag.clone(),
              source: artifact,
            }));
            tracker.fire(RunEvent::SourceReady)?;
          }
          Err(err) => {
            error!(pipeline = %plan.name, error = %err, "source stage failed");
            let failure = JobFailure::new(crate::pipeline::SOURCE_ACTION, &err);
            tracker.fire(RunEvent::StageFailed {
              stage,
              cause: FailureCause::Error {
                class: failure.class,
                message: failure.message.clone(),
              },
            })?;
            failed = Some(failure);
          }
        }
      }
      StageKind::Build | StageKind::PrepareDeploy => {
        let Some(ctx) = ctx.clone() else {
          continue;
        };
        let outcome = run_wave(wave_jobs(&plan, wave), &executor, &ctx, &semaphore, &cancel).await;
        match outcome {
          WaveOutcome::Completed(reports) => {
            jobs.extend(reports);
            tracker.fire(match stage {
              StageKind::Build => RunEvent::BuildsSucceeded,
              _ => RunEvent::DeployPrepared,
            })?;
          }
          WaveOutcome::Failed {
            completed,
            failure,
            aborted,
          } => {
            jobs.extend(completed);
            skipped.extend(aborted);
            tracker.fire(RunEvent::StageFailed {
              stage,
              cause: FailureCause::Error {
                class: failure.class,
                message: failure.message.clone(),
              },
            })?;
            failed = Some(failure);
          }
          WaveOutcome::Cancelled { completed, aborted } => {
            jobs.extend(completed);
            skipped.extend(aborted);
            info!(pipeline = %plan.name, stage = %stage, "run superseded");
            tracker.fire(RunEvent::Superseded)?;
          }
        }
      }
    }
  }

  let (state, history) = tracker.into_parts();
  match &state {
    RunState::Succeeded => info!(pipeline = %plan.name, tag = %tag, "run succeeded"),
    other => warn!(pipeline = %plan.name, tag = %tag, state = %other, "run did not succeed"),
  }

  Ok(RunResult {
    pipeline: plan.name,
    revision,
    tag,
    state,
    history,
    jobs,
    failed,
    skipped,
  })
}
