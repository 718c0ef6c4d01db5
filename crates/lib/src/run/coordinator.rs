//! Routes push events to pipelines and keeps runs of one pipeline in line.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, watch};
use tracing::{debug, info, warn};

use super::{Cancellation, ExecuteConfig, JobExecutor, RunError, RunResult, execute_run};
use crate::pipeline::{PipelineDefinition, PushEvent};
use crate::revision::Revision;

/// Per-pipeline run slot.
struct Lane {
  run_lock: AsyncMutex<()>,
  generation: watch::Sender<u64>,
}

impl Lane {
  fn new() -> Self {
    let (generation, _) = watch::channel(0);
    Self {
      run_lock: AsyncMutex::new(()),
      generation,
    }
  }
}

/// Dispatches runs for a set of pipelines.
///
/// With `serialize_runs` at most one run per pipeline is in flight; later
/// runs wait. With `cancel_superseded` a new run cancels the one in flight
/// and any run still waiting.
pub struct Coordinator<E: JobExecutor> {
  executor: Arc<E>,
  config: ExecuteConfig,
  pipelines: Vec<Arc<PipelineDefinition>>,
  lanes: Mutex<HashMap<String, Arc<Lane>>>,
}

impl<E: JobExecutor> Coordinator<E> {
  pub fn new(executor: Arc<E>, config: ExecuteConfig, pipelines: Vec<PipelineDefinition>) -> Self {
    Self {
      executor,
      config,
      pipelines: pipelines.into_iter().map(Arc::new).collect(),
      lanes: Mutex::new(HashMap::new()),
    }
  }

  pub fn pipelines(&self) -> &[Arc<PipelineDefinition>] {
    &self.pipelines
  }

  /// Pipelines whose trigger matches `event`.
  pub fn route(&self, event: &PushEvent) -> Vec<Arc<PipelineDefinition>> {
    self
      .pipelines
      .iter()
      .filter(|definition| definition.trigger().matches(event))
      .cloned()
      .collect()
  }

  fn lane(&self, pipeline: &str) -> Arc<Lane> {
    let mut lanes = match self.lanes.lock() {
      Ok(lanes) => lanes,
      Err(poisoned) => poisoned.into_inner(),
    };
    lanes.entry(pipeline.to_string()).or_insert_with(|| Arc::new(Lane::new())).clone()
  }

  /// Start a run of `definition` for `revision`, honoring its run flags.
  pub async fn run(&self, definition: &PipelineDefinition, revision: Revision) -> Result<RunResult, RunError> {
    let name = definition.name();
    let features = definition.features();
    let lane = self.lane(&name);

    let cancel = if features.cancel_superseded {
      let mut generation = 0;
      lane.generation.send_modify(|current| {
        *current += 1;
        generation = *current;
      });
      debug!(pipeline = %name, generation, "claimed run generation");
      Cancellation::new(lane.generation.subscribe(), generation)
    } else {
      Cancellation::never()
    };

    let _guard = if features.serialize_runs {
      let locked = tokio::select! {
        guard = lane.run_lock.lock() => Some(guard),
        _ = cancel.cancelled() => None,
      };
      if locked.is_none() {
        info!(pipeline = %name, revision = %revision, "superseded while waiting for the previous run");
      }
      locked
    } else {
      None
    };

    execute_run(definition, revision, self.executor.clone(), &self.config, cancel).await
  }

  /// Run every pipeline `event` triggers, one after another.
  pub async fn dispatch(&self, event: &PushEvent) -> Vec<Result<RunResult, RunError>> {
    let matched = self.route(event);
    if matched.is_empty() {
      warn!(owner = %event.owner, repo = %event.repo, branch = %event.branch, "no pipeline matches push");
    }

    let mut results = Vec::with_capacity(matched.len());
    for definition in matched {
      info!(pipeline = %definition.name(), revision = %event.revision, "push triggered run");
      results.push(self.run(&definition, event.revision.clone()).await);
    }
    results
  }
}
