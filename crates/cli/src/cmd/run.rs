//! Implementation of the `deckhand run` command.
//!
//! Runs pipelines locally: image builds through the shell, deploy
//! preparation through `git` and `gh`. A revision runs one service; a push
//! event runs every pipeline it triggers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, anyhow, bail};

use deckhand_lib::deploy::GitCli;
use deckhand_lib::pipeline::PushEvent;
use deckhand_lib::revision::Revision;
use deckhand_lib::run::{Coordinator, ExecuteConfig, LocalExecutor, RunResult};

use super::{load_pipeline, load_store, resolve_definitions};
use crate::output::{OutputFormat, format_duration, print_error, print_json, print_stat, print_success, print_warning};

pub struct RunArgs {
  pub file: PathBuf,
  pub params: Option<PathBuf>,
  pub service: Option<String>,
  pub revision: Option<String>,
  pub event: Option<PathBuf>,
  pub workspace: Option<PathBuf>,
  pub source: Option<PathBuf>,
  pub parallelism: Option<usize>,
  pub format: OutputFormat,
}

pub fn cmd_run(args: RunArgs) -> Result<()> {
  let store = load_store(args.params.as_deref())?;
  let pipeline = load_pipeline(&args.file)?;
  let definitions = resolve_definitions(&pipeline, store.as_ref(), args.service.as_deref())?;

  let mut config = match args.workspace {
    Some(dir) => ExecuteConfig::new(dir),
    None => ExecuteConfig::default(),
  };
  if let Some(dir) = args.source {
    config = config.with_source_dir(dir);
  }
  if let Some(parallelism) = args.parallelism {
    config = config.with_parallelism(parallelism);
  }

  let executor = Arc::new(LocalExecutor::new(GitCli::new(), store, config.clone()));
  let coordinator = Coordinator::new(executor, config, definitions);

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let started = Instant::now();

  let results = match (args.revision, args.event) {
    (Some(revision), _) => {
      let revision = Revision::parse(&revision).context("Invalid revision")?;
      let [definition] = coordinator.pipelines() else {
        bail!("--revision runs a single pipeline; pick one with --service");
      };
      vec![rt.block_on(coordinator.run(definition, revision))]
    }
    (None, Some(path)) => {
      let payload =
        std::fs::read_to_string(&path).with_context(|| format!("Failed to read event: {}", path.display()))?;
      let event = PushEvent::from_github_payload(&payload).context("Invalid push event")?;
      let results = rt.block_on(coordinator.dispatch(&event));
      if results.is_empty() {
        print_warning(&format!(
          "No pipeline is triggered by a push to {}/{}@{}",
          event.owner, event.repo, event.branch
        ));
      }
      results
    }
    (None, None) => bail!("Either --revision or --event is required"),
  };

  let results = results
    .into_iter()
    .collect::<Result<Vec<_>, _>>()
    .context("Run could not start")?;

  if args.format.is_json() {
    print_json(&results)?;
  } else {
    for result in &results {
      print_result(result);
    }
    print_stat("Elapsed", &format_duration(started.elapsed()));
  }

  let failed = results.iter().filter(|result| !result.is_success()).count();
  if failed > 0 {
    return Err(anyhow!("{} of {} run(s) did not succeed", failed, results.len()));
  }
  Ok(())
}

fn print_result(result: &RunResult) {
  if result.is_success() {
    print_success(&format!("{} succeeded for {}", result.pipeline, result.tag));
  } else {
    print_error(&format!("{}: {}", result.pipeline, result.state));
  }

  print_stat("Revision", result.revision.as_str());
  print_stat("Jobs", &result.jobs.len().to_string());

  if let Some(deploy) = result.deploy() {
    print_stat("Branch", &deploy.branch);
    print_stat("Pull request", &deploy.pull_request.url);
  }
  if let Some(failure) = &result.failed {
    print_stat("Failed job", &format!("{} ({})", failure.job, failure.class));
    print_stat("Error", &failure.message);
  }
  if !result.skipped.is_empty() {
    print_stat("Skipped", &result.skipped.join(", "));
  }
}
