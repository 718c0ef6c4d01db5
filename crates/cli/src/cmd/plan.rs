//! Implementation of the `deckhand plan` command.
//!
//! Shows each pipeline's trigger, stages and jobs. With `--format json` the
//! plans are printed as they are handed to a backend.

use std::path::Path;

use anyhow::{Context, Result};
use owo_colors::{OwoColorize, Stream};

use deckhand_lib::pipeline::{ActionKind, PipelinePlan};
use deckhand_lib::util::hash::Fingerprintable;

use super::{load_pipeline, load_store, resolve_definitions};
use crate::output::{OutputFormat, print_json, print_stat, symbols};

pub fn cmd_plan(file: &Path, params: Option<&Path>, service: Option<&str>, format: OutputFormat, verbose: bool) -> Result<()> {
  let store = load_store(params)?;
  let pipeline = load_pipeline(file)?;
  let definitions = resolve_definitions(&pipeline, store.as_ref(), service)?;

  let plans = definitions
    .iter()
    .map(|definition| {
      definition
        .plan()
        .with_context(|| format!("Invalid plan for {}", definition.name()))
    })
    .collect::<Result<Vec<_>>>()?;

  if format.is_json() {
    return print_json(&plans);
  }

  for (index, plan) in plans.iter().enumerate() {
    if index > 0 {
      println!();
    }
    print_plan(plan, verbose)?;
  }
  Ok(())
}

fn print_plan(plan: &PipelinePlan, verbose: bool) -> Result<()> {
  let fingerprint = plan.fingerprint().context("Failed to fingerprint plan")?;

  println!("{}", plan.name.if_supports_color(Stream::Stdout, |s| s.bold()));
  print_stat("Fingerprint", fingerprint.short());
  print_stat(
    "Trigger",
    &format!("push to {}/{}@{}", plan.trigger.owner, plan.trigger.repo, plan.trigger.branch),
  );
  if !plan.trigger.pull_requests.is_empty() {
    let actions: Vec<_> = plan.trigger.pull_requests.iter().map(|a| a.event_name()).collect();
    print_stat("Pull requests", &actions.join(", "));
  }

  for stage in &plan.stages {
    println!("  {} {}", symbols::ARROW, stage.kind);
    for action in &stage.actions {
      match &action.kind {
        ActionKind::Source(source) => println!("      {} {} ({})", symbols::INFO, action.name, source.slug()),
        ActionKind::Job(job) => {
          println!("      {} {} ({} steps)", symbols::INFO, action.name, job.steps.len());
          if verbose {
            for step in &job.steps {
              println!(
                "          {}",
                format!("{}: {}", step.phase(), step.name()).if_supports_color(Stream::Stdout, |s| s.dimmed())
              );
            }
          }
        }
      }
    }
  }
  Ok(())
}
