//! Implementation of the `deckhand render` command.
//!
//! Writes `pipeline.json` plus one `<job>.buildspec.yml` per job into the
//! output directory, and `<job>.sh` when `--script` is given.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use deckhand_lib::render::{buildspec, pipeline_document, script};

use super::{load_pipeline, load_store, resolve_definitions};
use crate::output::{print_stat, print_success};

fn write(path: &Path, content: &str) -> Result<()> {
  fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
  info!(path = %path.display(), "wrote file");
  Ok(())
}

pub fn cmd_render(file: &Path, params: Option<&Path>, service: &str, out: &Path, with_script: bool) -> Result<()> {
  let store = load_store(params)?;
  let pipeline = load_pipeline(file)?;
  let definitions = resolve_definitions(&pipeline, store.as_ref(), Some(service))?;

  fs::create_dir_all(out).with_context(|| format!("Failed to create output directory: {}", out.display()))?;

  for definition in &definitions {
    let plan = definition
      .plan()
      .with_context(|| format!("Invalid plan for {}", definition.name()))?;

    let document = pipeline_document(&plan).context("Failed to render pipeline document")?;
    let json = serde_json::to_string_pretty(&document).context("Failed to serialize pipeline document")?;
    write(&out.join("pipeline.json"), &json)?;

    let mut written = 1;
    for job in plan.jobs() {
      let spec = buildspec(job).with_context(|| format!("Failed to render buildspec for {}", job.name))?;
      write(&out.join(format!("{}.buildspec.yml", job.name)), &spec)?;
      written += 1;

      if with_script {
        let body = script(job).with_context(|| format!("Failed to render script for {}", job.name))?;
        write(&out.join(format!("{}.sh", job.name)), &body)?;
        written += 1;
      }
    }

    print_success(&format!("Rendered {}", plan.name));
    print_stat("Files", &written.to_string());
    print_stat("Output", &out.display().to_string());
  }

  Ok(())
}
