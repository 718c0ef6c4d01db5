//! Implementation of the `deckhand validate` command.
//!
//! Resolves every service of a pipeline file against the parameter store and
//! checks that each plan renders, without running anything.

use std::path::Path;

use anyhow::{Context, Result};

use deckhand_lib::pipeline::StageGraph;
use deckhand_lib::render::pipeline_document;

use super::{load_pipeline, load_store, resolve_definitions};
use crate::output::print_success;

pub fn cmd_validate(file: &Path, params: Option<&Path>) -> Result<()> {
  let store = load_store(params)?;
  let pipeline = load_pipeline(file)?;
  let definitions = resolve_definitions(&pipeline, store.as_ref(), None)?;

  for definition in &definitions {
    let name = definition.name();
    let plan = definition.plan().with_context(|| format!("Invalid plan for {}", name))?;
    StageGraph::from_plan(&plan).with_context(|| format!("Invalid stage graph for {}", name))?;
    pipeline_document(&plan).with_context(|| format!("Failed to render {}", name))?;

    print_success(&format!(
      "{}: {} image build(s), deploy to {}",
      name,
      definition.builds().len(),
      definition.deploy().ops_repo.slug()
    ));
  }

  Ok(())
}
