mod descriptor;
mod plan;
mod render;
mod run;
mod tag;
mod validate;

pub use descriptor::cmd_descriptor;
pub use plan::cmd_plan;
pub use render::cmd_render;
pub use run::{RunArgs, cmd_run};
pub use tag::cmd_tag;
pub use validate::cmd_validate;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};

use deckhand_lib::config::PipelineFile;
use deckhand_lib::params::{FileStore, MemoryStore, ParameterStore};
use deckhand_lib::pipeline::PipelineDefinition;

/// Parameter store backing `--params`; empty when no file is given.
pub(crate) fn load_store(params: Option<&Path>) -> Result<Arc<dyn ParameterStore>> {
  match params {
    Some(path) => {
      let store = FileStore::load(path).with_context(|| format!("Failed to load parameters: {}", path.display()))?;
      Ok(Arc::new(store))
    }
    None => Ok(Arc::new(MemoryStore::new())),
  }
}

pub(crate) fn load_pipeline(file: &Path) -> Result<PipelineFile> {
  PipelineFile::load(file).with_context(|| format!("Failed to load pipeline file: {}", file.display()))
}

/// Resolve the definitions of `file`, or only `service` when given.
pub(crate) fn resolve_definitions(
  pipeline: &PipelineFile,
  store: &dyn ParameterStore,
  service: Option<&str>,
) -> Result<Vec<PipelineDefinition>> {
  let resolver = pipeline.resolver(store);
  match service {
    Some(name) => {
      let definition = pipeline
        .definition(name, &resolver)
        .ok_or_else(|| anyhow!("No service named '{}'", name))?
        .with_context(|| format!("Invalid service '{}'", name))?;
      Ok(vec![definition])
    }
    None => pipeline.definitions(&resolver).context("Invalid pipeline file"),
  }
}
