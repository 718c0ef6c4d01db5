//! Implementation of the `deckhand descriptor` command.

use std::path::Path;

use anyhow::{Context, Result, bail};

use deckhand_lib::deploy::ContainerBinding;
use deckhand_lib::descriptor::rewrite_file;

use crate::output::{print_info, print_success};

/// Parse `name=repository`; a bare `name` binds to the repository of the same name.
fn parse_binding(value: &str) -> Result<ContainerBinding> {
  let (name, repository) = value.split_once('=').unwrap_or((value, value));
  if name.is_empty() || repository.is_empty() {
    bail!("Invalid container binding '{}', expected name=repository", value);
  }
  Ok(ContainerBinding::new(name, repository))
}

pub fn cmd_descriptor(file: &Path, tag: &str, registry: &str, containers: &[String]) -> Result<()> {
  let bindings = containers
    .iter()
    .map(|value| parse_binding(value))
    .collect::<Result<Vec<_>>>()?;

  let changed = rewrite_file(file, &bindings, registry, tag)
    .with_context(|| format!("Failed to rewrite descriptor: {}", file.display()))?;

  if changed {
    print_success(&format!("Updated {} to tag {}", file.display(), tag));
  } else {
    print_info(&format!("{} already points at tag {}", file.display(), tag));
  }
  Ok(())
}
