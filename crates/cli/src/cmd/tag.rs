use anyhow::{Context, Result};

use deckhand_lib::revision::Revision;

use crate::output::print_stat;

pub fn cmd_tag(revision: &str) -> Result<()> {
  let revision = Revision::parse(revision).context("Invalid revision")?;
  let tag = revision.short_tag();

  println!("{}", tag);
  print_stat("Branch", &tag.branch_name());
  Ok(())
}
